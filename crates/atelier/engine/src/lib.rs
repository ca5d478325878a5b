//! Atelier orchestration runtime
//!
//! A run moves through a routing-table state machine, one transition per
//! [`Orchestrator::advance`] call:
//!
//! ```text
//! CREATED -> PLANNED -> CRITIQUED -> (PROPOSED) -> APPROVED -> COMPLETED
//! ```
//!
//! - the Planner agent produces a locked plan (template fallback when the
//!   planner backend is down or its circuit is open),
//! - the Critic agent reviews it against the guardrails,
//! - the human gate parks the run at PROPOSED when approval is needed,
//! - the Executor agent runs the steps through the [`ParallelExecutor`]
//!   behind the execution guard, with per-operation circuit breakers.
//!
//! Every transition and step is published on the [`EventBroadcaster`];
//! the [`RunManager`] addresses runs by id and persists them to a
//! [`RunStore`].

#![deny(unsafe_code)]

pub mod agents;
pub mod backends;
pub mod cancel;
pub mod config;
pub mod error;
pub mod events;
pub mod handle;
pub mod manager;
pub mod orchestrator;
pub mod parallel;
pub mod state_machine;
pub mod store;

pub use agents::{Agent, AgentRegistry};
pub use backends::{
    EventSink, PlannerBackend, SimulatedToolBackend, TemplatePlanner, ToolExecutionBackend,
};
pub use cancel::CancelSignal;
pub use config::EngineConfig;
pub use error::{ConfigError, EventError, TaskError};
pub use events::{EventBroadcaster, EventChannel, LocalChannel, NullChannel, Subscription};
pub use handle::RunHandle;
pub use manager::RunManager;
pub use orchestrator::{AdvanceOutcome, Orchestrator, OrchestratorBuilder};
pub use parallel::{ParallelExecutor, ParallelReport, TaskOutcome, TaskStatus};
pub use state_machine::{RoutingTable, TransitionRule};
pub use store::{InMemoryRunStore, RunStore};
