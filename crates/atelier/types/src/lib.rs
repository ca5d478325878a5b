//! Domain types for Atelier runs
//!
//! A run is a [`WorkflowContext`] that moves through a
//! Plan → Critique → (human approval) → Execute pipeline. This crate
//! holds the data that flows between the guardrail engine, the resilience
//! wrappers and the orchestrator, and nothing that performs work.
//!
//! - [`WorkflowContext`]: the single mutable record of a run
//! - [`Plan`] / [`Step`] / [`DeterminismBlock`]: what the planner proposes
//! - [`Critique`] / [`GuardrailIssue`]: what the critic found
//! - [`RunResult`]: what the executor produced
//! - [`AgentTask`]: a schedulable unit for the parallel executor
//! - [`WorkflowEvent`]: what observers receive
//! - [`WorkflowError`], [`GuardrailError`], [`ToolError`]: the error taxonomy

#![deny(unsafe_code)]

pub mod context;
pub mod critique;
pub mod error;
pub mod event;
pub mod ids;
pub mod plan;
pub mod result;
pub mod state;
pub mod task;

pub use context::{RunSnapshot, TransitionRecord, WorkflowContext};
pub use critique::{Critique, GuardrailIssue, Severity};
pub use error::{
    Classify, ErrorKind, GuardrailCode, GuardrailError, ToolError, WorkflowError, WorkflowResult,
};
pub use event::{EventType, WorkflowEvent};
pub use ids::RunId;
pub use plan::{DeterminismBlock, Params, Plan, Step};
pub use result::{RunResult, StepFailure, StepOutput};
pub use state::WorkflowState;
pub use task::{AgentRole, AgentTask};
