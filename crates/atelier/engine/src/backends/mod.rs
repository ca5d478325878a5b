//! Capability traits for everything outside the engine
//!
//! The orchestrator never talks to an LLM, a tool runner or a transport
//! directly. It is handed implementations of these traits.

mod simulated;
mod template;

pub use simulated::SimulatedToolBackend;
pub use template::{fallback_plan, TemplatePlanner};

use crate::error::EventError;
use async_trait::async_trait;
use atelier_types::{Params, Plan, ToolError, WorkflowContext, WorkflowEvent, WorkflowResult};
use serde_json::Value;

/// Produces a plan for a run
#[async_trait]
pub trait PlannerBackend: Send + Sync {
    /// Build a plan from the run's `input_data`.
    ///
    /// Failures are not fatal to the run: the planner agent falls back to
    /// the default plan.
    async fn plan(&self, ctx: &WorkflowContext) -> WorkflowResult<Plan>;

    /// Backend name for logging
    fn name(&self) -> &str;
}

/// Executes a single catalog operation
#[async_trait]
pub trait ToolExecutionBackend: Send + Sync {
    async fn execute(&self, op: &str, params: &Params) -> Result<Value, ToolError>;

    fn name(&self) -> &str;
}

/// Receives forwarded events. Best effort: errors are logged by the caller
/// and never reach the run.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn deliver(&self, event: &WorkflowEvent) -> Result<(), EventError>;
}
