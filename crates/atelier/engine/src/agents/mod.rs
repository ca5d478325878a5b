//! Agents: the units of work behind each routing rule
//!
//! An agent receives a working copy of the run context, mutates the fields
//! it owns and returns. It never changes `state` or `locked`; the
//! orchestrator does that around the call.

mod critic;
mod executor;
mod fail_soft;
mod guarded;
mod planner;

pub use critic::CriticAgent;
pub use executor::ExecutorAgent;
pub use fail_soft::FailSoftCritic;
pub use guarded::{ExecutionGuard, GuardedAgent, PhaseGuard};
pub use planner::{PlannerAgent, PLANNER_BREAKER};

use crate::cancel::CancelSignal;
use async_trait::async_trait;
use atelier_types::{AgentRole, WorkflowContext, WorkflowResult};
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

#[async_trait]
pub trait Agent: Send + Sync {
    fn role(&self) -> AgentRole;

    /// Do this agent's part of the run. `cancel` is a cooperative stop
    /// request; long-running agents check it between units of work.
    async fn run(&self, ctx: &mut WorkflowContext, cancel: &CancelSignal) -> WorkflowResult<()>;
}

/// Agents keyed by role
#[derive(Clone, Default)]
pub struct AgentRegistry {
    agents: HashMap<AgentRole, Arc<dyn Agent>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent under its own role, replacing any previous one
    pub fn register(&mut self, agent: Arc<dyn Agent>) {
        self.agents.insert(agent.role(), agent);
    }

    pub fn with(mut self, agent: Arc<dyn Agent>) -> Self {
        self.register(agent);
        self
    }

    pub fn get(&self, role: AgentRole) -> Option<Arc<dyn Agent>> {
        self.agents.get(&role).cloned()
    }

    pub fn roles(&self) -> Vec<AgentRole> {
        self.agents.keys().copied().collect()
    }
}

/// Best-effort text of a caught panic payload
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("roles", &self.roles())
            .finish()
    }
}
