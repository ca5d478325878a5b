//! Agent roles and parallel-executor tasks

use crate::state::WorkflowState;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// The three agent capabilities a run is driven by
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Planner,
    Critic,
    Executor,
}

impl AgentRole {
    /// State held while this role is working
    pub fn working_state(&self) -> WorkflowState {
        match self {
            AgentRole::Planner => WorkflowState::Planning,
            AgentRole::Critic => WorkflowState::Critiquing,
            AgentRole::Executor => WorkflowState::Executing,
        }
    }
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentRole::Planner => write!(f, "planner"),
            AgentRole::Critic => write!(f, "critic"),
            AgentRole::Executor => write!(f, "executor"),
        }
    }
}

/// A schedulable unit of work with explicit dependency edges
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentTask {
    pub id: String,
    pub agent_role: AgentRole,
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Higher runs first within a ready set
    #[serde(default)]
    pub priority: i32,
    pub timeout_ms: u64,
    #[serde(default)]
    pub retryable: bool,
    /// A failed critical task halts the remaining schedule
    #[serde(default)]
    pub critical: bool,
}

impl AgentTask {
    pub fn new(id: impl Into<String>, agent_role: AgentRole) -> Self {
        Self {
            id: id.into(),
            agent_role,
            dependencies: Vec::new(),
            priority: 0,
            timeout_ms: 60_000,
            retryable: true,
            critical: false,
        }
    }

    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.dependencies.push(id.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn critical(mut self, critical: bool) -> Self {
        self.critical = critical;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_working_states() {
        assert_eq!(AgentRole::Planner.working_state(), WorkflowState::Planning);
        assert_eq!(AgentRole::Critic.working_state(), WorkflowState::Critiquing);
        assert_eq!(AgentRole::Executor.working_state(), WorkflowState::Executing);
    }

    #[test]
    fn test_task_builder() {
        let task = AgentTask::new("c", AgentRole::Executor)
            .depends_on("a")
            .depends_on("b")
            .with_timeout(Duration::from_secs(2))
            .critical(true);
        assert_eq!(task.dependencies, vec!["a", "b"]);
        assert_eq!(task.timeout(), Duration::from_secs(2));
        assert!(task.critical);
        assert!(task.retryable);
    }
}
