//! Run lifecycle states

use serde::{Deserialize, Serialize};

/// Where a run currently sits in the Plan → Critique → Execute pipeline.
///
/// The `-ING` states are held only while a transition is in flight (the
/// context is locked); every other state is a resting point between calls
/// to `advance()`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowState {
    Created,
    Planning,
    Planned,
    Critiquing,
    Critiqued,
    /// Waiting for a human decision
    Proposed,
    Approved,
    Executing,
    Completed,
    Failed,
    Stopped,
    Cancelled,
}

impl WorkflowState {
    /// Terminal states accept no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowState::Completed
                | WorkflowState::Failed
                | WorkflowState::Stopped
                | WorkflowState::Cancelled
        )
    }

    /// Transient states exist only for the duration of one transition
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            WorkflowState::Planning | WorkflowState::Critiquing | WorkflowState::Executing
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowState::Created => "CREATED",
            WorkflowState::Planning => "PLANNING",
            WorkflowState::Planned => "PLANNED",
            WorkflowState::Critiquing => "CRITIQUING",
            WorkflowState::Critiqued => "CRITIQUED",
            WorkflowState::Proposed => "PROPOSED",
            WorkflowState::Approved => "APPROVED",
            WorkflowState::Executing => "EXECUTING",
            WorkflowState::Completed => "COMPLETED",
            WorkflowState::Failed => "FAILED",
            WorkflowState::Stopped => "STOPPED",
            WorkflowState::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
