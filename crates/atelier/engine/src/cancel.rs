//! Cooperative stop/cancel requests

use atelier_types::WorkflowState;
use std::sync::{Arc, OnceLock};

/// A one-shot request to halt a run.
///
/// Setting it does not interrupt in-flight work; executing code checks it
/// between units of work. The first request wins.
#[derive(Clone, Debug, Default)]
pub struct CancelSignal {
    requested: Arc<OnceLock<WorkflowState>>,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a halt into `state` (STOPPED or CANCELLED). Returns false if
    /// a request was already made.
    pub fn request(&self, state: WorkflowState) -> bool {
        self.requested.set(state).is_ok()
    }

    pub fn requested(&self) -> Option<WorkflowState> {
        self.requested.get().copied()
    }

    pub fn is_cancelled(&self) -> bool {
        self.requested.get().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_request_wins() {
        let signal = CancelSignal::new();
        assert!(!signal.is_cancelled());

        let clone = signal.clone();
        assert!(clone.request(WorkflowState::Stopped));
        assert!(!signal.request(WorkflowState::Cancelled));

        assert!(signal.is_cancelled());
        assert_eq!(signal.requested(), Some(WorkflowState::Stopped));
    }
}
