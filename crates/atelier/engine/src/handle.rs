//! Shared handle to a run's context
//!
//! The context sits behind a short-held mutex that is never held across an
//! await. The `locked` flag on the context, not the mutex, is what marks a
//! transition as in flight.

use crate::cancel::CancelSignal;
use atelier_types::{RunId, RunSnapshot, WorkflowContext};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Clone, Debug)]
pub struct RunHandle {
    run_id: RunId,
    ctx: Arc<Mutex<WorkflowContext>>,
    cancel: CancelSignal,
}

impl RunHandle {
    pub fn new(ctx: WorkflowContext) -> Self {
        Self {
            run_id: ctx.run_id.clone(),
            ctx: Arc::new(Mutex::new(ctx)),
            cancel: CancelSignal::new(),
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn cancel_signal(&self) -> &CancelSignal {
        &self.cancel
    }

    /// Lock the context. A poisoned lock is recovered: the context is plain
    /// data and every writer leaves it consistent.
    pub(crate) fn lock(&self) -> MutexGuard<'_, WorkflowContext> {
        self.ctx.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Clone of the current context
    pub fn context(&self) -> WorkflowContext {
        self.lock().clone()
    }

    pub fn snapshot(&self) -> RunSnapshot {
        self.lock().snapshot()
    }

    /// Read the context without cloning it
    pub fn read<R>(&self, f: impl FnOnce(&WorkflowContext) -> R) -> R {
        f(&self.lock())
    }
}
