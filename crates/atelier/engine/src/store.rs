//! Run persistence
//!
//! The orchestrator works on live handles; the store holds the latest
//! settled context of every run so that it can be read back (and polled)
//! independently of the process that drives it.

use async_trait::async_trait;
use atelier_types::{RunId, WorkflowContext, WorkflowResult};
use dashmap::DashMap;
use std::sync::Arc;

/// Keyed storage of run contexts
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn get(&self, run_id: &RunId) -> WorkflowResult<Option<WorkflowContext>>;

    /// Insert or replace
    async fn set(&self, ctx: &WorkflowContext) -> WorkflowResult<()>;

    /// Returns whether anything was removed
    async fn delete(&self, run_id: &RunId) -> WorkflowResult<bool>;

    async fn list(&self) -> WorkflowResult<Vec<RunId>>;
}

/// In-memory run store for development and testing
#[derive(Debug, Default, Clone)]
pub struct InMemoryRunStore {
    runs: Arc<DashMap<RunId, WorkflowContext>>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    pub fn clear(&self) {
        self.runs.clear();
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn get(&self, run_id: &RunId) -> WorkflowResult<Option<WorkflowContext>> {
        Ok(self.runs.get(run_id).map(|entry| entry.clone()))
    }

    async fn set(&self, ctx: &WorkflowContext) -> WorkflowResult<()> {
        self.runs.insert(ctx.run_id.clone(), ctx.clone());
        Ok(())
    }

    async fn delete(&self, run_id: &RunId) -> WorkflowResult<bool> {
        Ok(self.runs.remove(run_id).is_some())
    }

    async fn list(&self) -> WorkflowResult<Vec<RunId>> {
        let mut ids: Vec<RunId> = self.runs.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        Ok(ids)
    }
}
