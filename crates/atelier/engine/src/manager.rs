//! Run manager: owns the orchestrator, the live handles and the store
//!
//! Callers address runs by id. Every operation that can change a run
//! writes its latest context back to the [`RunStore`]; store failures are
//! logged and never fail the operation itself.

use crate::events::Subscription;
use crate::handle::RunHandle;
use crate::orchestrator::{AdvanceOutcome, Orchestrator};
use crate::store::RunStore;
use atelier_types::{
    EventType, Plan, RunId, RunSnapshot, WorkflowContext, WorkflowError, WorkflowResult,
};
use dashmap::DashMap;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct RunManager {
    orchestrator: Arc<Orchestrator>,
    store: Arc<dyn RunStore>,
    handles: DashMap<RunId, RunHandle>,
    poll_interval: Duration,
}

impl RunManager {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        store: Arc<dyn RunStore>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            orchestrator,
            store,
            handles: DashMap::new(),
            poll_interval,
        }
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    /// Number of runs with a live handle in this process
    pub fn active_runs(&self) -> usize {
        self.handles.len()
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Create a run in CREATED and persist it
    pub async fn submit(&self, input_data: Value, metadata: Map<String, Value>) -> RunId {
        let mut ctx = WorkflowContext::new(input_data);
        ctx.metadata = metadata;
        let run_id = ctx.run_id.clone();
        info!(run_id = %run_id, intent = ?ctx.intent(), "Run submitted");

        let handle = RunHandle::new(ctx);
        self.handles.insert(run_id.clone(), handle.clone());
        self.persist(&handle).await;
        self.orchestrator.events().emit(
            EventType::StateChanged,
            &run_id,
            json!({"from": Value::Null, "to": handle.read(|c| c.state)}),
        );
        run_id
    }

    /// Live handle for a run, loading it from the store if this process has
    /// not seen it yet
    pub async fn handle(&self, run_id: &RunId) -> WorkflowResult<RunHandle> {
        if let Some(handle) = self.handles.get(run_id) {
            return Ok(handle.clone());
        }

        let mut ctx = self
            .store
            .get(run_id)
            .await?
            .ok_or_else(|| WorkflowError::RunNotFound(run_id.clone()))?;
        if ctx.locked {
            // Persisted mid-transition by a process that no longer drives it
            warn!(run_id = %run_id, state = %ctx.state, "Loaded run was locked, clearing");
            ctx.locked = false;
        }
        debug!(run_id = %run_id, state = %ctx.state, "Run loaded from store");

        let handle = self
            .handles
            .entry(run_id.clone())
            .or_insert_with(|| RunHandle::new(ctx))
            .clone();
        Ok(handle)
    }

    pub async fn advance(
        &self,
        run_id: &RunId,
        human_approved: bool,
    ) -> WorkflowResult<AdvanceOutcome> {
        let handle = self.handle(run_id).await?;
        let outcome = self.orchestrator.advance(&handle, human_approved).await;
        // The transition in flight persists its own settled context
        if outcome != AdvanceOutcome::Busy {
            self.persist(&handle).await;
        }
        Ok(outcome)
    }

    /// Advance until the run finishes, parks for approval, or fails,
    /// persisting after every step
    pub async fn run_until_settled(
        &self,
        run_id: &RunId,
        human_approved: bool,
    ) -> WorkflowResult<AdvanceOutcome> {
        let bound = self.orchestrator.routing().rules().len() + 1;
        let mut outcome = self.advance(run_id, human_approved).await?;
        for _ in 0..bound {
            if !outcome.can_continue() {
                break;
            }
            outcome = self.advance(run_id, human_approved).await?;
        }
        Ok(outcome)
    }

    pub async fn approve(
        &self,
        run_id: &RunId,
        override_plan: Option<Plan>,
    ) -> WorkflowResult<AdvanceOutcome> {
        let handle = self.handle(run_id).await?;
        let outcome = self.orchestrator.approve(&handle, override_plan).await?;
        self.persist(&handle).await;
        Ok(outcome)
    }

    /// See [`Orchestrator::stop`]
    pub async fn stop(&self, run_id: &RunId) -> WorkflowResult<bool> {
        let handle = self.handle(run_id).await?;
        let immediate = self.orchestrator.stop(&handle)?;
        if immediate {
            self.persist(&handle).await;
        }
        Ok(immediate)
    }

    /// See [`Orchestrator::cancel`]
    pub async fn cancel(&self, run_id: &RunId) -> WorkflowResult<bool> {
        let handle = self.handle(run_id).await?;
        let immediate = self.orchestrator.cancel(&handle)?;
        if immediate {
            self.persist(&handle).await;
        }
        Ok(immediate)
    }

    pub async fn snapshot(&self, run_id: &RunId) -> WorkflowResult<RunSnapshot> {
        if let Some(handle) = self.handles.get(run_id) {
            return Ok(handle.snapshot());
        }
        self.store
            .get(run_id)
            .await?
            .map(|ctx| ctx.snapshot())
            .ok_or_else(|| WorkflowError::RunNotFound(run_id.clone()))
    }

    /// Event stream for one run: live when the channel is up, otherwise
    /// polled from the store
    pub fn subscribe(&self, run_id: &RunId) -> Subscription {
        self.orchestrator
            .events()
            .subscribe_or_poll(run_id, self.store.clone(), self.poll_interval)
    }

    /// Forget a run. A run with a transition in flight is kept.
    pub async fn remove(&self, run_id: &RunId) -> WorkflowResult<bool> {
        if let Some(handle) = self.handles.get(run_id) {
            if handle.read(|ctx| ctx.locked) {
                return Err(WorkflowError::InvalidState {
                    state: handle.read(|ctx| ctx.state),
                    action: "remove",
                });
            }
        }
        let live = self.handles.remove(run_id).is_some();
        let stored = self.store.delete(run_id).await?;
        if live || stored {
            info!(run_id = %run_id, "Run removed");
        }
        Ok(live || stored)
    }

    pub async fn list(&self) -> WorkflowResult<Vec<RunId>> {
        self.store.list().await
    }

    /// Write the settled context. Mid-transition snapshots are never stored.
    async fn persist(&self, handle: &RunHandle) {
        let ctx = handle.context();
        if ctx.locked {
            debug!(run_id = %ctx.run_id, state = %ctx.state, "Transition in flight, not persisting");
            return;
        }
        if let Err(e) = self.store.set(&ctx).await {
            warn!(run_id = %ctx.run_id, state = %ctx.state, "Failed to persist run: {}", e);
        }
    }
}
