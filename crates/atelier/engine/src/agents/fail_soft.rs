//! Critic wrapper that keeps a failed review from failing the run

use super::{panic_message, Agent};
use crate::cancel::CancelSignal;
use async_trait::async_trait;
use atelier_types::{AgentRole, Critique, WorkflowContext, WorkflowResult};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::warn;

/// Runs the inner critic. An error or panic is replaced by a default-ok
/// critique so the run continues to the human gate.
pub struct FailSoftCritic {
    inner: Arc<dyn Agent>,
}

impl FailSoftCritic {
    pub fn new(inner: Arc<dyn Agent>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Agent for FailSoftCritic {
    fn role(&self) -> AgentRole {
        AgentRole::Critic
    }

    async fn run(&self, ctx: &mut WorkflowContext, cancel: &CancelSignal) -> WorkflowResult<()> {
        let failure = match AssertUnwindSafe(self.inner.run(ctx, cancel))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => e.to_string(),
            Err(panic) => format!("critic panicked: {}", panic_message(panic.as_ref())),
        };

        warn!(run_id = %ctx.run_id, "Critic failed, proceeding with default critique: {}", failure);
        let cost = ctx
            .plan
            .as_ref()
            .map(|p| p.estimated_cost_usd)
            .unwrap_or(0.0);
        ctx.critique = Some(Critique::default_ok(cost, format!("critic unavailable: {failure}")));
        Ok(())
    }
}
