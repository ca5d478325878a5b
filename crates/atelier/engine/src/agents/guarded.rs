//! Guardrail checks in front of an agent

use super::Agent;
use crate::cancel::CancelSignal;
use async_trait::async_trait;
use atelier_guard::{guarded, GuardrailEngine};
use atelier_types::{
    AgentRole, GuardrailCode, GuardrailError, WorkflowContext, WorkflowResult,
};
use std::sync::Arc;

/// A check that must pass before a phase may run
pub trait PhaseGuard: Send + Sync {
    fn check(&self, ctx: &WorkflowContext) -> Result<(), GuardrailError>;

    fn name(&self) -> &str;
}

/// Determinism lock plus full policy, re-checked immediately before
/// execution. Overridden plans get the relaxed ceiling.
pub struct ExecutionGuard {
    guardrails: Arc<GuardrailEngine>,
}

impl ExecutionGuard {
    pub fn new(guardrails: Arc<GuardrailEngine>) -> Self {
        Self { guardrails }
    }
}

impl PhaseGuard for ExecutionGuard {
    fn check(&self, ctx: &WorkflowContext) -> Result<(), GuardrailError> {
        let plan = ctx
            .plan
            .as_ref()
            .ok_or_else(|| GuardrailError::new(GuardrailCode::EmptyPlan, "no plan to execute"))?;
        self.guardrails
            .enforce_execution(plan, ctx.plan_overridden)
    }

    fn name(&self) -> &str {
        "execution"
    }
}

/// Runs `guard` before delegating to `inner`. On a violation the inner
/// agent is never invoked.
pub struct GuardedAgent {
    guard: Arc<dyn PhaseGuard>,
    inner: Arc<dyn Agent>,
}

impl GuardedAgent {
    pub fn new(guard: Arc<dyn PhaseGuard>, inner: Arc<dyn Agent>) -> Self {
        Self { guard, inner }
    }
}

#[async_trait]
impl Agent for GuardedAgent {
    fn role(&self) -> AgentRole {
        self.inner.role()
    }

    async fn run(&self, ctx: &mut WorkflowContext, cancel: &CancelSignal) -> WorkflowResult<()> {
        let check = self.guard.check(ctx);
        if let Err(e) = &check {
            tracing::warn!(
                run_id = %ctx.run_id,
                guard = self.guard.name(),
                role = %self.inner.role(),
                "Phase blocked by guardrail: {}",
                e
            );
        }
        guarded(check, move || self.inner.run(ctx, cancel)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atelier_guard::determinism;
    use atelier_types::{Plan, Step, WorkflowError};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Probe {
        ran: AtomicBool,
    }

    #[async_trait]
    impl Agent for Probe {
        fn role(&self) -> AgentRole {
            AgentRole::Executor
        }

        async fn run(&self, _ctx: &mut WorkflowContext, _cancel: &CancelSignal) -> WorkflowResult<()> {
            self.ran.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn guarded_probe() -> (Arc<Probe>, GuardedAgent) {
        let probe = Arc::new(Probe {
            ran: AtomicBool::new(false),
        });
        let guard = Arc::new(ExecutionGuard::new(Arc::new(GuardrailEngine::default())));
        (probe.clone(), GuardedAgent::new(guard, probe))
    }

    fn context_with(plan: Plan) -> WorkflowContext {
        let mut ctx = WorkflowContext::new(json!({}));
        ctx.plan = Some(plan);
        ctx
    }

    fn plan() -> Plan {
        Plan::new(vec![
            Step::new("s1", "onboard").with_param("source", "x"),
            Step::new("s2", "remove_background")
                .with_param("asset", "s1")
                .after("s1"),
        ])
        .with_cost(0.06)
    }

    #[tokio::test]
    async fn test_unlocked_plan_never_runs() {
        let (probe, agent) = guarded_probe();
        let mut ctx = context_with(plan());
        let err = agent.run(&mut ctx, &CancelSignal::new()).await.unwrap_err();

        assert!(matches!(
            err,
            WorkflowError::Guardrail(ref g) if g.code == GuardrailCode::NonDeterministicRun
        ));
        assert!(!probe.ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_tampered_plan_never_runs() {
        let (probe, agent) = guarded_probe();
        let mut plan = plan();
        determinism::lock_plan(&mut plan, 1, "v1");
        plan.steps[0]
            .params
            .insert("source".into(), json!("other.png"));

        let mut ctx = context_with(plan);
        assert!(agent.run(&mut ctx, &CancelSignal::new()).await.is_err());
        assert!(!probe.ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_locked_plan_runs() {
        let (probe, agent) = guarded_probe();
        let mut plan = plan();
        determinism::lock_plan(&mut plan, 1, "v1");

        let mut ctx = context_with(plan);
        agent.run(&mut ctx, &CancelSignal::new()).await.unwrap();
        assert!(probe.ran.load(Ordering::SeqCst));
        assert_eq!(agent.role(), AgentRole::Executor);
    }

    #[tokio::test]
    async fn test_missing_plan_blocked() {
        let (probe, agent) = guarded_probe();
        let mut ctx = WorkflowContext::new(json!({}));
        assert!(agent.run(&mut ctx, &CancelSignal::new()).await.is_err());
        assert!(!probe.ran.load(Ordering::SeqCst));
    }
}
