//! Planner agent: turns `input_data` into a locked plan

use super::Agent;
use crate::backends::{fallback_plan, PlannerBackend};
use crate::cancel::CancelSignal;
use crate::error::TaskError;
use async_trait::async_trait;
use atelier_guard::{determinism, OperationCatalog};
use atelier_resilience::{retry_with_backoff, CircuitBreaker, RetryConfig};
use atelier_types::{AgentRole, Classify, Plan, WorkflowContext, WorkflowResult};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Breaker name for planner backend calls
pub const PLANNER_BREAKER: &str = "planner";

/// Calls the planner backend through retry, circuit breaker and timeout.
/// Any backend failure is replaced by the fallback plan, so this agent
/// only fails on internal errors.
pub struct PlannerAgent {
    backend: Arc<dyn PlannerBackend>,
    catalog: OperationCatalog,
    breaker: Arc<CircuitBreaker>,
    retry: RetryConfig,
    timeout: Duration,
    model_version: String,
}

impl PlannerAgent {
    pub fn new(
        backend: Arc<dyn PlannerBackend>,
        catalog: OperationCatalog,
        breaker: Arc<CircuitBreaker>,
    ) -> Self {
        Self {
            backend,
            catalog,
            breaker,
            retry: RetryConfig::default(),
            timeout: Duration::from_secs(30),
            model_version: "atelier-planner-v1".to_string(),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_model_version(mut self, model_version: impl Into<String>) -> Self {
        self.model_version = model_version.into();
        self
    }

    async fn request_plan(&self, ctx: &WorkflowContext) -> Result<Plan, TaskError> {
        let timeout = self.timeout;
        let timeout_ms = timeout.as_millis() as u64;

        retry_with_backoff(&self.retry, PLANNER_BREAKER, || {
            let breaker = self.breaker.clone();
            let backend = self.backend.clone();
            async move {
                breaker
                    .call(move || async move {
                        match tokio::time::timeout(timeout, backend.plan(ctx)).await {
                            Ok(Ok(plan)) => Ok(plan),
                            Ok(Err(e)) => Err(TaskError::backend(e.kind(), e.to_string())),
                            Err(_) => Err(TaskError::Timeout(timeout_ms)),
                        }
                    })
                    .await
            }
        })
        .await
    }

    /// Fill in what the backend left out
    fn complete(&self, mut plan: Plan) -> Plan {
        if plan.estimated_cost_usd <= 0.0 {
            plan.estimated_cost_usd = self.catalog.plan_cost(&plan);
        }
        if plan.estimated_duration_ms == 0 {
            plan.estimated_duration_ms = self.catalog.plan_duration_ms(&plan);
        }
        if plan.outputs.is_empty() {
            if let Some(last) = plan.steps.last() {
                plan.outputs.push(last.id.clone());
            }
        }
        plan
    }
}

/// `metadata.seed` if the caller pinned one, else derived from the run id
fn seed_for(ctx: &WorkflowContext) -> u64 {
    ctx.metadata
        .get("seed")
        .and_then(Value::as_u64)
        .unwrap_or_else(|| determinism::derive_seed(ctx.run_id.as_str()))
}

#[async_trait]
impl Agent for PlannerAgent {
    fn role(&self) -> AgentRole {
        AgentRole::Planner
    }

    async fn run(&self, ctx: &mut WorkflowContext, _cancel: &CancelSignal) -> WorkflowResult<()> {
        let plan = match self.request_plan(ctx).await {
            Ok(plan) => plan,
            Err(e) => {
                warn!(
                    run_id = %ctx.run_id,
                    backend = self.backend.name(),
                    kind = %e.kind(),
                    "Planner backend failed, using fallback plan: {}",
                    e
                );
                fallback_plan(ctx, &self.catalog, &e.to_string())
            }
        };

        let mut plan = self.complete(plan);
        determinism::lock_plan(&mut plan, seed_for(ctx), self.model_version.as_str());

        info!(
            run_id = %ctx.run_id,
            steps = plan.steps.len(),
            estimated_cost_usd = plan.estimated_cost_usd,
            fallback = plan.is_fallback(),
            "Plan ready"
        );

        ctx.plan = Some(plan);
        ctx.critique = None;
        ctx.plan_overridden = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::TemplatePlanner;
    use atelier_resilience::{CircuitBreakerConfig, CircuitState};
    use atelier_types::{Step, WorkflowError};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyPlanner {
        calls: AtomicU32,
        failures: u32,
    }

    #[async_trait]
    impl PlannerBackend for FlakyPlanner {
        async fn plan(&self, _ctx: &WorkflowContext) -> WorkflowResult<Plan> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(WorkflowError::Planning("model overloaded".into()));
            }
            Ok(Plan::new(vec![Step::new("s1", "onboard").with_param("source", "x")]))
        }

        fn name(&self) -> &str {
            "flaky"
        }
    }

    fn breaker() -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new(PLANNER_BREAKER, CircuitBreakerConfig::default()))
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig::default()
            .with_delays(Duration::from_millis(1), Duration::from_millis(2))
            .without_jitter()
    }

    fn ctx(input: serde_json::Value) -> WorkflowContext {
        WorkflowContext::new(input)
    }

    #[tokio::test]
    async fn test_plan_is_locked_and_completed() {
        let agent = PlannerAgent::new(
            Arc::new(TemplatePlanner::default()),
            OperationCatalog::standard(),
            breaker(),
        )
        .with_model_version("planner-test");
        let mut ctx = ctx(json!({"intent": "edit_product_shot"}));
        agent.run(&mut ctx, &CancelSignal::new()).await.unwrap();

        let plan = ctx.plan.as_ref().unwrap();
        assert!(plan.determinism.locked);
        assert_eq!(plan.determinism.model_version, "planner-test");
        assert_eq!(
            plan.determinism.seed,
            determinism::derive_seed(ctx.run_id.as_str())
        );
        assert!(determinism::verify_lock(plan).is_ok());
        assert!(!plan.is_fallback());
    }

    #[tokio::test]
    async fn test_seed_from_metadata() {
        let agent = PlannerAgent::new(
            Arc::new(TemplatePlanner::default()),
            OperationCatalog::standard(),
            breaker(),
        );
        let mut ctx = ctx(json!({"intent": "edit_product_shot"})).with_metadata("seed", 42);
        agent.run(&mut ctx, &CancelSignal::new()).await.unwrap();
        assert_eq!(ctx.plan.unwrap().determinism.seed, 42);
    }

    #[tokio::test]
    async fn test_transient_backend_failures_are_retried() {
        let backend = Arc::new(FlakyPlanner {
            calls: AtomicU32::new(0),
            failures: 2,
        });
        let agent = PlannerAgent::new(backend.clone(), OperationCatalog::standard(), breaker())
            .with_retry(fast_retry());
        let mut ctx = ctx(json!({}));
        agent.run(&mut ctx, &CancelSignal::new()).await.unwrap();

        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
        let plan = ctx.plan.unwrap();
        assert!(!plan.is_fallback());
        // Cost filled in from the catalog
        assert_eq!(plan.estimated_cost_usd, 0.01);
    }

    #[tokio::test]
    async fn test_unknown_intent_falls_back_without_retry() {
        let agent = PlannerAgent::new(
            Arc::new(TemplatePlanner::default()),
            OperationCatalog::standard(),
            breaker(),
        );
        let mut ctx = ctx(json!({"intent": "paint_the_moon"}));
        agent.run(&mut ctx, &CancelSignal::new()).await.unwrap();

        let plan = ctx.plan.unwrap();
        assert!(plan.is_fallback());
        assert!(!plan.requires_hitl);
        assert_eq!(plan.steps.len(), 2);
        assert!(plan.determinism.locked);
    }

    #[tokio::test]
    async fn test_open_circuit_falls_back() {
        let backend = Arc::new(FlakyPlanner {
            calls: AtomicU32::new(0),
            failures: 0,
        });
        let breaker = breaker();
        breaker.force_state(CircuitState::Open);
        let agent = PlannerAgent::new(backend.clone(), OperationCatalog::standard(), breaker);

        let mut ctx = ctx(json!({}));
        agent.run(&mut ctx, &CancelSignal::new()).await.unwrap();
        assert!(ctx.plan.unwrap().is_fallback());
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_backend_times_out() {
        struct SlowPlanner;

        #[async_trait]
        impl PlannerBackend for SlowPlanner {
            async fn plan(&self, _ctx: &WorkflowContext) -> WorkflowResult<Plan> {
                tokio::time::sleep(Duration::from_secs(600)).await;
                Ok(Plan::default())
            }

            fn name(&self) -> &str {
                "slow"
            }
        }

        let agent = PlannerAgent::new(Arc::new(SlowPlanner), OperationCatalog::standard(), breaker())
            .with_timeout(Duration::from_secs(1))
            .with_retry(RetryConfig::no_retry());
        let mut ctx = ctx(json!({}));
        agent.run(&mut ctx, &CancelSignal::new()).await.unwrap();

        let plan = ctx.plan.unwrap();
        assert!(plan.is_fallback());
        assert!(plan.metadata["fallback_reason"]
            .as_str()
            .unwrap()
            .contains("timed out"));
    }
}
