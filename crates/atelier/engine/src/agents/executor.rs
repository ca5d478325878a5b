//! Executor agent: runs the plan's steps through the tool backend

use super::Agent;
use crate::backends::ToolExecutionBackend;
use crate::cancel::CancelSignal;
use crate::error::TaskError;
use crate::events::EventBroadcaster;
use crate::parallel::{ParallelExecutor, TaskObserver, TaskOutcome, TaskStatus};
use async_trait::async_trait;
use atelier_guard::OperationCatalog;
use atelier_resilience::CircuitBreakerRegistry;
use atelier_types::{
    AgentRole, AgentTask, Classify, ErrorKind, EventType, RunResult, Step, StepFailure,
    StepOutput, WorkflowContext, WorkflowError, WorkflowResult,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Slack between the per-call timeout and the parallel executor's task
/// deadline, so the breaker sees the timeout before the task is dropped.
const TASK_DEADLINE_GRACE: Duration = Duration::from_secs(1);

/// Maps plan steps onto parallel-executor tasks. Every tool call goes
/// through the per-operation circuit breaker with the step timeout inside
/// it; retries are applied by the parallel executor.
pub struct ExecutorAgent {
    tools: Arc<dyn ToolExecutionBackend>,
    catalog: OperationCatalog,
    breakers: Arc<CircuitBreakerRegistry>,
    parallel: ParallelExecutor,
    step_timeout: Duration,
    events: Arc<EventBroadcaster>,
}

impl ExecutorAgent {
    pub fn new(
        tools: Arc<dyn ToolExecutionBackend>,
        catalog: OperationCatalog,
        breakers: Arc<CircuitBreakerRegistry>,
        parallel: ParallelExecutor,
        events: Arc<EventBroadcaster>,
    ) -> Self {
        Self {
            tools,
            catalog,
            breakers,
            parallel,
            step_timeout: Duration::from_secs(60),
            events,
        }
    }

    pub fn with_step_timeout(mut self, step_timeout: Duration) -> Self {
        self.step_timeout = step_timeout;
        self
    }

    fn task_for(&self, index: usize, step: &Step) -> AgentTask {
        let mut task = AgentTask::new(&step.id, AgentRole::Executor)
            // Plan order breaks ties between ready steps
            .with_priority(-(index as i32))
            .with_timeout(self.step_timeout + TASK_DEADLINE_GRACE)
            .retryable(true)
            .critical(self.catalog.is_critical(&step.op));
        task.dependencies = step.depends_on.clone();
        task
    }

    fn step_observer(&self, ctx: &WorkflowContext, ops: &HashMap<String, String>) -> TaskObserver {
        let events = self.events.clone();
        let run_id = ctx.run_id.clone();
        let ops = ops.clone();
        Arc::new(move |outcome: &TaskOutcome| {
            events.emit(
                EventType::StepUpdate,
                &run_id,
                json!({
                    "step_id": outcome.task_id,
                    "op": ops.get(&outcome.task_id),
                    "status": outcome.status,
                    "attempts": outcome.attempts,
                    "duration_ms": outcome.duration_ms,
                    "error": outcome.error.as_ref().map(|e| e.to_string()),
                }),
            );
        })
    }
}

#[async_trait]
impl Agent for ExecutorAgent {
    fn role(&self) -> AgentRole {
        AgentRole::Executor
    }

    async fn run(&self, ctx: &mut WorkflowContext, cancel: &CancelSignal) -> WorkflowResult<()> {
        let plan = ctx.plan.clone().ok_or(WorkflowError::MissingPlan)?;
        let started = Instant::now();

        let tasks: Vec<AgentTask> = plan
            .steps
            .iter()
            .enumerate()
            .map(|(i, step)| self.task_for(i, step))
            .collect();
        let ops: HashMap<String, String> = plan
            .steps
            .iter()
            .map(|s| (s.id.clone(), s.op.clone()))
            .collect();
        let steps: Arc<HashMap<String, Step>> = Arc::new(
            plan.steps
                .iter()
                .map(|s| (s.id.clone(), s.clone()))
                .collect(),
        );

        let tools = self.tools.clone();
        let breakers = self.breakers.clone();
        let step_timeout = self.step_timeout;
        let runner = move |task: AgentTask| {
            let tools = tools.clone();
            let breakers = breakers.clone();
            let step = steps.get(&task.id).cloned();
            async move {
                let step = step.ok_or_else(|| {
                    TaskError::backend(ErrorKind::Internal, format!("no step '{}'", task.id))
                })?;
                let breaker = breakers.get(&step.op);
                // The timeout lives inside the breaker so hung calls count as failures
                breaker
                    .call(move || async move {
                        match tokio::time::timeout(step_timeout, tools.execute(&step.op, &step.params))
                            .await
                        {
                            Ok(result) => result.map_err(TaskError::from),
                            Err(_) => Err(TaskError::Timeout(step_timeout.as_millis() as u64)),
                        }
                    })
                    .await
            }
        };

        let parallel = self
            .parallel
            .clone()
            .with_observer(self.step_observer(ctx, &ops));
        let report = parallel.execute(tasks, Some(cancel), runner).await;

        let mut result = RunResult::default();
        for step in &plan.steps {
            let Some(outcome) = report.outcome(&step.id) else {
                continue;
            };
            match outcome.status {
                TaskStatus::Completed => {
                    let output = outcome.output.clone().unwrap_or_default();
                    if let Some(planned) = ctx.plan.as_mut().and_then(|p| p.step_mut(&step.id)) {
                        planned.result = Some(output.clone());
                    }
                    result.total_cost_usd += self.catalog.step_cost(step);
                    result.outputs.push(StepOutput {
                        step_id: step.id.clone(),
                        op: step.op.clone(),
                        output,
                        attempts: outcome.attempts,
                        duration_ms: outcome.duration_ms,
                    });
                    result.log(format!(
                        "{} {} completed in {}ms ({} attempt(s))",
                        step.id, step.op, outcome.duration_ms, outcome.attempts
                    ));
                }
                TaskStatus::Failed | TaskStatus::Skipped => {
                    let kind = outcome
                        .error
                        .as_ref()
                        .map(Classify::kind)
                        .unwrap_or(ErrorKind::Internal);
                    let message = outcome
                        .error
                        .as_ref()
                        .map(|e| e.to_string())
                        .unwrap_or_else(|| "unknown failure".to_string());
                    result.log(format!("{} {} {:?}: {}", step.id, step.op, outcome.status, message));
                    result.errors.push(StepFailure {
                        step_id: step.id.clone(),
                        op: step.op.clone(),
                        kind,
                        message,
                        // Skipped steps did not cause the halt
                        critical: outcome.status == TaskStatus::Failed && outcome.critical,
                    });
                }
            }
        }

        result.total_cost_usd = atelier_guard::catalog::round_cents(result.total_cost_usd);
        result.duration_ms = started.elapsed().as_millis() as u64;
        let halting = result
            .halting_failure()
            .map(|f| (f.step_id.clone(), f.message.clone()));
        result.success = halting.is_none() && !cancel.is_cancelled() && !report.halted;

        info!(
            run_id = %ctx.run_id,
            success = result.success,
            outputs = result.outputs.len(),
            errors = result.errors.len(),
            duration_ms = result.duration_ms,
            "Execution finished"
        );
        ctx.result = Some(result);

        match halting {
            Some((step_id, message)) => {
                warn!(run_id = %ctx.run_id, step_id = %step_id, "Execution halted: {}", message);
                Err(WorkflowError::StepFailed { step_id, message })
            }
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::SimulatedToolBackend;
    use atelier_resilience::{CircuitBreakerConfig, CircuitState, RetryConfig};
    use atelier_types::{Plan, ToolError, WorkflowState};
    use serde_json::json;

    fn fast_retry() -> RetryConfig {
        RetryConfig::default()
            .with_delays(Duration::from_millis(1), Duration::from_millis(2))
            .without_jitter()
    }

    fn executor(tools: Arc<SimulatedToolBackend>, events: Arc<EventBroadcaster>) -> ExecutorAgent {
        ExecutorAgent::new(
            tools,
            OperationCatalog::standard(),
            Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::default())),
            ParallelExecutor::new(3).with_retry(fast_retry()),
            events,
        )
    }

    fn ctx_with(plan: Plan) -> WorkflowContext {
        let mut ctx = WorkflowContext::new(json!({}));
        ctx.plan = Some(plan);
        ctx
    }

    fn product_shot(extra: Option<Step>) -> Plan {
        let mut steps = vec![
            Step::new("s1", "onboard").with_param("source", "shoe.png"),
            Step::new("s2", "remove_background")
                .with_param("asset", "s1")
                .after("s1"),
        ];
        steps.extend(extra);
        Plan::new(steps).with_cost(0.06)
    }

    #[tokio::test]
    async fn test_successful_execution() {
        let tools = Arc::new(SimulatedToolBackend::new());
        let events = Arc::new(EventBroadcaster::local(100));
        let mut ctx = ctx_with(product_shot(None));

        executor(tools, events.clone())
            .run(&mut ctx, &CancelSignal::new())
            .await
            .unwrap();

        let result = ctx.result.as_ref().unwrap();
        assert!(result.success);
        assert_eq!(result.outputs.len(), 2);
        assert_eq!(result.outputs[0].step_id, "s1");
        assert_eq!(result.total_cost_usd, 0.06);
        assert!(ctx.plan.as_ref().unwrap().steps[1].result.is_some());

        let updates = events
            .history(Some(&ctx.run_id))
            .into_iter()
            .filter(|e| e.event_type == EventType::StepUpdate)
            .count();
        assert_eq!(updates, 2);
    }

    #[tokio::test]
    async fn test_non_critical_failure_is_collected() {
        let tools = Arc::new(SimulatedToolBackend::new());
        tools.fail_next("upscale", ToolError::Validation("factor too large".into()));
        let mut ctx = ctx_with(product_shot(Some(
            Step::new("s3", "upscale")
                .with_param("asset", "s2")
                .with_param("factor", 2.0)
                .after("s2"),
        )));

        executor(tools.clone(), Arc::new(EventBroadcaster::default()))
            .run(&mut ctx, &CancelSignal::new())
            .await
            .unwrap();

        let result = ctx.result.as_ref().unwrap();
        assert!(result.success);
        assert_eq!(result.outputs.len(), 2);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].kind, ErrorKind::Validation);
        assert!(!result.errors[0].critical);
        assert_eq!(tools.calls("upscale"), 1);
    }

    #[tokio::test]
    async fn test_critical_failure_halts_run() {
        let tools = Arc::new(SimulatedToolBackend::new());
        tools.fail_next("onboard", ToolError::Fatal("source unreadable".into()));
        let mut ctx = ctx_with(product_shot(None));

        let err = executor(tools.clone(), Arc::new(EventBroadcaster::default()))
            .run(&mut ctx, &CancelSignal::new())
            .await
            .unwrap_err();

        assert!(matches!(err, WorkflowError::StepFailed { ref step_id, .. } if step_id == "s1"));
        let result = ctx.result.as_ref().unwrap();
        assert!(!result.success);
        assert_eq!(result.errors.len(), 2);
        assert_eq!(result.errors[1].kind, ErrorKind::Cancelled);
        assert_eq!(tools.calls("remove_background"), 0);
    }

    #[tokio::test]
    async fn test_transient_failure_retried_through_breaker() {
        let tools = Arc::new(SimulatedToolBackend::new());
        tools.fail_next("onboard", ToolError::Transient("busy".into()));
        let mut ctx = ctx_with(product_shot(None));

        executor(tools.clone(), Arc::new(EventBroadcaster::default()))
            .run(&mut ctx, &CancelSignal::new())
            .await
            .unwrap();

        let result = ctx.result.as_ref().unwrap();
        assert!(result.success);
        assert_eq!(result.output_for("s1").unwrap().attempts, 2);
        assert_eq!(tools.calls("onboard"), 2);
    }

    struct HangingTools;

    #[async_trait]
    impl ToolExecutionBackend for HangingTools {
        async fn execute(
            &self,
            _op: &str,
            _params: &atelier_types::Params,
        ) -> Result<serde_json::Value, ToolError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(json!({}))
        }

        fn name(&self) -> &str {
            "hanging"
        }
    }

    fn hanging_executor(breakers: Arc<CircuitBreakerRegistry>) -> ExecutorAgent {
        ExecutorAgent::new(
            Arc::new(HangingTools),
            OperationCatalog::standard(),
            breakers,
            ParallelExecutor::new(3).with_retry(fast_retry()),
            Arc::new(EventBroadcaster::default()),
        )
        .with_step_timeout(Duration::from_millis(50))
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_timeouts_open_the_circuit() {
        let breakers = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 2,
            recovery_timeout: Duration::from_secs(60),
            half_open_max_calls: 1,
        }));
        let mut ctx = ctx_with(product_shot(None));

        let err = hanging_executor(breakers.clone())
            .run(&mut ctx, &CancelSignal::new())
            .await
            .unwrap_err();

        assert!(matches!(err, WorkflowError::StepFailed { ref step_id, .. } if step_id == "s1"));
        let onboard = breakers.get("onboard");
        assert_eq!(onboard.state(), CircuitState::Open);
        let failure = &ctx.result.as_ref().unwrap().errors[0];
        assert_eq!(failure.kind, ErrorKind::CircuitOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_trial_reopens_then_recovers() {
        let breakers = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 2,
            recovery_timeout: Duration::from_secs(60),
            half_open_max_calls: 1,
        }));
        let onboard = breakers.get("onboard");
        onboard.force_state(CircuitState::HalfOpen);
        let mut ctx = ctx_with(product_shot(None));

        let _ = hanging_executor(breakers.clone())
            .run(&mut ctx, &CancelSignal::new())
            .await;
        assert_eq!(onboard.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(3600)).await;
        assert_eq!(onboard.state(), CircuitState::HalfOpen);
        assert_eq!(onboard.stats().half_open_calls, 0);
        assert!(onboard.allow_request());
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let tools = Arc::new(SimulatedToolBackend::new());
        let signal = CancelSignal::new();
        signal.request(WorkflowState::Stopped);
        let mut ctx = ctx_with(product_shot(None));

        executor(tools.clone(), Arc::new(EventBroadcaster::default()))
            .run(&mut ctx, &signal)
            .await
            .unwrap();

        let result = ctx.result.as_ref().unwrap();
        assert!(!result.success);
        assert!(result.outputs.is_empty());
        assert_eq!(tools.calls("onboard"), 0);
    }
}
