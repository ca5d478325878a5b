//! Dependency-aware parallel execution of agent tasks
//!
//! Tasks run in waves. Each wave is the set of pending tasks whose
//! dependencies have all completed, dispatched highest priority first (ties
//! broken by id) with at most `max_concurrent` in flight. A task that can
//! never become ready (cycle, missing or failed dependency) is reported as
//! a dependency failure, never silently dropped. A failed critical task
//! halts the schedule: tasks not yet started are reported as skipped.

use crate::cancel::CancelSignal;
use crate::error::TaskError;
use atelier_resilience::{retry_counted, RetryConfig};
use atelier_types::{AgentTask, Classify, ErrorKind};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// Callback invoked as each task settles
pub type TaskObserver = Arc<dyn Fn(&TaskOutcome) + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Completed,
    Failed,
    /// Never started
    Skipped,
}

#[derive(Clone, Debug)]
pub struct TaskOutcome {
    pub task_id: String,
    pub status: TaskStatus,
    pub output: Option<Value>,
    pub error: Option<TaskError>,
    pub attempts: u32,
    pub duration_ms: u64,
    /// 1-based wave the task was dispatched in; 0 if never dispatched
    pub wave: usize,
    pub critical: bool,
}

impl TaskOutcome {
    fn not_run(task: &AgentTask, status: TaskStatus, error: TaskError) -> Self {
        Self {
            task_id: task.id.clone(),
            status,
            output: None,
            error: Some(error),
            attempts: 0,
            duration_ms: 0,
            wave: 0,
            critical: task.critical,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Completed
    }

    /// A failure that stops the rest of the schedule
    pub fn halts(&self) -> bool {
        self.status == TaskStatus::Failed
            && (self.critical
                || self
                    .error
                    .as_ref()
                    .is_some_and(|e| e.kind() == ErrorKind::Fatal))
    }
}

/// Everything that happened to a batch of tasks
#[derive(Clone, Debug, Default)]
pub struct ParallelReport {
    pub outcomes: HashMap<String, TaskOutcome>,
    /// Task ids in the order they settled
    pub completion_order: Vec<String>,
    pub waves: usize,
    /// The schedule stopped early (critical failure or cancellation)
    pub halted: bool,
}

impl ParallelReport {
    pub fn outcome(&self, task_id: &str) -> Option<&TaskOutcome> {
        self.outcomes.get(task_id)
    }

    pub fn all_succeeded(&self) -> bool {
        self.outcomes.values().all(TaskOutcome::is_success)
    }

    pub fn failed(&self) -> impl Iterator<Item = &TaskOutcome> {
        self.outcomes.values().filter(|o| !o.is_success())
    }
}

/// Bounded fan-out over a task DAG
#[derive(Clone)]
pub struct ParallelExecutor {
    max_concurrent: usize,
    retry: RetryConfig,
    observer: Option<TaskObserver>,
}

impl ParallelExecutor {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
            retry: RetryConfig::default(),
            observer: None,
        }
    }

    /// Retry policy applied to tasks marked retryable
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_observer(mut self, observer: TaskObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    fn record(&self, report: &mut ParallelReport, outcome: TaskOutcome) {
        if let Some(observer) = &self.observer {
            observer(&outcome);
        }
        report.completion_order.push(outcome.task_id.clone());
        report.outcomes.insert(outcome.task_id.clone(), outcome);
    }

    fn skip_all(&self, report: &mut ParallelReport, pending: Vec<AgentTask>, reason: &str) {
        for task in pending {
            let outcome = TaskOutcome::not_run(
                &task,
                TaskStatus::Skipped,
                TaskError::Halted(reason.to_string()),
            );
            self.record(report, outcome);
        }
    }

    /// Run `tasks` to completion through `runner`.
    ///
    /// Task ids must be unique; later duplicates are dropped. `cancel` is
    /// checked between waves.
    pub async fn execute<F, Fut>(
        &self,
        tasks: Vec<AgentTask>,
        cancel: Option<&CancelSignal>,
        runner: F,
    ) -> ParallelReport
    where
        F: Fn(AgentTask) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, TaskError>> + Send + 'static,
    {
        let runner = Arc::new(runner);
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let mut report = ParallelReport::default();
        let mut completed: HashSet<String> = HashSet::new();

        let mut seen = HashSet::new();
        let mut pending: Vec<AgentTask> = Vec::with_capacity(tasks.len());
        for task in tasks {
            if seen.insert(task.id.clone()) {
                pending.push(task);
            } else {
                warn!(task_id = %task.id, "Duplicate task id dropped");
            }
        }

        while !pending.is_empty() {
            if cancel.is_some_and(CancelSignal::is_cancelled) {
                debug!(remaining = pending.len(), "Schedule cancelled");
                report.halted = true;
                self.skip_all(&mut report, pending, "run stopped");
                break;
            }

            let (mut ready, blocked): (Vec<_>, Vec<_>) = pending
                .into_iter()
                .partition(|t| t.dependencies.iter().all(|d| completed.contains(d)));
            pending = blocked;

            if ready.is_empty() {
                for task in std::mem::take(&mut pending) {
                    let unmet: Vec<&str> = task
                        .dependencies
                        .iter()
                        .filter(|d| !completed.contains(*d))
                        .map(String::as_str)
                        .collect();
                    let error = TaskError::Dependency(format!(
                        "'{}' waits on {} which will never complete",
                        task.id,
                        unmet.join(", ")
                    ));
                    warn!(task_id = %task.id, "Unschedulable task: {}", error);
                    let outcome = TaskOutcome::not_run(&task, TaskStatus::Failed, error);
                    self.record(&mut report, outcome);
                }
                break;
            }

            ready.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));
            report.waves += 1;
            let wave = report.waves;
            debug!(wave, ready = ready.len(), "Dispatching wave");

            let mut join_set = JoinSet::new();
            let mut in_flight: HashMap<String, AgentTask> = HashMap::new();
            for task in ready {
                // Permits are taken in priority order, so dispatch order is
                // priority order even at concurrency 1
                let permit = semaphore.clone().acquire_owned().await.ok();
                in_flight.insert(task.id.clone(), task.clone());
                let runner = runner.clone();
                let retry = self.retry.clone();
                join_set.spawn(async move {
                    let outcome = run_task(task, runner, retry, wave).await;
                    drop(permit);
                    outcome
                });
            }

            let mut halt: Option<String> = None;
            while let Some(joined) = join_set.join_next().await {
                match joined {
                    Ok(outcome) => {
                        in_flight.remove(&outcome.task_id);
                        if outcome.is_success() {
                            completed.insert(outcome.task_id.clone());
                        } else if outcome.halts() && halt.is_none() {
                            halt = Some(outcome.task_id.clone());
                        }
                        self.record(&mut report, outcome);
                    }
                    Err(e) => error!("Task join failed: {}", e),
                }
            }

            // Tasks lost to a join failure
            for (_, task) in in_flight {
                let mut outcome = TaskOutcome::not_run(
                    &task,
                    TaskStatus::Failed,
                    TaskError::backend(ErrorKind::Internal, "task aborted"),
                );
                outcome.wave = wave;
                if outcome.halts() && halt.is_none() {
                    halt = Some(task.id.clone());
                }
                self.record(&mut report, outcome);
            }

            if let Some(failed) = halt {
                warn!(task_id = %failed, remaining = pending.len(), "Critical task failed, halting");
                report.halted = true;
                let reason = format!("halted after '{}' failed", failed);
                self.skip_all(&mut report, std::mem::take(&mut pending), &reason);
                break;
            }
        }

        report
    }
}

impl Default for ParallelExecutor {
    fn default() -> Self {
        Self::new(3)
    }
}

async fn run_task<F, Fut>(
    task: AgentTask,
    runner: Arc<F>,
    retry: RetryConfig,
    wave: usize,
) -> TaskOutcome
where
    F: Fn(AgentTask) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, TaskError>> + Send + 'static,
{
    let started = Instant::now();
    let policy = if task.retryable {
        retry
    } else {
        RetryConfig::no_retry()
    };
    let timeout = task.timeout();
    let timeout_ms = task.timeout_ms;

    let (result, attempts) = retry_counted(&policy, &task.id, || {
        let runner = runner.clone();
        let task = task.clone();
        async move {
            let attempt = AssertUnwindSafe((runner.as_ref())(task)).catch_unwind();
            match tokio::time::timeout(timeout, attempt).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(TaskError::backend(ErrorKind::Internal, "task panicked")),
                Err(_) => Err(TaskError::Timeout(timeout_ms)),
            }
        }
    })
    .await;

    let duration_ms = started.elapsed().as_millis() as u64;
    match result {
        Ok(output) => TaskOutcome {
            task_id: task.id,
            status: TaskStatus::Completed,
            output: Some(output),
            error: None,
            attempts,
            duration_ms,
            wave,
            critical: task.critical,
        },
        Err(error) => TaskOutcome {
            task_id: task.id,
            status: TaskStatus::Failed,
            output: None,
            error: Some(error),
            attempts,
            duration_ms,
            wave,
            critical: task.critical,
        },
    }
}
