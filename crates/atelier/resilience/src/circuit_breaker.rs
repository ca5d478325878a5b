//! Circuit breaker pattern for external operations.
//!
//! Stops calling a persistently failing dependency for a cooldown period.
//! Breakers are keyed by operation name, so one failing tool endpoint is
//! short-circuited for every run that calls it.

use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use atelier_types::{Classify, ErrorKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::CircuitBreakerConfig;
use crate::error::CircuitBreakerOpen;

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed, requests flow normally.
    Closed,

    /// Circuit is open, requests are blocked.
    Open,

    /// Circuit is testing if the dependency has recovered.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

struct BreakerInner {
    state: CircuitState,
    /// Consecutive failures in closed state.
    failure_count: u32,
    /// Trial calls admitted in half-open state.
    half_open_calls: u32,
    /// When the circuit last opened.
    opened_at: Option<Instant>,
    last_transition: DateTime<Utc>,
}

/// Circuit breaker for a single named operation.
///
/// - Closed: normal operation, requests allowed
/// - Open: too many consecutive failures, requests rejected without
///   invoking the operation
/// - Half-Open: recovery timeout elapsed, a limited number of trial
///   requests decide whether to close or re-open
pub struct CircuitBreaker {
    /// Operation this breaker guards.
    name: String,

    config: CircuitBreakerConfig,

    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                half_open_calls: 0,
                opened_at: None,
                last_transition: Utc::now(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Get the current state.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        self.check_timeout(&mut inner);
        inner.state
    }

    /// Consecutive failures recorded while closed.
    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    /// Check if a request should be allowed, reserving a trial slot when
    /// half-open.
    pub fn allow_request(&self) -> bool {
        let mut inner = self.lock();
        self.check_timeout(&mut inner);

        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                if inner.half_open_calls < self.config.half_open_max_calls {
                    inner.half_open_calls += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful operation.
    pub fn record_success(&self) {
        let mut inner = self.lock();

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                info!(operation = %self.name, "Circuit breaker closing after successful trial call");
                self.transition_to(&mut inner, CircuitState::Closed);
            }
            CircuitState::Open => {
                debug!(operation = %self.name, "Success recorded while circuit open");
            }
        }
    }

    /// Record a failed operation.
    pub fn record_failure(&self) {
        let mut inner = self.lock();

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    warn!(
                        operation = %self.name,
                        failures = inner.failure_count,
                        "Circuit breaker opening due to failures"
                    );
                    self.transition_to(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                warn!(operation = %self.name, "Circuit breaker re-opening after half-open failure");
                self.transition_to(&mut inner, CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    /// Give back a half-open trial slot for a call that neither proved nor
    /// disproved recovery.
    fn release_trial(&self) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.half_open_calls = inner.half_open_calls.saturating_sub(1);
        }
    }

    /// Invoke `op` through the breaker.
    ///
    /// While open, `op` is not invoked and [`CircuitBreakerOpen`] is
    /// returned. Validation errors say nothing about the dependency's health
    /// and do not count as failures.
    pub async fn call<T, E, F, Fut>(&self, op: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + From<CircuitBreakerOpen>,
    {
        if !self.allow_request() {
            return Err(self.open_error().into());
        }

        let mut in_flight = InFlight {
            breaker: self,
            settled: false,
        };
        let result = op().await;
        in_flight.settled = true;

        match result {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(error) => {
                if error.kind() == ErrorKind::Validation {
                    self.release_trial();
                } else {
                    self.record_failure();
                }
                Err(error)
            }
        }
    }

    fn open_error(&self) -> CircuitBreakerOpen {
        let inner = self.lock();
        let retry_after = inner
            .opened_at
            .map(|at| self.config.recovery_timeout.saturating_sub(at.elapsed()))
            .unwrap_or(Duration::ZERO);
        CircuitBreakerOpen {
            operation: self.name.clone(),
            retry_after,
        }
    }

    /// Force the circuit to a specific state.
    pub fn force_state(&self, new_state: CircuitState) {
        let mut inner = self.lock();
        info!(
            operation = %self.name,
            old_state = %inner.state,
            new_state = %new_state,
            "Circuit breaker state forced"
        );
        self.transition_to(&mut inner, new_state);
    }

    /// Reset the circuit breaker to closed state.
    pub fn reset(&self) {
        self.force_state(CircuitState::Closed);
    }

    /// Get circuit breaker statistics.
    pub fn stats(&self) -> CircuitBreakerStats {
        let mut inner = self.lock();
        self.check_timeout(&mut inner);
        CircuitBreakerStats {
            operation: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            half_open_calls: inner.half_open_calls,
            last_transition: inner.last_transition,
        }
    }

    /// Move from open to half-open once the recovery timeout has passed.
    fn check_timeout(&self, inner: &mut BreakerInner) {
        if inner.state != CircuitState::Open {
            return;
        }
        let Some(opened_at) = inner.opened_at else {
            return;
        };
        if opened_at.elapsed() >= self.config.recovery_timeout {
            info!(
                operation = %self.name,
                "Circuit breaker transitioning to half-open after timeout"
            );
            self.transition_to(inner, CircuitState::HalfOpen);
        }
    }

    /// Transition to a new state, resetting counters as needed.
    fn transition_to(&self, inner: &mut BreakerInner, new_state: CircuitState) {
        inner.state = new_state;
        inner.last_transition = Utc::now();

        match new_state {
            CircuitState::Closed => {
                inner.failure_count = 0;
                inner.half_open_calls = 0;
                inner.opened_at = None;
            }
            CircuitState::Open => {
                inner.half_open_calls = 0;
                inner.opened_at = Some(Instant::now());
            }
            CircuitState::HalfOpen => {
                inner.half_open_calls = 0;
            }
        }
    }
}

/// Hands back the half-open trial slot of a call dropped before it settled.
struct InFlight<'a> {
    breaker: &'a CircuitBreaker,
    settled: bool,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.settled {
            debug!(operation = %self.breaker.name, "Call abandoned before completion");
            self.breaker.release_trial();
        }
    }
}

/// Statistics for a circuit breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerStats {
    pub operation: String,

    pub state: CircuitState,

    /// Consecutive failures while closed.
    pub failure_count: u32,

    /// Trial calls in flight while half-open.
    pub half_open_calls: u32,

    /// Time of last state transition.
    pub last_transition: DateTime<Utc>,
}
