//! Resilience errors

use std::time::Duration;
use thiserror::Error;

/// Raised instead of invoking an operation whose circuit is open
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("circuit breaker open for '{operation}' (retry in {}ms)", retry_after.as_millis())]
pub struct CircuitBreakerOpen {
    pub operation: String,
    /// Remaining time until the circuit allows a trial call
    pub retry_after: Duration,
}

impl atelier_types::Classify for CircuitBreakerOpen {
    fn kind(&self) -> atelier_types::ErrorKind {
        atelier_types::ErrorKind::CircuitOpen
    }
}
