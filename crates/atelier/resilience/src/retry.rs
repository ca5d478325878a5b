//! Retry with exponential backoff
//!
//! `delay(attempt) = min(initial_delay * base^(attempt-1), max_delay)`,
//! optionally perturbed by ±25%. Errors whose kind is not in the retryable
//! set propagate on first occurrence; exhausting `max_attempts` returns the
//! last error.

use crate::config::RetryConfig;
use atelier_types::Classify;
use rand::Rng;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Fraction of the delay that jitter may add or remove
const JITTER_FRACTION: f64 = 0.25;

impl RetryConfig {
    /// Backoff before attempt `attempt + 1`, without jitter
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let raw = self.initial_delay.as_secs_f64() * self.exponential_base.powi(exponent);
        let capped = raw.min(self.max_delay.as_secs_f64());
        if capped.is_finite() && capped >= 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            self.max_delay
        }
    }

    /// Backoff before attempt `attempt + 1`
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if !self.jitter || base.is_zero() {
            return base;
        }
        let factor = rand::thread_rng().gen_range(1.0 - JITTER_FRACTION..=1.0 + JITTER_FRACTION);
        base.mul_f64(factor)
    }
}

/// Like [`retry_with_backoff`], also reporting how many attempts were made
pub async fn retry_counted<T, E, F, Fut>(
    config: &RetryConfig,
    operation: &str,
    mut op: F,
) -> (Result<T, E>, u32)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Classify + Display,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match op().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation, attempt, "Succeeded after retry");
                }
                return (Ok(value), attempt);
            }
            Err(error) => {
                if !config.is_retryable(&error) {
                    debug!(
                        operation,
                        attempt,
                        kind = %error.kind(),
                        "Non-retryable failure: {}",
                        error
                    );
                    return (Err(error), attempt);
                }
                if attempt >= max_attempts {
                    warn!(
                        operation,
                        attempts = attempt,
                        "Retries exhausted: {}",
                        error
                    );
                    return (Err(error), attempt);
                }

                let delay = config.delay_for_attempt(attempt);
                debug!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying after failure: {}",
                    error
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or
/// `max_attempts` is reached
pub async fn retry_with_backoff<T, E, F, Fut>(
    config: &RetryConfig,
    operation: &str,
    op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Classify + Display,
{
    retry_counted(config, operation, op).await.0
}
