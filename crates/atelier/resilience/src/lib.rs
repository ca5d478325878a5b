//! Resilience wrappers for externally-backed calls
//!
//! - [`retry_with_backoff`]: bounded retries with exponential backoff and
//!   jitter, classified by [`ErrorKind`](atelier_types::ErrorKind)
//! - [`CircuitBreaker`]: closed → open → half-open → closed, per operation
//! - [`CircuitBreakerRegistry`]: the shared set of breakers
//!
//! Both wrappers are generic over the wrapped operation's result type and
//! compose: a retry loop around a breaker-guarded call fails fast once the
//! circuit opens, because an open circuit is not a retryable error.

#![deny(unsafe_code)]

pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod registry;
pub mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerStats, CircuitState};
pub use config::{CircuitBreakerConfig, RetryConfig};
pub use error::CircuitBreakerOpen;
pub use registry::CircuitBreakerRegistry;
pub use retry::{retry_counted, retry_with_backoff};
