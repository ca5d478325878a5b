//! Process-wide circuit breakers keyed by operation name

use std::sync::Arc;

use dashmap::DashMap;

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerStats};
use crate::config::CircuitBreakerConfig;

/// Shared registry of breakers.
///
/// Breakers are created lazily on first use and live for the lifetime of
/// the registry; they are never scoped to a run.
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    /// Breaker for `operation`, created on first request
    pub fn get(&self, operation: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(operation) {
            return existing.clone();
        }
        self.breakers
            .entry(operation.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(operation, self.config.clone())))
            .clone()
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    /// Stats for every breaker, sorted by operation name
    pub fn stats(&self) -> Vec<CircuitBreakerStats> {
        let mut stats: Vec<_> = self.breakers.iter().map(|b| b.stats()).collect();
        stats.sort_by(|a, b| a.operation.cmp(&b.operation));
        stats
    }

    pub fn reset_all(&self) {
        for breaker in self.breakers.iter() {
            breaker.reset();
        }
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
