//! Engine configuration
//!
//! Sources, later wins: built-in defaults, a TOML file, then environment
//! variables.

use crate::error::ConfigError;
use atelier_guard::GuardrailConfig;
use atelier_resilience::{CircuitBreakerConfig, RetryConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Hard cost ceiling for planner-produced plans
    pub max_cost_usd: f64,
    pub admin_override_multiplier: f64,
    pub max_steps: usize,
    pub max_batch_size: u64,
    pub max_expensive_steps: usize,
    pub hitl_cost_threshold_usd: f64,
    pub hitl_batch_threshold: u64,
    pub cost_drift_tolerance: f64,

    /// Parallel-executor concurrency
    pub max_parallel_tasks: usize,

    pub retry_max_attempts: u32,
    pub retry_initial_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub retry_jitter: bool,

    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_recovery_seconds: u64,
    pub circuit_breaker_half_open_max_calls: u32,

    /// Per-step tool timeout
    pub step_timeout_seconds: u64,
    /// Per-attempt planner backend timeout
    pub planner_timeout_seconds: u64,
    /// Recorded in every determinism lock
    pub model_version: String,

    /// Events kept for replay to late subscribers
    pub event_history_size: usize,
    /// Polling-subscription interval
    pub poll_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let guardrails = GuardrailConfig::default();
        Self {
            max_cost_usd: guardrails.max_cost_usd,
            admin_override_multiplier: guardrails.admin_override_multiplier,
            max_steps: guardrails.max_steps,
            max_batch_size: guardrails.max_batch_size,
            max_expensive_steps: guardrails.max_expensive_steps,
            hitl_cost_threshold_usd: guardrails.hitl_cost_threshold_usd,
            hitl_batch_threshold: guardrails.hitl_batch_threshold,
            cost_drift_tolerance: guardrails.cost_drift_tolerance,
            max_parallel_tasks: 3,
            retry_max_attempts: 3,
            retry_initial_delay_ms: 200,
            retry_max_delay_ms: 5_000,
            retry_jitter: true,
            circuit_breaker_threshold: 5,
            circuit_breaker_recovery_seconds: 30,
            circuit_breaker_half_open_max_calls: 1,
            step_timeout_seconds: 60,
            planner_timeout_seconds: 30,
            model_version: "atelier-planner-v1".to_string(),
            event_history_size: 1_000,
            poll_interval_ms: 500,
        }
    }
}

impl EngineConfig {
    /// Load from a TOML file; missing keys keep their defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig =
            toml::from_str(contents).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overlaid with the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Overlay values from the process environment
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_vars(|key| std::env::var(key).ok())
    }

    /// Overlay values from an arbitrary variable source
    pub fn apply_vars<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        overlay(&lookup, "MAX_COST_USD", &mut self.max_cost_usd)?;
        overlay(&lookup, "MAX_STEPS", &mut self.max_steps)?;
        overlay(&lookup, "MAX_PARALLEL_TASKS", &mut self.max_parallel_tasks)?;
        overlay(&lookup, "RETRY_MAX_ATTEMPTS", &mut self.retry_max_attempts)?;
        overlay(
            &lookup,
            "CIRCUIT_BREAKER_THRESHOLD",
            &mut self.circuit_breaker_threshold,
        )?;
        overlay(
            &lookup,
            "CIRCUIT_BREAKER_RECOVERY_SECONDS",
            &mut self.circuit_breaker_recovery_seconds,
        )?;
        self.validate()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.max_cost_usd.is_finite() || self.max_cost_usd <= 0.0 {
            return Err(ConfigError::Invalid(
                "max_cost_usd must be a positive finite amount".into(),
            ));
        }
        if !self.admin_override_multiplier.is_finite() || self.admin_override_multiplier < 1.0 {
            return Err(ConfigError::Invalid(
                "admin_override_multiplier must be at least 1.0".into(),
            ));
        }
        if !self.hitl_cost_threshold_usd.is_finite() || self.hitl_cost_threshold_usd < 0.0 {
            return Err(ConfigError::Invalid(
                "hitl_cost_threshold_usd must be a finite amount".into(),
            ));
        }
        if !self.cost_drift_tolerance.is_finite() || self.cost_drift_tolerance < 0.0 {
            return Err(ConfigError::Invalid(
                "cost_drift_tolerance must be finite and non-negative".into(),
            ));
        }
        if self.max_steps == 0 {
            return Err(ConfigError::Invalid("max_steps must be positive".into()));
        }
        if self.max_parallel_tasks == 0 {
            return Err(ConfigError::Invalid(
                "max_parallel_tasks must be positive".into(),
            ));
        }
        if self.retry_max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry_max_attempts must be positive".into(),
            ));
        }
        if self.circuit_breaker_threshold == 0 {
            return Err(ConfigError::Invalid(
                "circuit_breaker_threshold must be positive".into(),
            ));
        }
        if self.model_version.trim().is_empty() {
            return Err(ConfigError::Invalid("model_version must be set".into()));
        }
        Ok(())
    }

    pub fn guardrail_config(&self) -> GuardrailConfig {
        GuardrailConfig {
            max_cost_usd: self.max_cost_usd,
            admin_override_multiplier: self.admin_override_multiplier,
            max_steps: self.max_steps,
            max_batch_size: self.max_batch_size,
            max_expensive_steps: self.max_expensive_steps,
            hitl_cost_threshold_usd: self.hitl_cost_threshold_usd,
            hitl_batch_threshold: self.hitl_batch_threshold,
            cost_drift_tolerance: self.cost_drift_tolerance,
        }
    }

    pub fn retry_config(&self) -> RetryConfig {
        let mut retry = RetryConfig::default()
            .with_max_attempts(self.retry_max_attempts)
            .with_delays(
                Duration::from_millis(self.retry_initial_delay_ms),
                Duration::from_millis(self.retry_max_delay_ms),
            );
        retry.jitter = self.retry_jitter;
        retry
    }

    pub fn circuit_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.circuit_breaker_threshold,
            recovery_timeout: Duration::from_secs(self.circuit_breaker_recovery_seconds),
            half_open_max_calls: self.circuit_breaker_half_open_max_calls.max(1),
        }
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_seconds)
    }

    pub fn planner_timeout(&self) -> Duration {
        Duration::from_secs(self.planner_timeout_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn overlay<T, F>(lookup: &F, key: &str, target: &mut T) -> Result<(), ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = lookup(key) {
        *target = raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            value: raw.clone(),
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_cost_usd, 2.0);
        assert_eq!(config.max_parallel_tasks, 3);
        assert_eq!(config.event_history_size, 1_000);
        assert!(config.validate().is_ok());
        assert_eq!(config.guardrail_config().cost_ceiling(true), 4.0);
        assert_eq!(config.retry_config().max_attempts, 3);
        assert_eq!(
            config.circuit_breaker_config().recovery_timeout,
            Duration::from_secs(30)
        );
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = EngineConfig::from_toml(
            r#"
            max_cost_usd = 5.0
            model_version = "planner-v2"
            "#,
        )
        .unwrap();
        assert_eq!(config.max_cost_usd, 5.0);
        assert_eq!(config.model_version, "planner-v2");
        assert_eq!(config.max_steps, 10);
    }

    #[test]
    fn test_invalid_toml_rejected() {
        assert!(matches!(
            EngineConfig::from_toml("max_cost_usd = \"lots\""),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            EngineConfig::from_toml("max_parallel_tasks = 0"),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_env_overlay() {
        let vars: HashMap<&str, &str> = [("MAX_COST_USD", "3.5"), ("MAX_PARALLEL_TASKS", "8")]
            .into_iter()
            .collect();
        let mut config = EngineConfig::default();
        config
            .apply_vars(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.max_cost_usd, 3.5);
        assert_eq!(config.max_parallel_tasks, 8);
        assert_eq!(config.retry_max_attempts, 3);
    }

    #[test]
    fn test_env_overlay_rejects_garbage() {
        let mut config = EngineConfig::default();
        let err = config
            .apply_vars(|key| (key == "MAX_STEPS").then(|| "many".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "MAX_STEPS"));
    }

    #[test]
    fn test_non_finite_amounts_rejected() {
        let mut config = EngineConfig::default();
        let err = config
            .apply_vars(|key| (key == "MAX_COST_USD").then(|| "inf".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(ref msg) if msg.contains("max_cost_usd")));

        for multiplier in [f64::NAN, f64::INFINITY] {
            let config = EngineConfig {
                admin_override_multiplier: multiplier,
                ..EngineConfig::default()
            };
            assert!(config.validate().is_err());
        }
    }

    #[test]
    fn test_load_missing_file() {
        assert!(matches!(
            EngineConfig::load("/nonexistent/atelier.toml"),
            Err(ConfigError::Io(_))
        ));
    }
}
