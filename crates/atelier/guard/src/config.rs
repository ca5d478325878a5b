//! Guardrail thresholds

use serde::{Deserialize, Serialize};

/// Limits enforced by the guardrail engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardrailConfig {
    /// Hard cost ceiling for planner-produced plans
    pub max_cost_usd: f64,

    /// Admin overrides may spend up to `max_cost_usd * admin_override_multiplier`
    pub admin_override_multiplier: f64,

    /// Maximum number of steps in a plan
    pub max_steps: usize,

    /// Maximum items requested across all expensive steps
    pub max_batch_size: u64,

    /// Maximum number of expensive steps in a plan
    pub max_expensive_steps: usize,

    /// Plans estimated above this need a human decision
    pub hitl_cost_threshold_usd: f64,

    /// Expensive steps requesting more items than this need a human decision
    pub hitl_batch_threshold: u64,

    /// Relative difference between stated and recomputed cost that raises
    /// an advisory issue
    pub cost_drift_tolerance: f64,
}

impl Default for GuardrailConfig {
    fn default() -> Self {
        Self {
            max_cost_usd: 2.0,
            admin_override_multiplier: 2.0,
            max_steps: 10,
            max_batch_size: 100,
            max_expensive_steps: 3,
            hitl_cost_threshold_usd: 0.50,
            hitl_batch_threshold: 50,
            cost_drift_tolerance: 0.25,
        }
    }
}

impl GuardrailConfig {
    /// Ceiling applied to a plan; relaxed but still capped for overrides
    pub fn cost_ceiling(&self, admin_override: bool) -> f64 {
        if admin_override {
            self.max_cost_usd * self.admin_override_multiplier.max(1.0)
        } else {
            self.max_cost_usd
        }
    }
}
