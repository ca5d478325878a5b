//! Plans: ordered steps plus cost estimate and determinism lock
//!
//! A plan is produced by the planner, reviewed by the critic and consumed by
//! the executor. It may be replaced once by a human override before
//! execution starts.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Step parameters. Keys are kept sorted so that serialisation is stable.
pub type Params = serde_json::Map<String, Value>;

// ── Step ─────────────────────────────────────────────────────────────

/// One operation in a plan
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Identifier unique within the plan
    pub id: String,
    /// Operation name; must be in the operation catalog
    pub op: String,
    /// Operation parameters
    #[serde(default)]
    pub params: Params,
    /// Steps that must complete before this one starts
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// Output recorded by the executor
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

impl Step {
    pub fn new(id: impl Into<String>, op: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            op: op.into(),
            params: Params::new(),
            depends_on: Vec::new(),
            result: None,
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn after(mut self, step_id: impl Into<String>) -> Self {
        self.depends_on.push(step_id.into());
        self
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }

    pub fn param_u64(&self, key: &str) -> Option<u64> {
        self.params.get(key).and_then(Value::as_u64)
    }
}

// ── Determinism ──────────────────────────────────────────────────────

/// The `(seed, prompt_hash, model_version)` triple fixed before execution
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeterminismBlock {
    pub seed: u64,
    /// Hash of the ordered step list
    pub prompt_hash: String,
    pub model_version: String,
    pub locked: bool,
}

// ── Plan ─────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub steps: Vec<Step>,
    pub estimated_cost_usd: f64,
    #[serde(default)]
    pub estimated_duration_ms: u64,
    /// Artifacts the plan is expected to produce
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub requires_hitl: bool,
    #[serde(default)]
    pub determinism: DeterminismBlock,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, Value>,
}

impl Plan {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps,
            ..Self::default()
        }
    }

    pub fn with_cost(mut self, estimated_cost_usd: f64) -> Self {
        self.estimated_cost_usd = estimated_cost_usd;
        self
    }

    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn step_mut(&mut self, id: &str) -> Option<&mut Step> {
        self.steps.iter_mut().find(|s| s.id == id)
    }

    pub fn step_ids(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.id.as_str()).collect()
    }

    /// Steps using the given operation
    pub fn steps_with_op<'a>(&'a self, op: &'a str) -> impl Iterator<Item = &'a Step> + 'a {
        self.steps.iter().filter(move |s| s.op == op)
    }

    /// Whether the planner fell back to its default plan
    pub fn is_fallback(&self) -> bool {
        self.metadata
            .get("fallback")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn mark_fallback(&mut self, reason: impl Into<String>) {
        self.metadata.insert("fallback".into(), Value::Bool(true));
        self.metadata
            .insert("fallback_reason".into(), Value::String(reason.into()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_step_plan() -> Plan {
        Plan::new(vec![
            Step::new("s1", "onboard").with_param("source", "s3://bucket/shoe.png"),
            Step::new("s2", "remove_background")
                .with_param("asset", "s1")
                .after("s1"),
        ])
        .with_cost(0.06)
    }

    #[test]
    fn test_step_lookup() {
        let plan = two_step_plan();
        assert_eq!(plan.step("s2").unwrap().depends_on, vec!["s1".to_string()]);
        assert!(plan.step("s3").is_none());
        assert_eq!(plan.step_ids(), vec!["s1", "s2"]);
    }

    #[test]
    fn test_params_accessors() {
        let step = Step::new("b", "batch_generate")
            .with_param("count", 60)
            .with_param("prompt", "studio lighting");
        assert_eq!(step.param_u64("count"), Some(60));
        assert_eq!(step.param_str("prompt"), Some("studio lighting"));
        assert_eq!(step.param_str("count"), None);
    }

    #[test]
    fn test_fallback_marker() {
        let mut plan = two_step_plan();
        assert!(!plan.is_fallback());
        plan.mark_fallback("backend unavailable");
        assert!(plan.is_fallback());
    }

    #[test]
    fn test_plan_deserializes_with_defaults() {
        let plan: Plan = serde_json::from_str(
            r#"{"steps":[{"id":"a","op":"onboard","params":{"source":"x"}}],"estimated_cost_usd":0.01}"#,
        )
        .unwrap();
        assert!(!plan.requires_hitl);
        assert!(!plan.determinism.locked);
        assert!(plan.steps[0].depends_on.is_empty());
    }
}
