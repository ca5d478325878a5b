//! The allowed-operations registry
//!
//! Every step's `op` must name an entry here. The catalog also carries what
//! the guardrails and the executor need to know about an operation: its
//! price, whether a failure halts the run, and which parameters it requires.

use atelier_types::{Plan, Step};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Expected JSON type of a parameter
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    String,
    Integer,
    Number,
    Bool,
}

impl ParamKind {
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            ParamKind::String => value.as_str().is_some_and(|s| !s.trim().is_empty()),
            ParamKind::Integer => value.is_u64() || value.is_i64(),
            ParamKind::Number => value.is_number(),
            ParamKind::Bool => value.is_boolean(),
        }
    }
}

impl std::fmt::Display for ParamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParamKind::String => write!(f, "non-empty string"),
            ParamKind::Integer => write!(f, "integer"),
            ParamKind::Number => write!(f, "number"),
            ParamKind::Bool => write!(f, "boolean"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    pub kind: ParamKind,
}

/// How an operation is priced
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Pricing {
    Flat { usd: f64 },
    /// `unit_usd` times the integer parameter `param`
    PerItem { param: String, unit_usd: f64 },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OperationSpec {
    pub name: String,
    pub pricing: Pricing,
    /// A failure of a critical step halts the run
    pub critical: bool,
    /// Counted against the batch ceilings
    pub expensive: bool,
    pub required: Vec<ParamSpec>,
    pub typical_duration_ms: u64,
}

impl OperationSpec {
    pub fn new(name: impl Into<String>, pricing: Pricing) -> Self {
        Self {
            name: name.into(),
            pricing,
            critical: false,
            expensive: false,
            required: Vec::new(),
            typical_duration_ms: 1_000,
        }
    }

    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    pub fn expensive(mut self) -> Self {
        self.expensive = true;
        self
    }

    pub fn requires(mut self, name: impl Into<String>, kind: ParamKind) -> Self {
        self.required.push(ParamSpec {
            name: name.into(),
            kind,
        });
        self
    }

    pub fn takes_ms(mut self, ms: u64) -> Self {
        self.typical_duration_ms = ms;
        self
    }

    /// Items requested by a step of this operation (1 for flat-priced ops)
    pub fn item_count(&self, step: &Step) -> u64 {
        match &self.pricing {
            Pricing::Flat { .. } => 1,
            Pricing::PerItem { param, .. } => step.param_u64(param).unwrap_or(0),
        }
    }

    pub fn cost(&self, step: &Step) -> f64 {
        match &self.pricing {
            Pricing::Flat { usd } => *usd,
            Pricing::PerItem { unit_usd, .. } => *unit_usd * self.item_count(step) as f64,
        }
    }
}

/// Registry of allowed operations
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct OperationCatalog {
    ops: BTreeMap<String, OperationSpec>,
}

impl OperationCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// The studio operation set
    pub fn standard() -> Self {
        use ParamKind::*;

        let mut catalog = Self::new();
        catalog.register(
            OperationSpec::new("onboard", Pricing::Flat { usd: 0.01 })
                .critical()
                .requires("source", String)
                .takes_ms(500),
        );
        catalog.register(
            OperationSpec::new("remove_background", Pricing::Flat { usd: 0.05 })
                .critical()
                .requires("asset", String)
                .takes_ms(3_000),
        );
        catalog.register(
            OperationSpec::new("color_correct", Pricing::Flat { usd: 0.02 })
                .requires("asset", String)
                .takes_ms(1_500),
        );
        catalog.register(
            OperationSpec::new("upscale", Pricing::Flat { usd: 0.04 })
                .requires("asset", String)
                .requires("factor", Number)
                .takes_ms(4_000),
        );
        catalog.register(
            OperationSpec::new("generate_aovs", Pricing::Flat { usd: 0.08 })
                .requires("asset", String)
                .takes_ms(6_000),
        );
        catalog.register(
            OperationSpec::new(
                "batch_generate",
                Pricing::PerItem {
                    param: "count".into(),
                    unit_usd: 0.0125,
                },
            )
            .critical()
            .expensive()
            .requires("prompt", String)
            .requires("count", Integer)
            .takes_ms(20_000),
        );
        catalog.register(
            OperationSpec::new("composite", Pricing::Flat { usd: 0.03 })
                .critical()
                .requires("asset", String)
                .requires("background", String)
                .takes_ms(2_500),
        );
        catalog.register(
            OperationSpec::new("export", Pricing::Flat { usd: 0.01 })
                .critical()
                .requires("asset", String)
                .requires("format", String)
                .takes_ms(800),
        );
        catalog
    }

    pub fn register(&mut self, spec: OperationSpec) {
        self.ops.insert(spec.name.clone(), spec);
    }

    pub fn get(&self, op: &str) -> Option<&OperationSpec> {
        self.ops.get(op)
    }

    pub fn contains(&self, op: &str) -> bool {
        self.ops.contains_key(op)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.ops.keys().map(String::as_str)
    }

    /// Unknown operations are treated as critical
    pub fn is_critical(&self, op: &str) -> bool {
        self.get(op).map(|s| s.critical).unwrap_or(true)
    }

    /// Cost of one step; unknown operations cost nothing here and are
    /// rejected by the whitelist check instead
    pub fn step_cost(&self, step: &Step) -> f64 {
        self.get(&step.op).map(|s| s.cost(step)).unwrap_or(0.0)
    }

    /// Step-by-step recomputation of a plan's cost
    pub fn plan_cost(&self, plan: &Plan) -> f64 {
        let total: f64 = plan.steps.iter().map(|s| self.step_cost(s)).sum();
        round_cents(total)
    }

    pub fn plan_duration_ms(&self, plan: &Plan) -> u64 {
        plan.steps
            .iter()
            .filter_map(|s| self.get(&s.op))
            .map(|s| s.typical_duration_ms)
            .sum()
    }
}

/// Round to 1/10000 USD to keep sums of catalog prices stable
pub fn round_cents(usd: f64) -> f64 {
    (usd * 10_000.0).round() / 10_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_catalog_contents() {
        let catalog = OperationCatalog::standard();
        assert!(catalog.contains("onboard"));
        assert!(catalog.contains("batch_generate"));
        assert!(!catalog.contains("delete_everything"));
        assert!(catalog.is_critical("onboard"));
        assert!(!catalog.is_critical("upscale"));
        assert!(catalog.is_critical("delete_everything"));
    }

    #[test]
    fn test_two_step_plan_costs_six_cents() {
        let catalog = OperationCatalog::standard();
        let plan = Plan::new(vec![
            Step::new("s1", "onboard").with_param("source", "x"),
            Step::new("s2", "remove_background").with_param("asset", "s1"),
        ]);
        assert_eq!(catalog.plan_cost(&plan), 0.06);
    }

    #[test]
    fn test_per_item_pricing() {
        let catalog = OperationCatalog::standard();
        let step = Step::new("b", "batch_generate")
            .with_param("prompt", "p")
            .with_param("count", 60);
        assert_eq!(round_cents(catalog.step_cost(&step)), 0.75);
    }

    #[test]
    fn test_param_kinds() {
        assert!(ParamKind::String.matches(&Value::from("x")));
        assert!(!ParamKind::String.matches(&Value::from("  ")));
        assert!(ParamKind::Integer.matches(&Value::from(3)));
        assert!(!ParamKind::Integer.matches(&Value::from(3.5)));
        assert!(ParamKind::Number.matches(&Value::from(3.5)));
        assert!(!ParamKind::Bool.matches(&Value::from("true")));
    }
}
