//! Rule-based planner over the known studio intents

use super::PlannerBackend;
use async_trait::async_trait;
use atelier_guard::OperationCatalog;
use atelier_types::{Plan, Step, WorkflowContext, WorkflowError, WorkflowResult};
use serde_json::{Map, Value};

const DEFAULT_BATCH_COUNT: u64 = 4;
const DEFAULT_PROMPT: &str = "product variations";
const DEFAULT_BACKGROUND: &str = "studio_white";
const DEFAULT_FORMAT: &str = "png";

/// Maps an intent and its constraints onto a fixed step template
#[derive(Clone, Debug)]
pub struct TemplatePlanner {
    catalog: OperationCatalog,
}

impl TemplatePlanner {
    pub fn new(catalog: OperationCatalog) -> Self {
        Self { catalog }
    }

    fn build(&self, ctx: &WorkflowContext) -> WorkflowResult<Plan> {
        let intent = ctx
            .intent()
            .ok_or_else(|| WorkflowError::UnsupportedIntent("no intent given".into()))?;
        let constraints = ctx.constraints();
        let source = source_of(ctx);

        let steps = match intent {
            "edit_product_shot" => edit_product_shot(&source, &constraints),
            "batch_variations" => batch_variations(ctx, &source, &constraints),
            "composite_scene" => composite_scene(&source, &constraints),
            other => return Err(WorkflowError::UnsupportedIntent(other.to_string())),
        };

        let mut plan = Plan::new(steps);
        plan.estimated_cost_usd = self.catalog.plan_cost(&plan);
        plan.estimated_duration_ms = self.catalog.plan_duration_ms(&plan);
        plan.outputs = plan.steps.last().map(|s| vec![s.id.clone()]).unwrap_or_default();
        plan.requires_hitl = bool_of(&constraints, "require_approval");
        plan.metadata
            .insert("intent".into(), Value::String(intent.to_string()));
        Ok(plan)
    }
}

impl Default for TemplatePlanner {
    fn default() -> Self {
        Self::new(OperationCatalog::standard())
    }
}

#[async_trait]
impl PlannerBackend for TemplatePlanner {
    async fn plan(&self, ctx: &WorkflowContext) -> WorkflowResult<Plan> {
        self.build(ctx)
    }

    fn name(&self) -> &str {
        "template"
    }
}

/// The plan used when the planning backend fails: onboard then remove the
/// background. Always within default guardrails.
pub fn fallback_plan(ctx: &WorkflowContext, catalog: &OperationCatalog, reason: &str) -> Plan {
    let source = source_of(ctx);
    let mut plan = Plan::new(vec![
        Step::new("s1", "onboard").with_param("source", source),
        Step::new("s2", "remove_background")
            .with_param("asset", "s1")
            .after("s1"),
    ]);
    plan.estimated_cost_usd = catalog.plan_cost(&plan);
    plan.estimated_duration_ms = catalog.plan_duration_ms(&plan);
    plan.outputs = vec!["s2".to_string()];
    plan.requires_hitl = false;
    plan.mark_fallback(reason);
    plan
}

fn edit_product_shot(source: &str, constraints: &Map<String, Value>) -> Vec<Step> {
    let mut steps = vec![
        Step::new("s1", "onboard").with_param("source", source),
        Step::new("s2", "remove_background")
            .with_param("asset", "s1")
            .after("s1"),
    ];
    let mut last = "s2".to_string();

    if bool_of(constraints, "generate_aovs") {
        let id = format!("s{}", steps.len() + 1);
        steps.push(
            Step::new(&id, "generate_aovs")
                .with_param("asset", last.as_str())
                .after(&last),
        );
        last = id;
    }

    let factor = match constraints.get("upscale") {
        Some(Value::Bool(true)) => Some(2.0),
        Some(Value::Number(n)) => n.as_f64().filter(|f| *f > 1.0),
        _ => None,
    };
    if let Some(factor) = factor {
        let id = format!("s{}", steps.len() + 1);
        steps.push(
            Step::new(&id, "upscale")
                .with_param("asset", last.as_str())
                .with_param("factor", factor)
                .after(&last),
        );
    }
    steps
}

fn batch_variations(
    ctx: &WorkflowContext,
    source: &str,
    constraints: &Map<String, Value>,
) -> Vec<Step> {
    let count = constraints
        .get("count")
        .and_then(Value::as_u64)
        .unwrap_or(DEFAULT_BATCH_COUNT);
    let prompt = constraints
        .get("prompt")
        .and_then(Value::as_str)
        .or_else(|| ctx.input_data.get("prompt").and_then(Value::as_str))
        .unwrap_or(DEFAULT_PROMPT);

    vec![
        Step::new("s1", "onboard").with_param("source", source),
        Step::new("s2", "batch_generate")
            .with_param("prompt", prompt)
            .with_param("count", count)
            .with_param("asset", "s1")
            .after("s1"),
    ]
}

fn composite_scene(source: &str, constraints: &Map<String, Value>) -> Vec<Step> {
    let background = constraints
        .get("background")
        .and_then(Value::as_str)
        .unwrap_or(DEFAULT_BACKGROUND);
    let format = constraints
        .get("format")
        .and_then(Value::as_str)
        .unwrap_or(DEFAULT_FORMAT);

    vec![
        Step::new("s1", "onboard").with_param("source", source),
        Step::new("s2", "remove_background")
            .with_param("asset", "s1")
            .after("s1"),
        Step::new("s3", "composite")
            .with_param("asset", "s2")
            .with_param("background", background)
            .after("s2"),
        Step::new("s4", "export")
            .with_param("asset", "s3")
            .with_param("format", format)
            .after("s3"),
    ]
}

fn source_of(ctx: &WorkflowContext) -> String {
    ["source", "asset_url"]
        .iter()
        .find_map(|key| ctx.input_data.get(*key).and_then(Value::as_str))
        .map(str::to_string)
        .unwrap_or_else(|| format!("upload://{}", ctx.run_id))
}

fn bool_of(constraints: &Map<String, Value>, key: &str) -> bool {
    constraints.get(key).and_then(Value::as_bool).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use atelier_guard::GuardrailEngine;
    use serde_json::json;

    fn ctx(input: Value) -> WorkflowContext {
        WorkflowContext::new(input)
    }

    #[tokio::test]
    async fn test_edit_product_shot_without_aovs() {
        let planner = TemplatePlanner::default();
        let plan = planner
            .plan(&ctx(json!({
                "intent": "edit_product_shot",
                "source": "s3://shots/shoe.png",
                "constraints": {"generate_aovs": false}
            })))
            .await
            .unwrap();

        assert_eq!(plan.step_ids(), vec!["s1", "s2"]);
        assert_eq!(plan.estimated_cost_usd, 0.06);
        assert_eq!(plan.steps[0].param_str("source"), Some("s3://shots/shoe.png"));
        assert_eq!(plan.outputs, vec!["s2".to_string()]);
        assert!(!plan.requires_hitl);
    }

    #[tokio::test]
    async fn test_edit_product_shot_with_extras() {
        let plan = TemplatePlanner::default()
            .plan(&ctx(json!({
                "intent": "edit_product_shot",
                "constraints": {"generate_aovs": true, "upscale": 4}
            })))
            .await
            .unwrap();

        let ops: Vec<_> = plan.steps.iter().map(|s| s.op.as_str()).collect();
        assert_eq!(
            ops,
            vec!["onboard", "remove_background", "generate_aovs", "upscale"]
        );
        assert_eq!(plan.steps[3].depends_on, vec!["s3".to_string()]);
        assert_eq!(plan.estimated_cost_usd, 0.18);
    }

    #[tokio::test]
    async fn test_batch_variations_passes_guardrails_but_needs_review() {
        let plan = TemplatePlanner::default()
            .plan(&ctx(json!({
                "intent": "batch_variations",
                "constraints": {"count": 60, "prompt": "on marble"}
            })))
            .await
            .unwrap();

        assert_eq!(plan.estimated_cost_usd, 0.76);
        let report = GuardrailEngine::default().review(&plan);
        assert!(report.is_valid());
        assert!(report.requires_hitl);
    }

    #[tokio::test]
    async fn test_composite_scene_is_valid() {
        let plan = TemplatePlanner::default()
            .plan(&ctx(json!({"intent": "composite_scene"})))
            .await
            .unwrap();
        assert_eq!(plan.steps.len(), 4);
        assert!(GuardrailEngine::default().validate_plan(&plan).0);
    }

    #[tokio::test]
    async fn test_unknown_intent_is_an_error() {
        let err = TemplatePlanner::default()
            .plan(&ctx(json!({"intent": "paint_the_moon"})))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::UnsupportedIntent(ref i) if i == "paint_the_moon"));
    }

    #[test]
    fn test_fallback_plan_is_safe() {
        let context = ctx(json!({"intent": "whatever"}));
        let plan = fallback_plan(&context, &OperationCatalog::standard(), "backend down");
        assert!(plan.is_fallback());
        assert!(!plan.requires_hitl);
        assert_eq!(plan.estimated_cost_usd, 0.06);
        assert!(GuardrailEngine::default().validate_plan(&plan).0);
        assert!(plan.steps[0]
            .param_str("source")
            .unwrap()
            .starts_with("upload://"));
    }
}
