//! Critic agent: reviews the plan against the guardrails

use super::Agent;
use crate::cancel::CancelSignal;
use async_trait::async_trait;
use atelier_guard::GuardrailEngine;
use atelier_types::{
    AgentRole, Critique, GuardrailCode, WorkflowContext, WorkflowError, WorkflowResult,
};
use std::sync::Arc;
use tracing::{info, warn};

/// Produces a [`Critique`]. Never raises: if the review cannot run, a
/// default-ok critique with an explanatory suggestion is recorded instead.
pub struct CriticAgent {
    guardrails: Arc<GuardrailEngine>,
}

impl CriticAgent {
    pub fn new(guardrails: Arc<GuardrailEngine>) -> Self {
        Self { guardrails }
    }

    fn review(&self, ctx: &mut WorkflowContext) -> WorkflowResult<Critique> {
        let plan = ctx.plan.as_mut().ok_or(WorkflowError::MissingPlan)?;
        let report = self.guardrails.review(plan);

        let mut suggestions: Vec<String> = Vec::new();
        for issue in &report.issues {
            let suggestion = suggestion_for(issue.code).to_string();
            if !suggestions.contains(&suggestion) {
                suggestions.push(suggestion);
            }
        }
        if plan.is_fallback() {
            suggestions.push(
                "The planner fell back to its default plan; confirm it matches the request"
                    .to_string(),
            );
        }

        let cost = plan.estimated_cost_usd.max(report.recomputed_cost_usd);
        let mut critique = Critique::from_issues(report.issues, cost);
        critique.suggestions = suggestions;
        critique.requires_hitl = report.requires_hitl;
        if critique.requires_hitl {
            plan.requires_hitl = true;
        }
        Ok(critique)
    }
}

fn suggestion_for(code: GuardrailCode) -> &'static str {
    match code {
        GuardrailCode::CostLimitExceeded => {
            "Reduce batch sizes or drop optional steps to get under the cost ceiling"
        }
        GuardrailCode::OpNotAllowed => "Replace operations that are not in the catalog",
        GuardrailCode::TooManySteps => "Merge or remove steps",
        GuardrailCode::BatchLimitExceeded => "Split the batch across several runs",
        GuardrailCode::MissingParameter | GuardrailCode::InvalidParameter => {
            "Supply every required parameter with the right type"
        }
        GuardrailCode::UnknownDependency => "Point every dependency at an earlier step",
        GuardrailCode::NonDeterministicRun => "Re-plan so the determinism lock is refreshed",
        GuardrailCode::EmptyPlan => "Re-plan with at least one step",
        GuardrailCode::CostEstimateDrift => "Re-estimate the plan cost from the catalog prices",
        GuardrailCode::ApprovalRequired => "Check cost and batch size before approving",
    }
}

#[async_trait]
impl Agent for CriticAgent {
    fn role(&self) -> AgentRole {
        AgentRole::Critic
    }

    async fn run(&self, ctx: &mut WorkflowContext, _cancel: &CancelSignal) -> WorkflowResult<()> {
        match self.review(ctx) {
            Ok(critique) => {
                info!(
                    run_id = %ctx.run_id,
                    ok = critique.ok,
                    issues = critique.issues.len(),
                    requires_hitl = critique.requires_hitl,
                    "Critique ready"
                );
                ctx.critique = Some(critique);
            }
            Err(e) => {
                warn!(run_id = %ctx.run_id, "Critic failed, proceeding with default critique: {}", e);
                let cost = ctx
                    .plan
                    .as_ref()
                    .map(|p| p.estimated_cost_usd)
                    .unwrap_or(0.0);
                ctx.critique = Some(Critique::default_ok(cost, format!("critic unavailable: {e}")));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atelier_types::{Plan, Step};
    use serde_json::json;

    fn critic() -> CriticAgent {
        CriticAgent::new(Arc::new(GuardrailEngine::default()))
    }

    fn ctx_with(plan: Plan) -> WorkflowContext {
        let mut ctx = WorkflowContext::new(json!({}));
        ctx.plan = Some(plan);
        ctx
    }

    fn batch(count: u64, cost: f64) -> Plan {
        Plan::new(vec![
            Step::new("s1", "onboard").with_param("source", "x"),
            Step::new("s2", "batch_generate")
                .with_param("prompt", "marble")
                .with_param("count", count)
                .after("s1"),
        ])
        .with_cost(cost)
    }

    #[tokio::test]
    async fn test_clean_plan() {
        let mut ctx = ctx_with(batch(4, 0.06));
        critic().run(&mut ctx, &CancelSignal::new()).await.unwrap();

        let critique = ctx.critique.as_ref().unwrap();
        assert!(critique.ok);
        assert!(critique.issues.is_empty());
        assert!(!ctx.requires_human_approval());
    }

    #[tokio::test]
    async fn test_large_batch_flags_plan_for_review() {
        let mut ctx = ctx_with(batch(60, 0.76));
        critic().run(&mut ctx, &CancelSignal::new()).await.unwrap();

        let critique = ctx.critique.as_ref().unwrap();
        assert!(critique.ok);
        assert!(critique.requires_hitl);
        assert!(ctx.plan.as_ref().unwrap().requires_hitl);
        assert!(ctx.requires_human_approval());
        assert!(!critique.suggestions.is_empty());
    }

    #[tokio::test]
    async fn test_blocking_issue_is_not_ok() {
        let mut plan = batch(4, 0.06);
        plan.steps.push(Step::new("s3", "mine_crypto"));
        let mut ctx = ctx_with(plan);
        critic().run(&mut ctx, &CancelSignal::new()).await.unwrap();

        let critique = ctx.critique.as_ref().unwrap();
        assert!(!critique.ok);
        assert!(critique.has_blocking());
        assert!(ctx.requires_human_approval());
    }

    #[tokio::test]
    async fn test_missing_plan_is_not_fatal() {
        let mut ctx = WorkflowContext::new(json!({}));
        critic().run(&mut ctx, &CancelSignal::new()).await.unwrap();

        let critique = ctx.critique.as_ref().unwrap();
        assert!(critique.ok);
        assert!(critique.suggestions[0].contains("critic unavailable"));
    }
}
