//! Guardrail engine: composes the rules into review and enforcement calls
//!
//! Two entry points matter:
//! - [`GuardrailEngine::review`] runs every rule and reports all issues, for
//!   the critic. Nothing is raised.
//! - [`GuardrailEngine::enforce_execution`] raises the first blocking
//!   violation, for the executor. A plan that fails here never runs.

use crate::catalog::{round_cents, OperationCatalog};
use crate::config::GuardrailConfig;
use crate::determinism;
use crate::rules;
use atelier_types::{GuardrailError, GuardrailIssue, Plan};
use serde::{Deserialize, Serialize};
use std::future::Future;

/// Everything the rules found in one pass over a plan
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GuardrailReport {
    pub issues: Vec<GuardrailIssue>,
    /// Step-by-step recomputed cost
    pub recomputed_cost_usd: f64,
    /// The plan needs a human decision before execution
    pub requires_hitl: bool,
}

impl GuardrailReport {
    pub fn is_valid(&self) -> bool {
        !self.issues.iter().any(GuardrailIssue::is_blocking)
    }

    /// First blocking issue, as an error
    pub fn first_violation(&self) -> Option<GuardrailError> {
        self.issues
            .iter()
            .find(|i| i.is_blocking())
            .map(GuardrailIssue::to_error)
    }
}

/// Stateless validator over plans
#[derive(Clone, Debug)]
pub struct GuardrailEngine {
    config: GuardrailConfig,
    catalog: OperationCatalog,
}

impl GuardrailEngine {
    pub fn new(config: GuardrailConfig, catalog: OperationCatalog) -> Self {
        Self { config, catalog }
    }

    pub fn config(&self) -> &GuardrailConfig {
        &self.config
    }

    pub fn catalog(&self) -> &OperationCatalog {
        &self.catalog
    }

    /// Policy rules only (no approval triggers)
    fn policy_issues(&self, plan: &Plan, ceiling_usd: f64) -> Vec<GuardrailIssue> {
        let mut issues = Vec::new();
        issues.extend(rules::check_operations(plan, &self.catalog));
        issues.extend(rules::check_cost_ceiling(plan, &self.catalog, ceiling_usd));
        issues.extend(rules::check_step_limits(plan, &self.catalog, &self.config));
        issues.extend(rules::check_parameters(plan, &self.catalog));
        issues.extend(rules::check_dependencies(plan));
        issues.extend(rules::check_cost_drift(
            plan,
            &self.catalog,
            self.config.cost_drift_tolerance,
        ));
        issues
    }

    /// Full review for the critic: policy violations, drift and approval
    /// triggers, all reported independently
    pub fn review(&self, plan: &Plan) -> GuardrailReport {
        let mut issues = self.policy_issues(plan, self.config.cost_ceiling(false));
        let triggers = rules::check_approval_triggers(plan, &self.catalog, &self.config);
        let requires_hitl = plan.requires_hitl
            || !triggers.is_empty()
            || issues.iter().any(GuardrailIssue::is_blocking);
        issues.extend(triggers);

        GuardrailReport {
            issues,
            recomputed_cost_usd: self.catalog.plan_cost(plan),
            requires_hitl,
        }
    }

    /// `(is_valid, issues)` under the standard ceiling
    pub fn validate_plan(&self, plan: &Plan) -> (bool, Vec<GuardrailIssue>) {
        let issues = self.policy_issues(plan, self.config.cost_ceiling(false));
        let valid = !issues.iter().any(GuardrailIssue::is_blocking);
        (valid, issues)
    }

    /// Raise the first blocking violation under the given ceiling
    pub fn enforce(&self, plan: &Plan, admin_override: bool) -> Result<(), GuardrailError> {
        let issues = self.policy_issues(plan, self.config.cost_ceiling(admin_override));
        match issues.iter().find(|i| i.is_blocking()) {
            Some(issue) => {
                tracing::warn!(code = %issue.code, "Guardrail violation: {}", issue.message);
                Err(issue.to_error())
            }
            None => Ok(()),
        }
    }

    /// Validate a human-supplied replacement plan under the relaxed ceiling
    pub fn validate_override(&self, plan: &Plan) -> Result<(), GuardrailError> {
        self.enforce(plan, true)
    }

    /// Gate in front of the executor: determinism lock plus policy
    pub fn enforce_execution(
        &self,
        plan: &Plan,
        admin_override: bool,
    ) -> Result<(), GuardrailError> {
        determinism::verify_lock(plan)?;
        self.enforce(plan, admin_override)
    }

    /// Recomputed cost, rounded
    pub fn recompute_cost(&self, plan: &Plan) -> f64 {
        round_cents(self.catalog.plan_cost(plan))
    }
}

impl Default for GuardrailEngine {
    fn default() -> Self {
        Self::new(GuardrailConfig::default(), OperationCatalog::standard())
    }
}

/// Run `check` before `phase`; on a violation `phase` is never invoked
/// and the guardrail error propagates.
pub async fn guarded<T, E, F, Fut>(check: Result<(), GuardrailError>, phase: F) -> Result<T, E>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: From<GuardrailError>,
{
    check?;
    phase().await
}
