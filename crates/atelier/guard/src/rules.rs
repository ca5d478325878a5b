//! Individual guardrail rules
//!
//! Each rule is a pure function from a plan (plus limits) to the issues it
//! finds. Rules never short-circuit each other; the engine decides what to
//! do with the combined list.

use crate::catalog::{round_cents, OperationCatalog};
use crate::config::GuardrailConfig;
use atelier_types::{GuardrailCode, GuardrailIssue, Plan};
use std::collections::HashSet;

/// The cost used for the ceiling: the larger of stated and recomputed
pub fn effective_cost(plan: &Plan, catalog: &OperationCatalog) -> f64 {
    plan.estimated_cost_usd.max(catalog.plan_cost(plan))
}

/// `estimated_cost_usd <= ceiling`
pub fn check_cost_ceiling(
    plan: &Plan,
    catalog: &OperationCatalog,
    ceiling_usd: f64,
) -> Vec<GuardrailIssue> {
    let cost = round_cents(effective_cost(plan, catalog));
    if cost > ceiling_usd {
        vec![GuardrailIssue::blocking(
            GuardrailCode::CostLimitExceeded,
            format!("estimated cost ${cost:.4} exceeds ceiling ${ceiling_usd:.2}"),
        )]
    } else {
        Vec::new()
    }
}

/// Every step's `op` must be in the catalog
pub fn check_operations(plan: &Plan, catalog: &OperationCatalog) -> Vec<GuardrailIssue> {
    plan.steps
        .iter()
        .filter(|s| !catalog.contains(&s.op))
        .map(|s| {
            GuardrailIssue::blocking(
                GuardrailCode::OpNotAllowed,
                format!("operation '{}' is not allowed", s.op),
            )
            .for_step(&s.id)
        })
        .collect()
}

/// Step count and expensive-operation ceilings
pub fn check_step_limits(
    plan: &Plan,
    catalog: &OperationCatalog,
    config: &GuardrailConfig,
) -> Vec<GuardrailIssue> {
    let mut issues = Vec::new();

    if plan.steps.is_empty() {
        issues.push(GuardrailIssue::blocking(
            GuardrailCode::EmptyPlan,
            "plan has no steps",
        ));
    }

    if plan.steps.len() > config.max_steps {
        issues.push(GuardrailIssue::blocking(
            GuardrailCode::TooManySteps,
            format!(
                "plan has {} steps, maximum is {}",
                plan.steps.len(),
                config.max_steps
            ),
        ));
    }

    let mut expensive_steps = 0usize;
    let mut total_items = 0u64;
    for step in &plan.steps {
        let Some(spec) = catalog.get(&step.op) else {
            continue;
        };
        if !spec.expensive {
            continue;
        }
        expensive_steps += 1;
        let items = spec.item_count(step);
        total_items += items;
        if items > config.max_batch_size {
            issues.push(
                GuardrailIssue::blocking(
                    GuardrailCode::BatchLimitExceeded,
                    format!(
                        "'{}' requests {} items, maximum is {}",
                        step.op, items, config.max_batch_size
                    ),
                )
                .for_step(&step.id),
            );
        }
    }

    if expensive_steps > config.max_expensive_steps {
        issues.push(GuardrailIssue::blocking(
            GuardrailCode::BatchLimitExceeded,
            format!(
                "plan has {} expensive steps, maximum is {}",
                expensive_steps, config.max_expensive_steps
            ),
        ));
    }

    // Individual steps may each be under the limit while their sum is not
    if expensive_steps > 1 && total_items > config.max_batch_size {
        issues.push(GuardrailIssue::blocking(
            GuardrailCode::BatchLimitExceeded,
            format!(
                "plan requests {} items in total, maximum is {}",
                total_items, config.max_batch_size
            ),
        ));
    }

    issues
}

/// Operation-specific required fields must be present and well-typed
pub fn check_parameters(plan: &Plan, catalog: &OperationCatalog) -> Vec<GuardrailIssue> {
    let mut issues = Vec::new();
    for step in &plan.steps {
        let Some(spec) = catalog.get(&step.op) else {
            continue;
        };
        for param in &spec.required {
            match step.params.get(&param.name) {
                None => issues.push(
                    GuardrailIssue::blocking(
                        GuardrailCode::MissingParameter,
                        format!("'{}' requires parameter '{}'", step.op, param.name),
                    )
                    .for_step(&step.id),
                ),
                Some(value) if !param.kind.matches(value) => issues.push(
                    GuardrailIssue::blocking(
                        GuardrailCode::InvalidParameter,
                        format!(
                            "'{}' parameter '{}' must be a {}",
                            step.op, param.name, param.kind
                        ),
                    )
                    .for_step(&step.id),
                ),
                Some(_) => {}
            }
        }
    }
    issues
}

/// Step ids are unique and every dependency names another step
pub fn check_dependencies(plan: &Plan) -> Vec<GuardrailIssue> {
    let mut issues = Vec::new();
    let mut seen = HashSet::new();
    for step in &plan.steps {
        if !seen.insert(step.id.as_str()) {
            issues.push(
                GuardrailIssue::blocking(
                    GuardrailCode::InvalidParameter,
                    format!("duplicate step id '{}'", step.id),
                )
                .for_step(&step.id),
            );
        }
    }

    let ids: HashSet<&str> = plan.steps.iter().map(|s| s.id.as_str()).collect();
    for step in &plan.steps {
        for dep in &step.depends_on {
            if dep == &step.id || !ids.contains(dep.as_str()) {
                issues.push(
                    GuardrailIssue::blocking(
                        GuardrailCode::UnknownDependency,
                        format!("step '{}' depends on unknown step '{}'", step.id, dep),
                    )
                    .for_step(&step.id),
                );
            }
        }
    }
    issues
}

/// Advisory: stated estimate disagrees with the per-step recomputation
pub fn check_cost_drift(
    plan: &Plan,
    catalog: &OperationCatalog,
    tolerance: f64,
) -> Vec<GuardrailIssue> {
    let recomputed = catalog.plan_cost(plan);
    let stated = plan.estimated_cost_usd;
    let baseline = recomputed.max(stated);
    if baseline <= 0.0 {
        return Vec::new();
    }
    let drift = (stated - recomputed).abs() / baseline;
    if drift > tolerance {
        vec![GuardrailIssue::advisory(
            GuardrailCode::CostEstimateDrift,
            format!(
                "stated cost ${stated:.4} differs from recomputed ${recomputed:.4} by {:.0}%",
                drift * 100.0
            ),
        )]
    } else {
        Vec::new()
    }
}

/// Advisory triggers for human review of an otherwise valid plan
pub fn check_approval_triggers(
    plan: &Plan,
    catalog: &OperationCatalog,
    config: &GuardrailConfig,
) -> Vec<GuardrailIssue> {
    let mut issues = Vec::new();

    let cost = effective_cost(plan, catalog);
    if cost > config.hitl_cost_threshold_usd {
        issues.push(GuardrailIssue::advisory(
            GuardrailCode::ApprovalRequired,
            format!(
                "estimated cost ${cost:.2} is above the approval threshold ${:.2}",
                config.hitl_cost_threshold_usd
            ),
        ));
    }

    for step in &plan.steps {
        let Some(spec) = catalog.get(&step.op) else {
            continue;
        };
        if !spec.expensive {
            continue;
        }
        let items = spec.item_count(step);
        if items > config.hitl_batch_threshold {
            issues.push(
                GuardrailIssue::advisory(
                    GuardrailCode::ApprovalRequired,
                    format!(
                        "'{}' requests {} items, approval needed above {}",
                        step.op, items, config.hitl_batch_threshold
                    ),
                )
                .for_step(&step.id),
            );
        }
    }

    issues
}
