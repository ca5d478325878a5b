//! Determinism lock
//!
//! Before execution a plan carries `(seed, prompt_hash, model_version)`,
//! where `prompt_hash` is a pure function of the ordered step list. The
//! executor refuses a plan whose lock is missing or stale.

use atelier_types::{DeterminismBlock, GuardrailCode, GuardrailError, Plan, Step};
use serde::Serialize;

/// The parts of a step that define what will be executed
#[derive(Serialize)]
struct HashedStep<'a> {
    id: &'a str,
    op: &'a str,
    params: &'a atelier_types::Params,
    depends_on: &'a [String],
}

/// blake3 over the canonical JSON of the ordered steps.
///
/// Executor output (`Step::result`) is excluded so that recording results
/// does not invalidate the lock.
pub fn prompt_hash(steps: &[Step]) -> String {
    let hashed: Vec<HashedStep<'_>> = steps
        .iter()
        .map(|s| HashedStep {
            id: &s.id,
            op: &s.op,
            params: &s.params,
            depends_on: &s.depends_on,
        })
        .collect();

    // Params are a sorted map, so this encoding is canonical
    let encoded = serde_json::to_vec(&hashed).unwrap_or_default();
    blake3::hash(&encoded).to_hex().to_string()
}

/// Stable seed derived from an arbitrary key (normally the run id)
pub fn derive_seed(key: &str) -> u64 {
    let hash = blake3::hash(key.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&hash.as_bytes()[..8]);
    u64::from_le_bytes(bytes)
}

/// Fix the determinism triple on a plan
pub fn lock_plan(plan: &mut Plan, seed: u64, model_version: impl Into<String>) {
    plan.determinism = DeterminismBlock {
        seed,
        prompt_hash: prompt_hash(&plan.steps),
        model_version: model_version.into(),
        locked: true,
    };
}

/// Refuse plans that are unlocked or whose steps changed after locking
pub fn verify_lock(plan: &Plan) -> Result<(), GuardrailError> {
    let block = &plan.determinism;
    if !block.locked {
        return Err(GuardrailError::new(
            GuardrailCode::NonDeterministicRun,
            "plan has no determinism lock",
        ));
    }
    if block.model_version.trim().is_empty() {
        return Err(GuardrailError::new(
            GuardrailCode::NonDeterministicRun,
            "determinism lock has no model version",
        ));
    }
    let expected = prompt_hash(&plan.steps);
    if block.prompt_hash != expected {
        return Err(GuardrailError::new(
            GuardrailCode::NonDeterministicRun,
            format!(
                "prompt hash mismatch: locked {} but steps hash to {}",
                short(&block.prompt_hash),
                short(&expected)
            ),
        ));
    }
    Ok(())
}

fn short(hash: &str) -> &str {
    &hash[..12.min(hash.len())]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn steps() -> Vec<Step> {
        vec![
            Step::new("s1", "onboard").with_param("source", "a.png"),
            Step::new("s2", "remove_background")
                .with_param("asset", "s1")
                .after("s1"),
        ]
    }

    #[test]
    fn test_structurally_equal_plans_hash_equal() {
        assert_eq!(prompt_hash(&steps()), prompt_hash(&steps()));
    }

    #[test]
    fn test_hash_depends_on_order_and_params() {
        let mut reordered = steps();
        reordered.reverse();
        assert_ne!(prompt_hash(&steps()), prompt_hash(&reordered));

        let mut changed = steps();
        changed[0] = Step::new("s1", "onboard").with_param("source", "b.png");
        assert_ne!(prompt_hash(&steps()), prompt_hash(&changed));
    }

    #[test]
    fn test_hash_ignores_recorded_results() {
        let mut with_result = steps();
        with_result[0].result = Some(serde_json::json!({"artifact": "x"}));
        assert_eq!(prompt_hash(&steps()), prompt_hash(&with_result));
    }

    #[test]
    fn test_unlocked_plan_is_rejected() {
        let plan = Plan::new(steps());
        let err = verify_lock(&plan).unwrap_err();
        assert_eq!(err.code, GuardrailCode::NonDeterministicRun);
    }

    #[test]
    fn test_locked_plan_verifies_until_modified() {
        let mut plan = Plan::new(steps());
        lock_plan(&mut plan, derive_seed("run-1"), "planner-v1");
        assert!(verify_lock(&plan).is_ok());

        plan.steps.pop();
        assert_eq!(
            verify_lock(&plan).unwrap_err().code,
            GuardrailCode::NonDeterministicRun
        );
    }

    #[test]
    fn test_seed_is_stable() {
        assert_eq!(derive_seed("run-1"), derive_seed("run-1"));
        assert_ne!(derive_seed("run-1"), derive_seed("run-2"));
    }
}
