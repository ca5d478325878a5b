//! The per-run context: the single mutable record of a run
//!
//! A [`WorkflowContext`] is created once per submission and mutated only by
//! the orchestrator and the agents it invokes. Once it reaches a terminal
//! state it is no longer changed.

use crate::{Critique, Plan, RunId, RunResult, WorkflowState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One recorded state change
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: WorkflowState,
    pub to: WorkflowState,
    pub at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkflowContext {
    pub run_id: RunId,
    pub state: WorkflowState,
    /// What the caller asked for: `intent`, `constraints`, `source`, ...
    pub input_data: Value,
    pub plan: Option<Plan>,
    pub critique: Option<Critique>,
    pub result: Option<RunResult>,
    /// Human-readable reason for FAILED
    pub error: Option<String>,
    /// Set for the duration of one transition
    pub locked: bool,
    /// Whether a human override has replaced the planner's plan
    #[serde(default)]
    pub plan_overridden: bool,
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
    #[serde(default)]
    pub transitions: Vec<TransitionRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowContext {
    pub fn new(input_data: Value) -> Self {
        Self::with_id(RunId::generate(), input_data)
    }

    pub fn with_id(run_id: RunId, input_data: Value) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            state: WorkflowState::Created,
            input_data,
            plan: None,
            critique: None,
            result: None,
            error: None,
            locked: false,
            plan_overridden: false,
            metadata: serde_json::Map::new(),
            transitions: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Move to `to`, recording the transition. Orchestrator use only.
    pub fn set_state(&mut self, to: WorkflowState) {
        if self.state == to {
            return;
        }
        let now = Utc::now();
        self.transitions.push(TransitionRecord {
            from: self.state,
            to,
            at: now,
        });
        self.state = to;
        self.updated_at = now;
    }

    /// Move to FAILED with a reason
    pub fn fail(&mut self, error: impl Into<String>) {
        self.error = Some(error.into());
        self.set_state(WorkflowState::Failed);
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Whether the plan or critique asks for a human decision before execution
    pub fn requires_human_approval(&self) -> bool {
        let plan_flag = self.plan.as_ref().map(|p| p.requires_hitl).unwrap_or(false);
        let critique_flag = self
            .critique
            .as_ref()
            .map(Critique::needs_human)
            .unwrap_or(false);
        plan_flag || critique_flag
    }

    pub fn intent(&self) -> Option<&str> {
        self.input_data.get("intent").and_then(Value::as_str)
    }

    /// `input_data.constraints`, or an empty object
    pub fn constraints(&self) -> serde_json::Map<String, Value> {
        self.input_data
            .get("constraints")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default()
    }

    /// The external read model of this run
    pub fn snapshot(&self) -> RunSnapshot {
        RunSnapshot {
            run_id: self.run_id.clone(),
            state: self.state,
            plan: self.plan.clone(),
            critique: self.critique.clone(),
            result: self.result.clone(),
            error: self.error.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            metadata: self.metadata.clone(),
        }
    }
}

/// `{run_id, state, plan, critique, result, error, created_at, updated_at, metadata}`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run_id: RunId,
    pub state: WorkflowState,
    pub plan: Option<Plan>,
    pub critique: Option<Critique>,
    pub result: Option<RunResult>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub metadata: serde_json::Map<String, Value>,
}

impl RunSnapshot {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn make_context() -> WorkflowContext {
        WorkflowContext::new(json!({
            "intent": "edit_product_shot",
            "constraints": {"generate_aovs": false}
        }))
    }

    #[test]
    fn test_new_context_is_created_and_unlocked() {
        let ctx = make_context();
        assert_eq!(ctx.state, WorkflowState::Created);
        assert!(!ctx.locked);
        assert!(ctx.transitions.is_empty());
        assert_eq!(ctx.intent(), Some("edit_product_shot"));
        assert_eq!(ctx.constraints().get("generate_aovs"), Some(&json!(false)));
    }

    #[test]
    fn test_set_state_records_transition() {
        let mut ctx = make_context();
        ctx.set_state(WorkflowState::Planning);
        ctx.set_state(WorkflowState::Planned);
        ctx.set_state(WorkflowState::Planned);

        assert_eq!(ctx.transitions.len(), 2);
        assert_eq!(ctx.transitions[1].from, WorkflowState::Planning);
        assert_eq!(ctx.transitions[1].to, WorkflowState::Planned);
    }

    #[test]
    fn test_fail_records_error() {
        let mut ctx = make_context();
        ctx.fail("boom");
        assert!(ctx.is_terminal());
        assert_eq!(ctx.error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_requires_human_approval() {
        let mut ctx = make_context();
        assert!(!ctx.requires_human_approval());

        ctx.plan = Some(Plan::default());
        ctx.critique = Some(Critique::default_ok(0.0, "n/a"));
        assert!(!ctx.requires_human_approval());

        if let Some(plan) = ctx.plan.as_mut() {
            plan.requires_hitl = true;
        }
        assert!(ctx.requires_human_approval());
    }

    #[test]
    fn test_snapshot_shape() {
        let ctx = make_context().with_metadata("tenant", "acme");
        let value = ctx.snapshot().to_value();
        for key in [
            "run_id",
            "state",
            "plan",
            "critique",
            "result",
            "error",
            "created_at",
            "updated_at",
            "metadata",
        ] {
            assert!(value.get(key).is_some(), "missing {key}");
        }
        assert_eq!(value["state"], "CREATED");
        assert_eq!(value["metadata"]["tenant"], "acme");
        assert!(value.get("locked").is_none());
    }
}
