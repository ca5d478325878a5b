//! Critic output: approval flag, issues and suggestions

use crate::error::{GuardrailCode, GuardrailError};
use serde::{Deserialize, Serialize};

/// How strongly an issue gates execution
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Execution must not proceed without a human decision
    Blocking,
    /// Recorded for the reviewer, does not gate anything
    Advisory,
}

/// A single finding from the guardrail engine
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GuardrailIssue {
    pub code: GuardrailCode,
    pub message: String,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
}

impl GuardrailIssue {
    pub fn blocking(code: GuardrailCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            severity: Severity::Blocking,
            step_id: None,
        }
    }

    pub fn advisory(code: GuardrailCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            severity: Severity::Advisory,
            step_id: None,
        }
    }

    pub fn for_step(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = Some(step_id.into());
        self
    }

    pub fn is_blocking(&self) -> bool {
        self.severity == Severity::Blocking
    }

    /// Raise this issue as a [`GuardrailError`]
    pub fn to_error(&self) -> GuardrailError {
        let message = match &self.step_id {
            Some(step) => format!("{} (step {})", self.message, step),
            None => self.message.clone(),
        };
        GuardrailError::new(self.code, message)
    }
}

impl std::fmt::Display for GuardrailIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.step_id {
            Some(step) => write!(f, "[{}] {} (step {})", self.code, self.message, step),
            None => write!(f, "[{}] {}", self.code, self.message),
        }
    }
}

/// The critic's structured review of a plan
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Critique {
    pub ok: bool,
    #[serde(default)]
    pub issues: Vec<GuardrailIssue>,
    #[serde(default)]
    pub suggestions: Vec<String>,
    pub estimated_cost_usd: f64,
    /// Set when the review decided a human must approve
    #[serde(default)]
    pub requires_hitl: bool,
}

impl Critique {
    /// Build a critique from a set of issues; `ok` iff nothing blocks
    pub fn from_issues(issues: Vec<GuardrailIssue>, estimated_cost_usd: f64) -> Self {
        let ok = !issues.iter().any(GuardrailIssue::is_blocking);
        Self {
            ok,
            issues,
            suggestions: Vec::new(),
            estimated_cost_usd,
            requires_hitl: false,
        }
    }

    /// The critique recorded when the critic itself could not run
    pub fn default_ok(estimated_cost_usd: f64, note: impl Into<String>) -> Self {
        Self {
            ok: true,
            issues: Vec::new(),
            suggestions: vec![note.into()],
            estimated_cost_usd,
            requires_hitl: false,
        }
    }

    pub fn blocking_issues(&self) -> impl Iterator<Item = &GuardrailIssue> {
        self.issues.iter().filter(|i| i.is_blocking())
    }

    pub fn has_blocking(&self) -> bool {
        self.blocking_issues().next().is_some()
    }

    /// Whether the run must pause for a human before executing
    pub fn needs_human(&self) -> bool {
        self.requires_hitl || !self.ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advisory_issues_keep_critique_ok() {
        let critique = Critique::from_issues(
            vec![GuardrailIssue::advisory(
                GuardrailCode::CostEstimateDrift,
                "estimate differs",
            )],
            0.1,
        );
        assert!(critique.ok);
        assert!(!critique.has_blocking());
        assert!(!critique.needs_human());
    }

    #[test]
    fn test_blocking_issue_fails_critique() {
        let critique = Critique::from_issues(
            vec![GuardrailIssue::blocking(GuardrailCode::OpNotAllowed, "no").for_step("s1")],
            0.1,
        );
        assert!(!critique.ok);
        assert!(critique.needs_human());
        assert_eq!(
            critique.issues[0].to_string(),
            "[OP_NOT_ALLOWED] no (step s1)"
        );
    }
}
