//! Error taxonomy for Atelier runs
//!
//! Four families matter to the orchestrator:
//! - [`GuardrailError`]: a policy violation. Never retried.
//! - [`ToolError::Transient`]: a backend hiccup. Retried with backoff.
//! - [`ToolError::Validation`]: malformed parameters. Fails the step at once.
//! - [`ToolError::Fatal`]: unrecoverable. Fails the run at once.
//!
//! [`ErrorKind`] is the coarse classification the retry layer keys on.

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ── Classification ───────────────────────────────────────────────────

/// Coarse error class used to decide retry and failure policy
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transient,
    Timeout,
    Validation,
    Fatal,
    Guardrail,
    CircuitOpen,
    Dependency,
    Cancelled,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Validation => "validation",
            ErrorKind::Fatal => "fatal",
            ErrorKind::Guardrail => "guardrail",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::Dependency => "dependency",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// Errors that can report their [`ErrorKind`]
pub trait Classify {
    fn kind(&self) -> ErrorKind;
}

// ── Guardrails ───────────────────────────────────────────────────────

/// Machine-readable guardrail codes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GuardrailCode {
    CostLimitExceeded,
    OpNotAllowed,
    TooManySteps,
    BatchLimitExceeded,
    MissingParameter,
    InvalidParameter,
    UnknownDependency,
    NonDeterministicRun,
    EmptyPlan,
    /// Advisory: stated estimate disagrees with the per-step recomputation
    CostEstimateDrift,
    /// Advisory: plan is within policy but needs a human decision
    ApprovalRequired,
}

impl GuardrailCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            GuardrailCode::CostLimitExceeded => "COST_LIMIT_EXCEEDED",
            GuardrailCode::OpNotAllowed => "OP_NOT_ALLOWED",
            GuardrailCode::TooManySteps => "TOO_MANY_STEPS",
            GuardrailCode::BatchLimitExceeded => "BATCH_LIMIT_EXCEEDED",
            GuardrailCode::MissingParameter => "MISSING_PARAMETER",
            GuardrailCode::InvalidParameter => "INVALID_PARAMETER",
            GuardrailCode::UnknownDependency => "UNKNOWN_DEPENDENCY",
            GuardrailCode::NonDeterministicRun => "NON_DETERMINISTIC_RUN",
            GuardrailCode::EmptyPlan => "EMPTY_PLAN",
            GuardrailCode::CostEstimateDrift => "COST_ESTIMATE_DRIFT",
            GuardrailCode::ApprovalRequired => "APPROVAL_REQUIRED",
        }
    }
}

impl std::fmt::Display for GuardrailCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A guardrail rejection. Raised, never swallowed.
#[derive(Clone, Debug, PartialEq, Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct GuardrailError {
    pub code: GuardrailCode,
    pub message: String,
}

impl GuardrailError {
    pub fn new(code: GuardrailCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl Classify for GuardrailError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Guardrail
    }
}

// ── Tool backend ─────────────────────────────────────────────────────

/// Failure reported by a tool-execution backend
#[derive(Clone, Debug, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum ToolError {
    #[error("transient tool failure: {0}")]
    Transient(String),

    #[error("invalid tool parameters: {0}")]
    Validation(String),

    #[error("fatal tool failure: {0}")]
    Fatal(String),
}

impl Classify for ToolError {
    fn kind(&self) -> ErrorKind {
        match self {
            ToolError::Transient(_) => ErrorKind::Transient,
            ToolError::Validation(_) => ErrorKind::Validation,
            ToolError::Fatal(_) => ErrorKind::Fatal,
        }
    }
}

// ── Workflow ─────────────────────────────────────────────────────────

/// Errors raised while driving a run
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("guardrail violation: {0}")]
    Guardrail(#[from] GuardrailError),

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error("step '{step_id}' failed: {message}")]
    StepFailed { step_id: String, message: String },

    #[error("no routing rule for state {0}")]
    NoRoute(crate::WorkflowState),

    #[error("run has no plan")]
    MissingPlan,

    #[error("no agent registered for role {0}")]
    AgentUnavailable(crate::AgentRole),

    #[error("plan override rejected: {0}")]
    OverrideRejected(GuardrailError),

    #[error("plan override already applied")]
    OverrideAlreadyApplied,

    #[error("run not found: {0}")]
    RunNotFound(crate::RunId),

    #[error("run is in terminal state {0}")]
    Terminal(crate::WorkflowState),

    #[error("run store error: {0}")]
    Store(String),

    #[error("planning backend failed: {0}")]
    Planning(String),

    #[error("unsupported intent: {0}")]
    UnsupportedIntent(String),

    #[error("cannot {action} a run in state {state}")]
    InvalidState {
        state: crate::WorkflowState,
        action: &'static str,
    },

    #[error("internal error: {0}")]
    Internal(String),
}

impl Classify for WorkflowError {
    fn kind(&self) -> ErrorKind {
        match self {
            WorkflowError::Guardrail(_) | WorkflowError::OverrideRejected(_) => {
                ErrorKind::Guardrail
            }
            WorkflowError::Tool(e) => e.kind(),
            WorkflowError::StepFailed { .. } => ErrorKind::Fatal,
            WorkflowError::Planning(_) => ErrorKind::Transient,
            WorkflowError::UnsupportedIntent(_) => ErrorKind::Validation,
            _ => ErrorKind::Internal,
        }
    }
}

/// Result type for workflow operations
pub type WorkflowResult<T> = Result<T, WorkflowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guardrail_error_display_carries_code() {
        let err = GuardrailError::new(GuardrailCode::OpNotAllowed, "op 'rm' not allowed");
        assert_eq!(err.to_string(), "OP_NOT_ALLOWED: op 'rm' not allowed");
    }

    #[test]
    fn test_tool_error_kinds() {
        assert_eq!(ToolError::Transient("x".into()).kind(), ErrorKind::Transient);
        assert_eq!(ToolError::Validation("x".into()).kind(), ErrorKind::Validation);
        assert_eq!(ToolError::Fatal("x".into()).kind(), ErrorKind::Fatal);
    }

    #[test]
    fn test_workflow_error_from_guardrail() {
        let err: WorkflowError =
            GuardrailError::new(GuardrailCode::NonDeterministicRun, "unlocked").into();
        assert_eq!(err.kind(), ErrorKind::Guardrail);
        assert!(err.to_string().contains("NON_DETERMINISTIC_RUN"));
    }

    #[test]
    fn test_guardrail_code_serde() {
        let json = serde_json::to_string(&GuardrailCode::CostLimitExceeded).unwrap();
        assert_eq!(json, "\"COST_LIMIT_EXCEEDED\"");
    }
}
