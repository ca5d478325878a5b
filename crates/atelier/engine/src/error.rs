//! Engine-level errors

use atelier_resilience::CircuitBreakerOpen;
use atelier_types::{Classify, ErrorKind, ToolError};
use thiserror::Error;

/// Why a single parallel-executor task did not succeed
#[derive(Debug, Clone, Error)]
pub enum TaskError {
    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error("timed out after {0}ms")]
    Timeout(u64),

    #[error(transparent)]
    CircuitOpen(#[from] CircuitBreakerOpen),

    /// Dependencies can never be satisfied (cycle, missing or failed)
    #[error("unmet dependency: {0}")]
    Dependency(String),

    /// Not started because the schedule was halted
    #[error("not started: {0}")]
    Halted(String),

    /// Failure of some other backend, with its classification
    #[error("{message}")]
    Backend { kind: ErrorKind, message: String },
}

impl TaskError {
    pub fn backend(kind: ErrorKind, message: impl Into<String>) -> Self {
        TaskError::Backend {
            kind,
            message: message.into(),
        }
    }
}

impl Classify for TaskError {
    fn kind(&self) -> ErrorKind {
        match self {
            TaskError::Tool(e) => e.kind(),
            TaskError::Timeout(_) => ErrorKind::Timeout,
            TaskError::CircuitOpen(_) => ErrorKind::CircuitOpen,
            TaskError::Dependency(_) => ErrorKind::Dependency,
            TaskError::Halted(_) => ErrorKind::Cancelled,
            TaskError::Backend { kind, .. } => *kind,
        }
    }
}

/// Event publication and delivery failures. Logged, never propagated
/// into a run.
#[derive(Debug, Clone, Error)]
pub enum EventError {
    #[error("event channel unavailable: {0}")]
    ChannelUnavailable(String),

    #[error("event delivery failed: {0}")]
    Delivery(String),
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
