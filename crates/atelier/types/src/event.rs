//! Events published to run observers

use crate::ids::RunId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    PlannerStart,
    Plan,
    CriticStart,
    Critique,
    /// Run paused at PROPOSED for a human decision
    Blocked,
    Approved,
    ExecutorStart,
    StepUpdate,
    Result,
    Error,
    StateChanged,
    WorkflowComplete,
    Stopped,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // serde names are the wire names
        match serde_json::to_value(self) {
            Ok(Value::String(s)) => f.write_str(&s),
            _ => write!(f, "{:?}", self),
        }
    }
}

/// `{type, run_id, timestamp, payload}`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub run_id: RunId,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub payload: Value,
}

impl WorkflowEvent {
    pub fn new(event_type: EventType, run_id: RunId, payload: Value) -> Self {
        Self {
            event_type,
            run_id,
            timestamp: Utc::now(),
            payload,
        }
    }
}
