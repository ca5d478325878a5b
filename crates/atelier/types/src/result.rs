//! Executor output

use crate::error::ErrorKind;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Output of one successful step
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepOutput {
    pub step_id: String,
    pub op: String,
    pub output: Value,
    pub attempts: u32,
    pub duration_ms: u64,
}

/// A step that did not succeed
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepFailure {
    pub step_id: String,
    pub op: String,
    pub kind: ErrorKind,
    pub message: String,
    pub critical: bool,
}

/// Aggregated result of executing a plan
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub success: bool,
    pub outputs: Vec<StepOutput>,
    /// Failures that did not halt the run, plus the halting one if any
    pub errors: Vec<StepFailure>,
    pub logs: Vec<String>,
    pub duration_ms: u64,
    pub total_cost_usd: f64,
}

impl RunResult {
    pub fn output_for(&self, step_id: &str) -> Option<&StepOutput> {
        self.outputs.iter().find(|o| o.step_id == step_id)
    }

    /// The failure that halted execution, if any
    pub fn halting_failure(&self) -> Option<&StepFailure> {
        self.errors
            .iter()
            .find(|e| e.critical || e.kind == ErrorKind::Fatal)
    }

    pub fn log(&mut self, line: impl Into<String>) {
        self.logs.push(line.into());
    }
}
