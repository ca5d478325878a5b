//! In-process tool backend producing deterministic artifacts

use super::ToolExecutionBackend;
use async_trait::async_trait;
use atelier_types::{Params, ToolError};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

/// Pretends to run studio operations.
///
/// The artifact id is a blake3 hash of `(op, params)`, so the same step
/// always yields the same output. Failures can be scripted per operation.
#[derive(Debug, Default)]
pub struct SimulatedToolBackend {
    latency: Duration,
    scripted: Mutex<HashMap<String, VecDeque<ToolError>>>,
    calls: Mutex<HashMap<String, u32>>,
}

impl SimulatedToolBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long in every call
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Make the next call to `op` fail with `error`. Calls queue up.
    pub fn fail_next(&self, op: &str, error: ToolError) {
        let mut scripted = self.scripted.lock().unwrap_or_else(|e| e.into_inner());
        scripted.entry(op.to_string()).or_default().push_back(error);
    }

    /// How many times `op` has been called
    pub fn calls(&self, op: &str) -> u32 {
        let calls = self.calls.lock().unwrap_or_else(|e| e.into_inner());
        calls.get(op).copied().unwrap_or(0)
    }

    fn next_failure(&self, op: &str) -> Option<ToolError> {
        let mut scripted = self.scripted.lock().unwrap_or_else(|e| e.into_inner());
        scripted.get_mut(op).and_then(VecDeque::pop_front)
    }
}

#[async_trait]
impl ToolExecutionBackend for SimulatedToolBackend {
    async fn execute(&self, op: &str, params: &Params) -> Result<Value, ToolError> {
        {
            let mut calls = self.calls.lock().unwrap_or_else(|e| e.into_inner());
            *calls.entry(op.to_string()).or_insert(0) += 1;
        }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if let Some(error) = self.next_failure(op) {
            return Err(error);
        }

        let encoded = serde_json::to_vec(&(op, params))
            .map_err(|e| ToolError::Validation(e.to_string()))?;
        let digest = blake3::hash(&encoded).to_hex();
        Ok(json!({
            "op": op,
            "artifact": format!("{}-{}", op, &digest.as_str()[..12]),
            "params": params,
        }))
    }

    fn name(&self) -> &str {
        "simulated"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> Params {
        let mut params = Params::new();
        params.insert("source".into(), Value::from("shoe.png"));
        params
    }

    #[tokio::test]
    async fn test_artifacts_are_deterministic() {
        let backend = SimulatedToolBackend::new();
        let a = backend.execute("onboard", &params()).await.unwrap();
        let b = backend.execute("onboard", &params()).await.unwrap();
        assert_eq!(a, b);
        assert!(a["artifact"].as_str().unwrap().starts_with("onboard-"));
        assert_eq!(backend.calls("onboard"), 2);
    }

    #[tokio::test]
    async fn test_scripted_failures_are_consumed_in_order() {
        let backend = SimulatedToolBackend::new();
        backend.fail_next("onboard", ToolError::Transient("busy".into()));
        backend.fail_next("onboard", ToolError::Fatal("gone".into()));

        assert_eq!(
            backend.execute("onboard", &params()).await.unwrap_err(),
            ToolError::Transient("busy".into())
        );
        assert_eq!(
            backend.execute("onboard", &params()).await.unwrap_err(),
            ToolError::Fatal("gone".into())
        );
        assert!(backend.execute("onboard", &params()).await.is_ok());
    }
}
