//! Transports behind the broadcaster

use crate::error::EventError;
use atelier_types::WorkflowEvent;
use tokio::sync::broadcast;

/// A pub/sub transport for workflow events
pub trait EventChannel: Send + Sync {
    /// Fire and forget. Having no subscribers is not an error.
    fn publish(&self, event: WorkflowEvent) -> Result<(), EventError>;

    fn subscribe(&self) -> Result<broadcast::Receiver<WorkflowEvent>, EventError>;

    fn name(&self) -> &str;
}

/// In-process channel over `tokio::sync::broadcast`
#[derive(Debug)]
pub struct LocalChannel {
    sender: broadcast::Sender<WorkflowEvent>,
}

impl LocalChannel {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for LocalChannel {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl EventChannel for LocalChannel {
    fn publish(&self, event: WorkflowEvent) -> Result<(), EventError> {
        // Ignore errors if no receivers
        let _ = self.sender.send(event);
        Ok(())
    }

    fn subscribe(&self) -> Result<broadcast::Receiver<WorkflowEvent>, EventError> {
        Ok(self.sender.subscribe())
    }

    fn name(&self) -> &str {
        "local"
    }
}

/// A channel with no live transport. Publishing succeeds and subscribing
/// fails, which sends subscribers to the polling fallback.
#[derive(Debug, Default)]
pub struct NullChannel;

impl EventChannel for NullChannel {
    fn publish(&self, _event: WorkflowEvent) -> Result<(), EventError> {
        Ok(())
    }

    fn subscribe(&self) -> Result<broadcast::Receiver<WorkflowEvent>, EventError> {
        Err(EventError::ChannelUnavailable("no live transport".into()))
    }

    fn name(&self) -> &str {
        "null"
    }
}
