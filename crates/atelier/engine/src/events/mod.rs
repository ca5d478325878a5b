//! Event broadcasting
//!
//! Publication is synchronous and never fails the caller: a bounded
//! history is kept for replay and the event is handed to the configured
//! [`EventChannel`]. Channel errors are logged and counted.

mod channel;
mod subscription;

pub use channel::{EventChannel, LocalChannel, NullChannel};
pub use subscription::{LiveSubscription, PollingSubscription, Subscription};

use crate::backends::EventSink;
use crate::error::EventError;
use crate::store::RunStore;
use atelier_types::{EventType, RunId, WorkflowEvent};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct Inner {
    history: VecDeque<WorkflowEvent>,
    published: u64,
    failed: u64,
    by_type: BTreeMap<String, u64>,
}

/// Fan-out of workflow events to subscribers and sinks
pub struct EventBroadcaster {
    channel: Arc<dyn EventChannel>,
    history_size: usize,
    inner: Mutex<Inner>,
}

impl EventBroadcaster {
    pub fn new(channel: Arc<dyn EventChannel>, history_size: usize) -> Self {
        Self {
            channel,
            history_size,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Broadcaster over an in-process channel
    pub fn local(history_size: usize) -> Self {
        Self::new(Arc::new(LocalChannel::new(history_size)), history_size)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Publish an event
    pub fn publish(&self, event: WorkflowEvent) {
        let mut inner = self.lock();
        inner.published += 1;
        *inner.by_type.entry(event.event_type.to_string()).or_insert(0) += 1;
        if self.history_size > 0 {
            while inner.history.len() >= self.history_size {
                inner.history.pop_front();
            }
            inner.history.push_back(event.clone());
        }

        debug!(run_id = %event.run_id, event = %event.event_type, "Publishing event");
        // Sent under the history lock so that subscribe() sees each event
        // either in the replay or live, never both
        if let Err(e) = self.channel.publish(event) {
            inner.failed += 1;
            drop(inner);
            warn!(channel = self.channel.name(), "Event publication failed: {}", e);
        }
    }

    /// Create a new event and publish it
    pub fn emit(&self, event_type: EventType, run_id: &RunId, payload: Value) {
        self.publish(WorkflowEvent::new(event_type, run_id.clone(), payload));
    }

    /// Replayed history followed by live events. `None` subscribes to
    /// every run.
    pub fn subscribe(&self, run_id: Option<&RunId>) -> Result<LiveSubscription, EventError> {
        let inner = self.lock();
        let receiver = self.channel.subscribe()?;
        let backlog = inner
            .history
            .iter()
            .filter(|e| run_id.map_or(true, |id| &e.run_id == id))
            .cloned()
            .collect();
        Ok(LiveSubscription::new(run_id.cloned(), backlog, receiver))
    }

    /// Live subscription, or a store poller when the channel is unavailable
    pub fn subscribe_or_poll(
        &self,
        run_id: &RunId,
        store: Arc<dyn RunStore>,
        interval: Duration,
    ) -> Subscription {
        match self.subscribe(Some(run_id)) {
            Ok(live) => Subscription::Live(live),
            Err(e) => {
                warn!(run_id = %run_id, "Live events unavailable, polling instead: {}", e);
                Subscription::Polling(PollingSubscription::new(run_id.clone(), store, interval))
            }
        }
    }

    /// Forward every event to `sink` from a background task. Delivery
    /// failures are logged and the forwarding continues.
    pub fn attach_sink(&self, sink: Arc<dyn EventSink>) -> Result<JoinHandle<()>, EventError> {
        let mut subscription = self.subscribe(None)?;
        Ok(tokio::spawn(async move {
            while let Some(event) = subscription.next().await {
                if let Err(e) = sink.deliver(&event).await {
                    warn!(
                        run_id = %event.run_id,
                        event = %event.event_type,
                        "Event sink delivery failed: {}",
                        e
                    );
                }
            }
        }))
    }

    /// Retained events, oldest first
    pub fn history(&self, run_id: Option<&RunId>) -> Vec<WorkflowEvent> {
        self.lock()
            .history
            .iter()
            .filter(|e| run_id.map_or(true, |id| &e.run_id == id))
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> EventBroadcasterStats {
        let inner = self.lock();
        EventBroadcasterStats {
            published: inner.published,
            failed: inner.failed,
            retained: inner.history.len(),
            events_by_type: inner.by_type.clone(),
        }
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::local(1000)
    }
}

/// Event broadcaster statistics
#[derive(Clone, Debug)]
pub struct EventBroadcasterStats {
    pub published: u64,
    /// Events the channel refused
    pub failed: u64,
    pub retained: usize,
    pub events_by_type: BTreeMap<String, u64>,
}
