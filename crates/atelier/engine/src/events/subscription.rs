//! Subscriber side of the event stream

use crate::store::RunStore;
use atelier_types::{EventType, RunId, WorkflowEvent, WorkflowState};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::warn;

/// Either a live stream or, when the channel is down, a poller over the
/// run store
pub enum Subscription {
    Live(LiveSubscription),
    Polling(PollingSubscription),
}

impl Subscription {
    /// Next event, or `None` once the stream has ended
    pub async fn next(&mut self) -> Option<WorkflowEvent> {
        match self {
            Subscription::Live(live) => live.next().await,
            Subscription::Polling(polling) => polling.next().await,
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, Subscription::Live(_))
    }
}

// ── Live ─────────────────────────────────────────────────────────────

/// Replayed history followed by live events
pub struct LiveSubscription {
    run_id: Option<RunId>,
    backlog: VecDeque<WorkflowEvent>,
    receiver: broadcast::Receiver<WorkflowEvent>,
}

impl LiveSubscription {
    pub(crate) fn new(
        run_id: Option<RunId>,
        backlog: VecDeque<WorkflowEvent>,
        receiver: broadcast::Receiver<WorkflowEvent>,
    ) -> Self {
        Self {
            run_id,
            backlog,
            receiver,
        }
    }

    fn accepts(&self, event: &WorkflowEvent) -> bool {
        self.run_id.as_ref().map_or(true, |id| &event.run_id == id)
    }

    pub async fn next(&mut self) -> Option<WorkflowEvent> {
        if let Some(event) = self.backlog.pop_front() {
            return Some(event);
        }
        loop {
            match self.receiver.recv().await {
                Ok(event) if self.accepts(&event) => return Some(event),
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event subscriber lagged, events dropped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Everything available right now, without waiting
    pub fn drain(&mut self) -> Vec<WorkflowEvent> {
        let mut events: Vec<WorkflowEvent> = self.backlog.drain(..).collect();
        loop {
            match self.receiver.try_recv() {
                Ok(event) => {
                    if self.accepts(&event) {
                        events.push(event);
                    }
                }
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event subscriber lagged, events dropped");
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
        events
    }
}

// ── Polling fallback ─────────────────────────────────────────────────

/// Synthesises `state_changed` events from successive store snapshots.
/// Ends after reporting a terminal state or when the run disappears.
pub struct PollingSubscription {
    run_id: RunId,
    store: Arc<dyn RunStore>,
    interval: Duration,
    last_state: Option<WorkflowState>,
    finished: bool,
}

impl PollingSubscription {
    pub fn new(run_id: RunId, store: Arc<dyn RunStore>, interval: Duration) -> Self {
        Self {
            run_id,
            store,
            interval,
            last_state: None,
            finished: false,
        }
    }

    pub async fn next(&mut self) -> Option<WorkflowEvent> {
        loop {
            if self.finished {
                return None;
            }
            match self.store.get(&self.run_id).await {
                Ok(Some(ctx)) => {
                    if ctx.is_terminal() {
                        self.finished = true;
                    }
                    if self.last_state != Some(ctx.state) {
                        let from = self.last_state.replace(ctx.state);
                        return Some(WorkflowEvent::new(
                            EventType::StateChanged,
                            self.run_id.clone(),
                            json!({
                                "from": from,
                                "to": ctx.state,
                                "snapshot": ctx.snapshot(),
                            }),
                        ));
                    }
                    if self.finished {
                        return None;
                    }
                }
                Ok(None) => {
                    self.finished = true;
                    return None;
                }
                Err(e) => {
                    warn!(run_id = %self.run_id, "Polling run store failed: {}", e);
                }
            }
            tokio::time::sleep(self.interval).await;
        }
    }
}
