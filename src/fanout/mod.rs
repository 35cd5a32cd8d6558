//! Per-run notification fanout.
//!
//! Observers subscribe by run id and receive every event published for that
//! run, in publish order. A subscriber whose channel is closed or full is
//! treated as disconnected and pruned silently; delivery problems are never
//! surfaced to the publishing run.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

use crate::settings::FanoutSettings;

/// Event categories on the notification surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunEventKind {
    /// Per-job progress snapshot.
    JobUpdate,
    /// Run-level announcement (terminal completion).
    Broadcast,
}

/// One notification delivered to run observers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    #[serde(rename = "type")]
    pub kind: RunEventKind,
    pub run_id: Uuid,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl RunEvent {
    pub fn job_update(run_id: Uuid, data: serde_json::Value) -> Self {
        Self {
            kind: RunEventKind::JobUpdate,
            run_id,
            data,
            timestamp: Utc::now(),
        }
    }

    pub fn broadcast(run_id: Uuid, data: serde_json::Value) -> Self {
        Self {
            kind: RunEventKind::Broadcast,
            run_id,
            data,
            timestamp: Utc::now(),
        }
    }
}

struct Subscriber {
    id: Uuid,
    tx: mpsc::Sender<RunEvent>,
}

/// Fans run events out to per-run subscriber sets.
pub struct EventFanout {
    subscribers: RwLock<HashMap<Uuid, Vec<Subscriber>>>,
    settings: FanoutSettings,
}

impl EventFanout {
    pub fn new(settings: FanoutSettings) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            settings,
        }
    }

    /// Subscribe to a run's events. Returns the subscriber id (for
    /// `unsubscribe`) and the receiving end of the event stream.
    pub async fn subscribe(&self, run_id: Uuid) -> (Uuid, mpsc::Receiver<RunEvent>) {
        let (tx, rx) = mpsc::channel(self.settings.subscriber_buffer);
        let id = Uuid::new_v4();
        self.subscribers
            .write()
            .await
            .entry(run_id)
            .or_default()
            .push(Subscriber { id, tx });
        (id, rx)
    }

    /// Subscribe and wrap the receiver as a `Stream`, for transports that
    /// consume streams (SSE, WebSocket).
    pub async fn subscribe_stream(
        &self,
        run_id: Uuid,
    ) -> (Uuid, tokio_stream::wrappers::ReceiverStream<RunEvent>) {
        let (id, rx) = self.subscribe(run_id).await;
        (id, tokio_stream::wrappers::ReceiverStream::new(rx))
    }

    /// Drop one subscriber from a run.
    pub async fn unsubscribe(&self, run_id: Uuid, subscriber_id: Uuid) {
        let mut subscribers = self.subscribers.write().await;
        if let Some(set) = subscribers.get_mut(&run_id) {
            set.retain(|s| s.id != subscriber_id);
            if set.is_empty() {
                subscribers.remove(&run_id);
            }
        }
    }

    /// Deliver an event to every live subscriber of the run.
    ///
    /// Publishes are serialized per run, so each subscriber observes events
    /// in publish order. A full buffer counts as a disconnect, same as a
    /// dropped receiver.
    pub async fn publish(&self, run_id: Uuid, event: RunEvent) {
        let mut subscribers = self.subscribers.write().await;
        let Some(set) = subscribers.get_mut(&run_id) else {
            return;
        };

        set.retain(|subscriber| match subscriber.tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(_) => {
                tracing::debug!(
                    "Pruning subscriber {} of run {} (disconnected or lagging)",
                    subscriber.id,
                    run_id
                );
                false
            }
        });

        if set.is_empty() {
            subscribers.remove(&run_id);
        }
    }

    /// Number of live subscribers for a run.
    pub async fn subscriber_count(&self, run_id: Uuid) -> usize {
        self.subscribers
            .read()
            .await
            .get(&run_id)
            .map(|s| s.len())
            .unwrap_or(0)
    }

    /// Schedule removal of a terminal run's subscription set after the
    /// configured grace period, leaving time for final-event delivery.
    pub fn schedule_prune(self: Arc<Self>, run_id: Uuid) {
        let grace = self.settings.terminal_grace();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            self.subscribers.write().await.remove(&run_id);
        });
    }
}
