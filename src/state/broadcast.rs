//! Fan-out of state-change events to SSE subscribers.
//!
//! Delivery is intentionally lossy per subscriber: a full buffer drops the
//! event for that subscriber only, so a slow consumer can never stall the
//! control loop. Consumers that need guaranteed state re-fetch the full
//! snapshot.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::Serialize;
use tokio::sync::mpsc;

use super::{RefreshSummary, StackRecord};

/// Event buffer size per subscriber.
pub const SUBSCRIBER_BUFFER: usize = 64;

/// The kind of frame sent over the SSE stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SseEventType {
    StackSnapshot,
    StackUpsert,
    StackDelete,
    RefreshStatus,
}

impl SseEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SseEventType::StackSnapshot => "stack.snapshot",
            SseEventType::StackUpsert => "stack.upsert",
            SseEventType::StackDelete => "stack.delete",
            SseEventType::RefreshStatus => "refresh.status",
        }
    }
}

/// A single event frame: monotonically increasing id, type, JSON payload.
#[derive(Debug, Clone)]
pub struct SseEvent {
    pub id: i64,
    pub event: SseEventType,
    pub data: String,
}

/// One connected consumer. Dropping the subscription unregisters it.
pub struct Subscription {
    id: u64,
    pub events: mpsc::Receiver<SseEvent>,
    broadcaster: Arc<Broadcaster>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.broadcaster.unsubscribe(self.id);
    }
}

/// Fans out events to all subscribers with bounded, non-blocking sends.
#[derive(Default)]
pub struct Broadcaster {
    subscribers: RwLock<HashMap<u64, mpsc::Sender<SseEvent>>>,
    next_subscriber_id: AtomicU64,
    next_event_id: AtomicI64,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new subscriber with a bounded event buffer.
    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .write()
            .expect("poisoned subscriber lock")
            .insert(id, tx);
        Subscription {
            id,
            events: rx,
            broadcaster: Arc::clone(self),
        }
    }

    fn unsubscribe(&self, id: u64) {
        self.subscribers
            .write()
            .expect("poisoned subscriber lock")
            .remove(&id);
    }

    /// Serializes the payload once and tries to deliver it to every
    /// subscriber. A subscriber whose buffer is full loses this event.
    pub fn publish<T: Serialize>(&self, event_type: SseEventType, payload: &T) {
        let data = match serde_json::to_string(payload) {
            Ok(data) => data,
            Err(e) => {
                log::error!("failed to serialize {} event: {e}", event_type.as_str());
                return;
            }
        };

        let id = self.next_event_id.fetch_add(1, Ordering::Relaxed) + 1;
        let event = SseEvent {
            id,
            event: event_type,
            data,
        };

        let subscribers = self.subscribers.read().expect("poisoned subscriber lock");
        for (sub_id, tx) in subscribers.iter() {
            if tx.try_send(event.clone()).is_err() {
                log::debug!("subscriber {sub_id} buffer full, dropping event {id}");
            }
        }
    }

    /// Sends the full stack list, the first frame every new consumer sees.
    pub fn publish_stack_snapshot(&self, stacks: &[StackRecord]) {
        #[derive(Serialize)]
        struct SnapshotPayload<'a> {
            records: &'a [StackRecord],
        }
        self.publish(SseEventType::StackSnapshot, &SnapshotPayload { records: stacks });
    }

    /// Sends a single full stack record update.
    pub fn publish_stack_upsert(&self, stack: &StackRecord) {
        #[derive(Serialize)]
        struct UpsertPayload<'a> {
            record: &'a StackRecord,
        }
        self.publish(SseEventType::StackUpsert, &UpsertPayload { record: stack });
    }

    /// Announces that a stack was removed from the runtime.
    pub fn publish_stack_delete(&self, path: &str) {
        #[derive(Serialize)]
        struct DeletePayload<'a> {
            path: &'a str,
        }
        self.publish(SseEventType::StackDelete, &DeletePayload { path });
    }

    /// Sends a refresh status update.
    pub fn publish_refresh_status(&self, summary: &RefreshSummary) {
        self.publish(SseEventType::RefreshStatus, summary);
    }

    /// Drops every subscriber channel so open event streams terminate.
    /// Called on shutdown; subscribers see their stream end.
    pub fn close_all(&self) {
        self.subscribers
            .write()
            .expect("poisoned subscriber lock")
            .clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .expect("poisoned subscriber lock")
            .len()
    }
}
