use std::sync::Mutex as StdMutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};

/// What triggered a refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerSource {
    Startup,
    Webhook,
    Manual,
    Periodic,
}

impl TriggerSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerSource::Startup => "startup",
            TriggerSource::Webhook => "webhook",
            TriggerSource::Manual => "manual",
            TriggerSource::Periodic => "periodic",
        }
    }
}

impl std::fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A refresh request.
#[derive(Debug, Clone, Copy)]
pub struct Trigger {
    pub source: TriggerSource,
    pub requested_at: DateTime<Utc>,
}

impl Trigger {
    pub fn now(source: TriggerSource) -> Self {
        Self {
            source,
            requested_at: Utc::now(),
        }
    }
}

/// What happened to an enqueued trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueResult {
    Refreshing,
    Queued,
}

impl QueueResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueResult::Refreshing => "refreshing",
            QueueResult::Queued => "queued",
        }
    }
}

#[derive(Default)]
struct QueueState {
    running: bool,
    pending: Option<Trigger>,
}

/// Single-slot coalescing queue over refresh triggers.
///
/// At most one refresh is in flight and at most one trigger is pending; a
/// burst of enqueues while a refresh runs collapses into the newest request,
/// which strictly subsumes the ones it replaces.
pub struct TriggerQueue {
    state: StdMutex<QueueState>,
    tx: mpsc::Sender<Trigger>,
    rx: Mutex<mpsc::Receiver<Trigger>>,
}

impl Default for TriggerQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TriggerQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self {
            state: StdMutex::new(QueueState::default()),
            tx,
            rx: Mutex::new(rx),
        }
    }

    /// Adds a refresh trigger without ever blocking on refresh progress.
    ///
    /// If no refresh is running the trigger is delivered immediately;
    /// otherwise it replaces whatever was pending.
    pub fn enqueue(&self, trigger: Trigger) -> QueueResult {
        let mut state = self.state.lock().expect("poisoned queue lock");

        if !state.running {
            state.running = true;
            // The delivery slot is free whenever running was false.
            let _ = self.tx.try_send(trigger);
            return QueueResult::Refreshing;
        }

        state.pending = Some(trigger);
        QueueResult::Queued
    }

    /// Blocks the single consumer until a trigger is available.
    pub async fn next_trigger(&self) -> Trigger {
        self.rx
            .lock()
            .await
            .recv()
            .await
            .expect("trigger channel closed while queue alive")
    }

    /// Marks the current refresh complete, promoting any pending trigger.
    /// Returns whether a pending trigger was promoted.
    pub fn done(&self) -> bool {
        let mut state = self.state.lock().expect("poisoned queue lock");

        if let Some(trigger) = state.pending.take() {
            state.running = true;
            let _ = self.tx.try_send(trigger);
            return true;
        }

        state.running = false;
        false
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().expect("poisoned queue lock").running
    }
}
