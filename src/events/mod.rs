//! In-process pub/sub for domain events.
//!
//! Handlers run synchronously on the publisher's thread and must not block;
//! the canonical handlers only forward records to the SSE broadcaster.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};

use crate::state::StackSyncStatus;

/// Identifies the kind of a domain event for subscription routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    StackStatusChanged,
    StackSynced,
    StackRemoved,
    ContainersUpdated,
    DriftDetected,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::StackStatusChanged => "stack.status.changed",
            EventType::StackSynced => "stack.synced",
            EventType::StackRemoved => "stack.removed",
            EventType::ContainersUpdated => "stack.containers.updated",
            EventType::DriftDetected => "stack.drift.detected",
        }
    }
}

/// A state change somewhere in the reconcile pipeline.
#[derive(Debug, Clone)]
pub enum DomainEvent {
    StackStatusChanged {
        path: String,
        status: StackSyncStatus,
        error: String,
        occurred_at: DateTime<Utc>,
    },
    StackSynced {
        path: String,
        revision: String,
        compose_hash: String,
        commit_message: String,
        occurred_at: DateTime<Utc>,
    },
    StackRemoved {
        path: String,
        reason: String,
        occurred_at: DateTime<Utc>,
    },
    ContainersUpdated {
        path: String,
        running: usize,
        total: usize,
        occurred_at: DateTime<Utc>,
    },
    DriftDetected {
        path: String,
        reason: String,
        need_sync: bool,
        occurred_at: DateTime<Utc>,
    },
}

impl DomainEvent {
    pub fn stack_status_changed(path: &str, status: StackSyncStatus, error: &str) -> Self {
        DomainEvent::StackStatusChanged {
            path: path.to_string(),
            status,
            error: error.to_string(),
            occurred_at: Utc::now(),
        }
    }

    pub fn stack_synced(path: &str, revision: &str, compose_hash: &str, commit_message: &str) -> Self {
        DomainEvent::StackSynced {
            path: path.to_string(),
            revision: revision.to_string(),
            compose_hash: compose_hash.to_string(),
            commit_message: commit_message.to_string(),
            occurred_at: Utc::now(),
        }
    }

    pub fn stack_removed(path: &str, reason: &str) -> Self {
        DomainEvent::StackRemoved {
            path: path.to_string(),
            reason: reason.to_string(),
            occurred_at: Utc::now(),
        }
    }

    pub fn containers_updated(path: &str, running: usize, total: usize) -> Self {
        DomainEvent::ContainersUpdated {
            path: path.to_string(),
            running,
            total,
            occurred_at: Utc::now(),
        }
    }

    pub fn drift_detected(path: &str, reason: &str, need_sync: bool) -> Self {
        DomainEvent::DriftDetected {
            path: path.to_string(),
            reason: reason.to_string(),
            need_sync,
            occurred_at: Utc::now(),
        }
    }

    pub fn event_type(&self) -> EventType {
        match self {
            DomainEvent::StackStatusChanged { .. } => EventType::StackStatusChanged,
            DomainEvent::StackSynced { .. } => EventType::StackSynced,
            DomainEvent::StackRemoved { .. } => EventType::StackRemoved,
            DomainEvent::ContainersUpdated { .. } => EventType::ContainersUpdated,
            DomainEvent::DriftDetected { .. } => EventType::DriftDetected,
        }
    }

    pub fn stack_path(&self) -> &str {
        match self {
            DomainEvent::StackStatusChanged { path, .. }
            | DomainEvent::StackSynced { path, .. }
            | DomainEvent::StackRemoved { path, .. }
            | DomainEvent::ContainersUpdated { path, .. }
            | DomainEvent::DriftDetected { path, .. } => path,
        }
    }

    /// Structured event payload, used for debug logging.
    pub fn metadata(&self) -> serde_json::Value {
        match self {
            DomainEvent::StackStatusChanged {
                path,
                status,
                error,
                occurred_at,
            } => serde_json::json!({
                "stack_path": path,
                "status": status.as_str(),
                "error": error,
                "occurred_at": occurred_at.to_rfc3339(),
            }),
            DomainEvent::StackSynced {
                path,
                revision,
                compose_hash,
                commit_message,
                occurred_at,
            } => serde_json::json!({
                "stack_path": path,
                "revision": revision,
                "compose_hash": compose_hash,
                "commit_message": commit_message,
                "occurred_at": occurred_at.to_rfc3339(),
            }),
            DomainEvent::StackRemoved {
                path,
                reason,
                occurred_at,
            } => serde_json::json!({
                "stack_path": path,
                "reason": reason,
                "occurred_at": occurred_at.to_rfc3339(),
            }),
            DomainEvent::ContainersUpdated {
                path,
                running,
                total,
                occurred_at,
            } => serde_json::json!({
                "stack_path": path,
                "running_count": running,
                "total_count": total,
                "occurred_at": occurred_at.to_rfc3339(),
            }),
            DomainEvent::DriftDetected {
                path,
                reason,
                need_sync,
                occurred_at,
            } => serde_json::json!({
                "stack_path": path,
                "reason": reason,
                "need_sync": need_sync,
                "occurred_at": occurred_at.to_rfc3339(),
            }),
        }
    }
}

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;
type Handler = dyn Fn(&DomainEvent) -> Result<(), HandlerError> + Send + Sync;

/// Subscribe-by-type event bus. Handler failures are logged and never stop
/// dispatch to later handlers.
#[derive(Default)]
pub struct EventBus {
    handlers: RwLock<HashMap<EventType, Vec<Arc<Handler>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, event_type: EventType, handler: F)
    where
        F: Fn(&DomainEvent) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .expect("poisoned handler lock")
            .entry(event_type)
            .or_default()
            .push(Arc::new(handler));
        log::debug!("event handler subscribed for {}", event_type.as_str());
    }

    pub fn publish(&self, event: &DomainEvent) {
        let handlers: Vec<Arc<Handler>> = {
            let guard = self.handlers.read().expect("poisoned handler lock");
            match guard.get(&event.event_type()) {
                Some(handlers) => handlers.clone(),
                None => return,
            }
        };

        log::debug!(
            "publishing {} to {} handler(s): {}",
            event.event_type().as_str(),
            handlers.len(),
            event.metadata()
        );

        for handler in handlers {
            if let Err(e) = handler(event) {
                log::error!(
                    "event handler failed for {}: {e}",
                    event.event_type().as_str()
                );
            }
        }
    }
}
