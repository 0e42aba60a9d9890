//! All StackRecord mutations go through here so that domain events are
//! emitted consistently with what the store holds.

use std::sync::Arc;

use chrono::{SecondsFormat, Utc};

use crate::events::{DomainEvent, EventBus};
use crate::reconcile::compose::ComposeRunner;
use crate::signals::Shutdown;
use crate::state::{StackSyncStatus, Store};

/// Current time as RFC3339 UTC with second precision.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub struct StateManager {
    store: Arc<Store>,
    compose: Arc<dyn ComposeRunner>,
    event_bus: Arc<EventBus>,
}

impl StateManager {
    pub fn new(store: Arc<Store>, compose: Arc<dyn ComposeRunner>, event_bus: Arc<EventBus>) -> Self {
        Self {
            store,
            compose,
            event_bus,
        }
    }

    /// Updates the sync status of a stack and stamps the last-sync fields.
    /// A missing snapshot or unknown path is a logged no-op.
    pub fn update_status(&self, path: &str, status: StackSyncStatus, sync_error: &str) {
        let Some(mut snap) = self.store.get() else {
            log::warn!("cannot update status for {path}, no snapshot available");
            return;
        };

        let now = now_rfc3339();
        let Some(record) = snap.stacks.iter_mut().find(|s| s.path == path) else {
            log::warn!("stack {path} not found when updating status");
            return;
        };

        record.status = status;
        record.last_sync_at = now;
        record.last_sync_status = status.as_str().to_string();
        if !sync_error.is_empty() {
            record.last_sync_error = sync_error.to_string();
        }

        self.store.set(snap);
        log::info!("stack {path} status updated to {status}");
        self.event_bus
            .publish(&DomainEvent::stack_status_changed(path, status, sync_error));
    }

    /// Marks a stack as successfully synced and records its provenance.
    pub fn mark_synced(
        &self,
        path: &str,
        revision: &str,
        commit_message: &str,
        compose_hash: &str,
        synced_at: &str,
    ) {
        let Some(mut snap) = self.store.get() else {
            log::warn!("cannot mark {path} synced, no snapshot available");
            return;
        };

        let Some(record) = snap.stacks.iter_mut().find(|s| s.path == path) else {
            log::warn!(
                "stack {path} not found when marking synced ({} stacks)",
                snap.stacks.len()
            );
            return;
        };

        record.status = StackSyncStatus::Synced;
        record.synced_revision = revision.to_string();
        record.synced_commit_message = commit_message.to_string();
        record.synced_compose_hash = compose_hash.to_string();
        record.synced_at = synced_at.to_string();
        record.last_sync_at = synced_at.to_string();
        record.last_sync_status = StackSyncStatus::Synced.as_str().to_string();
        record.last_sync_error = String::new();

        self.store.set(snap);
        log::debug!("stack {path} marked as synced at revision {revision}");
        self.event_bus.publish(&DomainEvent::stack_synced(
            path,
            revision,
            compose_hash,
            commit_message,
        ));
    }

    /// Queries the orchestrator for the project's containers and refreshes
    /// the stack's running/total counts.
    pub async fn update_container_counts(&self, cancel: &Shutdown, path: &str, project_name: &str) {
        let containers = match self.compose.compose_ps(cancel, project_name).await {
            Ok(containers) => containers,
            Err(e) => {
                log::warn!("failed to get container counts for {path}: {e}");
                return;
            }
        };

        let running = containers.iter().filter(|c| c.state == "running").count();
        let total = containers.len();

        let Some(mut snap) = self.store.get() else {
            return;
        };
        let Some(record) = snap.stacks.iter_mut().find(|s| s.path == path) else {
            return;
        };
        record.containers_running = running;
        record.containers_total = total;

        self.store.set(snap);
        log::debug!("container counts updated for {path}: {running}/{total}");
        self.event_bus
            .publish(&DomainEvent::containers_updated(path, running, total));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventType;
    use crate::reconcile::compose::OrchestratorError;
    use crate::state::{ContainerInfo, Snapshot, StackRecord};
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::Mutex;

    struct FixedPsCompose {
        containers: Vec<ContainerInfo>,
    }

    #[async_trait]
    impl ComposeRunner for FixedPsCompose {
        async fn compose_up(
            &self,
            _cancel: &Shutdown,
            _project_name: &str,
            _compose_file: &Path,
            _override_file: Option<&Path>,
            _work_dir: Option<&Path>,
        ) -> Result<(), OrchestratorError> {
            Ok(())
        }

        async fn compose_down(
            &self,
            _cancel: &Shutdown,
            _project_name: &str,
        ) -> Result<(), OrchestratorError> {
            Ok(())
        }

        async fn compose_ps(
            &self,
            _cancel: &Shutdown,
            _project_name: &str,
        ) -> Result<Vec<ContainerInfo>, OrchestratorError> {
            Ok(self.containers.clone())
        }
    }

    fn container(state: &str) -> ContainerInfo {
        ContainerInfo {
            id: "abc".into(),
            name: "myapp-web-1".into(),
            service: "web".into(),
            state: state.into(),
            health: "none".into(),
            image: "nginx:alpine".into(),
            ports: String::new(),
        }
    }

    fn manager_with_stack(
        containers: Vec<ContainerInfo>,
    ) -> (StateManager, Arc<Store>, Arc<Mutex<Vec<EventType>>>) {
        let store = Arc::new(Store::new());
        store.set(Snapshot {
            revision: "abc123".into(),
            stacks: vec![StackRecord {
                path: "myapp".into(),
                compose_hash: "hash1".into(),
                ..Default::default()
            }],
            ..Default::default()
        });

        let bus = Arc::new(EventBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        for event_type in [
            EventType::StackStatusChanged,
            EventType::StackSynced,
            EventType::ContainersUpdated,
        ] {
            let seen = Arc::clone(&seen);
            bus.subscribe(event_type, move |event| {
                seen.lock().unwrap().push(event.event_type());
                Ok(())
            });
        }

        let manager = StateManager::new(
            Arc::clone(&store),
            Arc::new(FixedPsCompose { containers }),
            bus,
        );
        (manager, store, seen)
    }

    #[tokio::test]
    async fn update_status_sets_fields_and_publishes() {
        let (manager, store, seen) = manager_with_stack(Vec::new());

        manager.update_status("myapp", StackSyncStatus::Failed, "compose up failed");

        let record = &store.get().unwrap().stacks[0];
        assert_eq!(record.status, StackSyncStatus::Failed);
        assert_eq!(record.last_sync_status, "failed");
        assert_eq!(record.last_sync_error, "compose up failed");
        assert!(!record.last_sync_at.is_empty());
        assert_eq!(*seen.lock().unwrap(), vec![EventType::StackStatusChanged]);
    }

    #[tokio::test]
    async fn update_status_keeps_previous_error_when_empty() {
        let (manager, store, _) = manager_with_stack(Vec::new());

        manager.update_status("myapp", StackSyncStatus::Failed, "first failure");
        manager.update_status("myapp", StackSyncStatus::Syncing, "");

        let record = &store.get().unwrap().stacks[0];
        assert_eq!(record.status, StackSyncStatus::Syncing);
        assert_eq!(record.last_sync_error, "first failure");
    }

    #[tokio::test]
    async fn mark_synced_sets_metadata_and_clears_error() {
        let (manager, store, seen) = manager_with_stack(Vec::new());

        manager.update_status("myapp", StackSyncStatus::Failed, "old error");
        manager.mark_synced("myapp", "abc123", "initial deploy", "hash1", "2024-01-01T00:00:00Z");

        let record = &store.get().unwrap().stacks[0];
        assert_eq!(record.status, StackSyncStatus::Synced);
        assert_eq!(record.synced_revision, "abc123");
        assert_eq!(record.synced_commit_message, "initial deploy");
        assert_eq!(record.synced_compose_hash, "hash1");
        assert_eq!(record.synced_at, "2024-01-01T00:00:00Z");
        assert_eq!(record.last_sync_at, "2024-01-01T00:00:00Z");
        assert!(record.last_sync_error.is_empty());
        assert_eq!(
            *seen.lock().unwrap(),
            vec![EventType::StackStatusChanged, EventType::StackSynced]
        );
    }

    #[tokio::test]
    async fn unknown_path_is_a_no_op() {
        let (manager, store, seen) = manager_with_stack(Vec::new());

        manager.update_status("ghost", StackSyncStatus::Failed, "boom");
        manager.mark_synced("ghost", "r", "m", "h", "t");

        assert_eq!(store.get().unwrap().stacks[0].status, StackSyncStatus::Missing);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_store_is_a_no_op() {
        let store = Arc::new(Store::new());
        let manager = StateManager::new(
            Arc::clone(&store),
            Arc::new(FixedPsCompose { containers: Vec::new() }),
            Arc::new(EventBus::new()),
        );

        manager.update_status("myapp", StackSyncStatus::Syncing, "");
        assert!(store.get().is_none());
    }

    #[tokio::test]
    async fn container_counts_running_vs_total() {
        let (manager, store, seen) =
            manager_with_stack(vec![container("running"), container("exited"), container("running")]);

        manager
            .update_container_counts(&Shutdown::none(), "myapp", "myapp")
            .await;

        let record = &store.get().unwrap().stacks[0];
        assert_eq!(record.containers_running, 2);
        assert_eq!(record.containers_total, 3);
        assert_eq!(*seen.lock().unwrap(), vec![EventType::ContainersUpdated]);
    }
}
