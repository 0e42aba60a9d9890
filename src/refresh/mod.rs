//! Refresh service: drives the trigger queue, pulls the desired state from
//! the repository, and hands the result to the reconciler.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use crate::config::Config;
use crate::git::{ComposeEntry, ComposeReader};
use crate::signals::Shutdown;
use crate::state::{compose_hash, Broadcaster, RefreshStatus, Snapshot, StackRecord, Store};

mod queue;

pub use queue::{QueueResult, Trigger, TriggerQueue, TriggerSource};

/// Invoked after each successful refresh to run a reconciliation cycle.
#[async_trait]
pub trait ReconcileHook: Send + Sync {
    async fn run_reconcile(&self, cancel: &Shutdown);
}

/// Orchestrates desired-state refreshes. There is exactly one consumer loop;
/// it is the sole mutator of the store's snapshot pointer during refresh.
pub struct Service {
    cfg: Config,
    store: Arc<Store>,
    queue: Arc<TriggerQueue>,
    reader: Arc<dyn ComposeReader>,
    reconcile_hook: Option<Arc<dyn ReconcileHook>>,
    broadcaster: Option<Arc<Broadcaster>>,
}

impl Service {
    pub fn new(
        cfg: Config,
        store: Arc<Store>,
        queue: Arc<TriggerQueue>,
        reader: Arc<dyn ComposeReader>,
    ) -> Self {
        Self {
            cfg,
            store,
            queue,
            reader,
            reconcile_hook: None,
            broadcaster: None,
        }
    }

    /// Sets the callback that runs after each successful refresh.
    pub fn set_reconcile_hook(&mut self, hook: Arc<dyn ReconcileHook>) {
        self.reconcile_hook = Some(hook);
    }

    /// Sets the broadcaster used for refresh-status frames.
    pub fn set_broadcaster(&mut self, broadcaster: Arc<Broadcaster>) {
        self.broadcaster = Some(broadcaster);
    }

    /// Enqueues a refresh trigger and reports whether it started immediately
    /// or was queued behind the in-flight refresh.
    pub fn request_refresh(&self, source: TriggerSource) -> QueueResult {
        self.queue.enqueue(Trigger::now(source))
    }

    /// Runs the refresh loop until shutdown: a synthetic startup trigger
    /// first, then the periodic ticker (when configured) and whatever the
    /// queue delivers. A shutdown mid-refresh cancels the in-flight pull
    /// and marks the refresh failed.
    pub async fn start(self: Arc<Self>, shutdown: Shutdown) {
        self.queue.enqueue(Trigger::now(TriggerSource::Startup));

        if let Some(interval) = self.cfg.refresh_poll_interval {
            let service = Arc::clone(&self);
            let shutdown = shutdown.clone();
            tokio::spawn(service.poll_loop(shutdown, interval));
        }

        loop {
            let trigger = tokio::select! {
                _ = shutdown.cancelled() => return,
                trigger = self.queue.next_trigger() => trigger,
            };

            tokio::select! {
                _ = shutdown.cancelled() => {
                    self.store
                        .update_status(RefreshStatus::Failed, "refresh cancelled: shutting down");
                    return;
                }
                _ = self.do_refresh(&shutdown, trigger) => {}
            }
        }
    }

    async fn poll_loop(self: Arc<Self>, shutdown: Shutdown, interval: std::time::Duration) {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately; the startup trigger already
        // covers that refresh.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => {
                    log::info!("periodic refresh triggered (interval: {interval:?})");
                    self.queue.enqueue(Trigger::now(TriggerSource::Periodic));
                }
            }
        }
    }

    async fn do_refresh(&self, cancel: &Shutdown, trigger: Trigger) {
        log::info!(
            "starting refresh (source: {}, requested at {})",
            trigger.source,
            trigger.requested_at.to_rfc3339()
        );
        self.store.update_status(RefreshStatus::Refreshing, "");
        self.publish_refresh_status();

        let result = self
            .reader
            .read_compose_files(
                cancel,
                &self.cfg.git_repo_url,
                &self.cfg.git_access_token,
                &self.cfg.git_revision,
                &self.cfg.git_deploy_dir,
            )
            .await;

        let contents = match result {
            Ok(contents) => contents,
            Err(e) => {
                // The previous snapshot's stacks stay available.
                log::error!("refresh failed: {e}");
                self.store
                    .update_status(RefreshStatus::Failed, &e.to_string());
                self.publish_refresh_status();
                self.queue.done();
                return;
            }
        };

        let stacks = self.build_stacks_preserving_status(contents.entries);
        let stack_count = stacks.len();

        self.store.set(Snapshot {
            revision: contents.revision.clone(),
            commit_message: contents.commit_message,
            ref_name: self.cfg.git_revision.clone(),
            ref_type: contents.ref_type,
            refreshed_at: Some(Utc::now()),
            refresh_status: RefreshStatus::Completed,
            refresh_error: String::new(),
            stacks,
        });
        self.publish_refresh_status();
        log::info!(
            "refresh completed: {stack_count} stack(s) at {}",
            &contents.revision[..contents.revision.len().min(12)]
        );

        if let Some(hook) = &self.reconcile_hook {
            log::info!("triggering reconciliation after refresh");
            hook.run_reconcile(cancel).await;
        }

        self.queue.done();
    }

    /// Builds StackRecords from repository entries. A stack whose path and
    /// compose hash both match the previous snapshot keeps its status and
    /// sync metadata; any difference restarts it at `missing` with cleared
    /// metadata. This is what stops a rediscovery from thrashing
    /// already-synced stacks.
    fn build_stacks_preserving_status(&self, entries: Vec<ComposeEntry>) -> Vec<StackRecord> {
        let existing: std::collections::HashMap<String, StackRecord> = self
            .store
            .get_stacks()
            .into_iter()
            .map(|stack| (stack.path.clone(), stack))
            .collect();

        entries
            .into_iter()
            .map(|entry| {
                let hash = compose_hash(&entry.content);
                let mut record = StackRecord {
                    path: entry.stack_path,
                    compose_file: entry.compose_file,
                    compose_hash: hash.clone(),
                    content: entry.content,
                    ..Default::default()
                };

                match existing.get(&record.path) {
                    Some(prev) if prev.compose_hash == hash => {
                        log::debug!(
                            "stack {} status {} preserved (hash match)",
                            record.path,
                            prev.status
                        );
                        record.status = prev.status;
                        record.containers_running = prev.containers_running;
                        record.containers_total = prev.containers_total;
                        record.synced_revision = prev.synced_revision.clone();
                        record.synced_commit_message = prev.synced_commit_message.clone();
                        record.synced_compose_hash = prev.synced_compose_hash.clone();
                        record.synced_at = prev.synced_at.clone();
                        record.last_sync_at = prev.last_sync_at.clone();
                        record.last_sync_status = prev.last_sync_status.clone();
                        record.last_sync_error = prev.last_sync_error.clone();
                    }
                    Some(prev) => {
                        log::debug!(
                            "stack {} reset to missing (hash changed: prev={} new={})",
                            record.path,
                            &prev.compose_hash[..prev.compose_hash.len().min(12)],
                            &hash[..hash.len().min(12)]
                        );
                    }
                    None => {
                        log::debug!("stack {} discovered (new stack)", record.path);
                    }
                }

                record
            })
            .collect()
    }

    fn publish_refresh_status(&self) {
        if let Some(broadcaster) = &self.broadcaster {
            if let Some(summary) = self.store.get_refresh_status() {
                log::debug!("refresh status now {}", summary.refresh_status);
                broadcaster.publish_refresh_status(&summary);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::{GitError, RepoContents};
    use crate::state::{RefType, StackSyncStatus};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct StubReader {
        results: Mutex<VecDeque<Result<RepoContents, GitError>>>,
    }

    impl StubReader {
        fn new(results: Vec<Result<RepoContents, GitError>>) -> Self {
            Self {
                results: Mutex::new(results.into()),
            }
        }
    }

    #[async_trait]
    impl ComposeReader for StubReader {
        async fn read_compose_files(
            &self,
            _cancel: &Shutdown,
            _repo_url: &str,
            _token: &str,
            _revision: &str,
            _deploy_dir: &str,
        ) -> Result<RepoContents, GitError> {
            self.results
                .lock()
                .unwrap()
                .pop_front()
                .expect("unexpected extra refresh")
        }
    }

    struct CountingHook {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ReconcileHook for CountingHook {
        async fn run_reconcile(&self, _cancel: &Shutdown) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn test_config() -> Config {
        Config::from_lookup(|key| match key {
            "GIT_REPO_URL" => Some("https://github.com/acme/deploy.git".to_string()),
            "GIT_ACCESS_TOKEN" => Some("token".to_string()),
            "GIT_REVISION" => Some("main".to_string()),
            _ => None,
        })
        .unwrap()
    }

    fn contents(entries: Vec<ComposeEntry>, revision: &str) -> RepoContents {
        RepoContents {
            entries,
            revision: revision.to_string(),
            commit_message: "initial deploy".to_string(),
            ref_type: RefType::Branch,
        }
    }

    fn entry(path: &str, content: &[u8]) -> ComposeEntry {
        ComposeEntry {
            stack_path: path.to_string(),
            compose_file: "docker-compose.yml".to_string(),
            content: content.to_vec(),
        }
    }

    fn make_service(reader: StubReader) -> (Arc<Service>, Arc<Store>, Arc<TriggerQueue>) {
        let store = Arc::new(Store::new());
        let queue = Arc::new(TriggerQueue::new());
        let service = Service::new(
            test_config(),
            Arc::clone(&store),
            Arc::clone(&queue),
            Arc::new(reader),
        );
        (Arc::new(service), store, queue)
    }

    #[tokio::test]
    async fn refresh_replaces_snapshot() {
        let body: &[u8] = b"services:\n  web:\n    image: nginx\n";
        let reader = StubReader::new(vec![Ok(contents(vec![entry("myapp", body)], "abc123"))]);
        let (service, store, _) = make_service(reader);

        service.do_refresh(&Shutdown::none(), Trigger::now(TriggerSource::Startup)).await;

        let snap = store.get().unwrap();
        assert_eq!(snap.revision, "abc123");
        assert_eq!(snap.commit_message, "initial deploy");
        assert_eq!(snap.ref_name, "main");
        assert_eq!(snap.refresh_status, RefreshStatus::Completed);
        assert!(snap.refreshed_at.is_some());
        assert_eq!(snap.stacks.len(), 1);
        assert_eq!(snap.stacks[0].path, "myapp");
        assert_eq!(snap.stacks[0].compose_hash, compose_hash(body));
        assert_eq!(snap.stacks[0].status, StackSyncStatus::Missing);
    }

    #[tokio::test]
    async fn identical_content_preserves_status_and_metadata() {
        let body: &[u8] = b"services:\n  web:\n    image: nginx\n";
        let reader = StubReader::new(vec![
            Ok(contents(vec![entry("myapp", body)], "abc123")),
            Ok(contents(vec![entry("myapp", body)], "def456")),
        ]);
        let (service, store, _) = make_service(reader);

        service.do_refresh(&Shutdown::none(), Trigger::now(TriggerSource::Startup)).await;

        // Simulate a successful sync between refreshes.
        let mut snap = store.get().unwrap();
        snap.stacks[0].status = StackSyncStatus::Synced;
        snap.stacks[0].synced_revision = "abc123".to_string();
        snap.stacks[0].synced_compose_hash = compose_hash(body);
        snap.stacks[0].synced_at = "2024-01-01T00:00:00Z".to_string();
        snap.stacks[0].last_sync_status = "synced".to_string();
        store.set(snap);

        service.do_refresh(&Shutdown::none(), Trigger::now(TriggerSource::Webhook)).await;

        let snap = store.get().unwrap();
        assert_eq!(snap.revision, "def456");
        assert_eq!(snap.stacks[0].status, StackSyncStatus::Synced);
        assert_eq!(snap.stacks[0].synced_revision, "abc123");
        assert_eq!(snap.stacks[0].synced_at, "2024-01-01T00:00:00Z");
    }

    #[tokio::test]
    async fn changed_content_resets_to_missing_with_cleared_metadata() {
        let reader = StubReader::new(vec![
            Ok(contents(vec![entry("myapp", b"services:\n  web:\n    image: nginx:1\n")], "abc123")),
            Ok(contents(vec![entry("myapp", b"services:\n  web:\n    image: nginx:2\n")], "def456")),
        ]);
        let (service, store, _) = make_service(reader);

        service.do_refresh(&Shutdown::none(), Trigger::now(TriggerSource::Startup)).await;

        let mut snap = store.get().unwrap();
        snap.stacks[0].status = StackSyncStatus::Synced;
        snap.stacks[0].synced_revision = "abc123".to_string();
        store.set(snap);

        service.do_refresh(&Shutdown::none(), Trigger::now(TriggerSource::Webhook)).await;

        let snap = store.get().unwrap();
        assert_eq!(snap.stacks[0].status, StackSyncStatus::Missing);
        assert!(snap.stacks[0].synced_revision.is_empty());
        assert!(snap.stacks[0].synced_at.is_empty());
    }

    #[tokio::test]
    async fn reader_failure_keeps_previous_stacks() {
        let body: &[u8] = b"services:\n  web:\n    image: nginx\n";
        let reader = StubReader::new(vec![
            Ok(contents(vec![entry("myapp", body)], "abc123")),
            Err(GitError::RefNotFound("main".to_string())),
        ]);
        let (service, store, queue) = make_service(reader);

        queue.enqueue(Trigger::now(TriggerSource::Startup));
        queue.next_trigger().await;
        service.do_refresh(&Shutdown::none(), Trigger::now(TriggerSource::Startup)).await;

        queue.enqueue(Trigger::now(TriggerSource::Manual));
        queue.next_trigger().await;
        service.do_refresh(&Shutdown::none(), Trigger::now(TriggerSource::Manual)).await;

        let snap = store.get().unwrap();
        assert_eq!(snap.refresh_status, RefreshStatus::Failed);
        assert!(snap.refresh_error.contains("not found"));
        // Consumers still have the previous desired state.
        assert_eq!(snap.stacks.len(), 1);
        assert_eq!(snap.revision, "abc123");
        // The queue went idle again after the failed refresh.
        assert!(!queue.is_running());
    }

    #[tokio::test]
    async fn reconcile_hook_runs_after_successful_refresh_only() {
        let body: &[u8] = b"services:\n  web:\n    image: nginx\n";
        let reader = StubReader::new(vec![
            Ok(contents(vec![entry("myapp", body)], "abc123")),
            Err(GitError::RefNotFound("main".to_string())),
        ]);
        let store = Arc::new(Store::new());
        let queue = Arc::new(TriggerQueue::new());
        let hook = Arc::new(CountingHook {
            calls: AtomicUsize::new(0),
        });
        let mut service = Service::new(test_config(), store, Arc::clone(&queue), Arc::new(reader));
        service.set_reconcile_hook(hook.clone());
        let service = Arc::new(service);

        service.do_refresh(&Shutdown::none(), Trigger::now(TriggerSource::Startup)).await;
        assert_eq!(hook.calls.load(Ordering::SeqCst), 1);

        service.do_refresh(&Shutdown::none(), Trigger::now(TriggerSource::Manual)).await;
        assert_eq!(hook.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn coalesced_trigger_is_promoted_after_refresh() {
        let body: &[u8] = b"services:\n  web:\n    image: nginx\n";
        let reader = StubReader::new(vec![Ok(contents(vec![entry("myapp", body)], "abc123"))]);
        let (service, _, queue) = make_service(reader);

        assert_eq!(
            service.request_refresh(TriggerSource::Manual),
            QueueResult::Refreshing
        );
        let trigger = queue.next_trigger().await;

        // Burst while the refresh is in flight: only the newest survives.
        assert_eq!(
            service.request_refresh(TriggerSource::Webhook),
            QueueResult::Queued
        );
        assert_eq!(
            service.request_refresh(TriggerSource::Periodic),
            QueueResult::Queued
        );

        service.do_refresh(&Shutdown::none(), trigger).await;

        assert!(queue.is_running(), "promoted trigger keeps the queue busy");
        let promoted = queue.next_trigger().await;
        assert_eq!(promoted.source, TriggerSource::Periodic);
    }
}
