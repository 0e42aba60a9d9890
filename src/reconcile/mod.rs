//! Reconciliation: drives the runtime toward the desired state, one serial
//! cycle at a time.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::events::{DomainEvent, EventBus};
use crate::signals::Shutdown;
use crate::state::{ContainerInfo, Snapshot, StackSyncStatus, Store};

mod ack;
mod compose;
mod drift;
mod labels;
mod policy;
mod state_manager;

pub use ack::AckStore;
pub use compose::{
    derive_project_name, extract_service_names, generate_label_override, truncate_error,
    write_scratch_dir, ComposeRunner, DockerComposeRunner, OrchestratorError,
};
pub use drift::{detect_changes, DriftResult};
pub use labels::{
    map_labels_to_metadata, ContainerInspector, DockerContainerInspector, StackSyncMetadata,
    LABEL_DESIRED_COMMIT_MESSAGE, LABEL_DESIRED_COMPOSE_HASH, LABEL_DESIRED_REVISION,
    LABEL_STACK_PATH, LABEL_SYNCED_AT, LABEL_SYNC_AT, LABEL_SYNC_ERROR, LABEL_SYNC_STATUS,
};
pub use policy::{DriftPolicy, ReconciliationPolicy};
pub use state_manager::{now_rfc3339, StateManager};

/// Outcome of one reconciliation attempt for one stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunResult {
    Success,
    Failed,
    Skipped,
}

impl RunResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunResult::Success => "success",
            RunResult::Failed => "failed",
            RunResult::Skipped => "skipped",
        }
    }
}

/// Record of a single reconciliation attempt.
#[derive(Debug, Clone)]
pub struct ReconciliationRun {
    pub stack_path: String,
    pub desired_revision: String,
    pub desired_hash: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub result: RunResult,
    pub error: String,
}

impl ReconciliationRun {
    fn finish(
        path: &str,
        revision: &str,
        hash: &str,
        started_at: DateTime<Utc>,
        result: RunResult,
        error: String,
    ) -> Self {
        Self {
            stack_path: path.to_string(),
            desired_revision: revision.to_string(),
            desired_hash: hash.to_string(),
            started_at,
            finished_at: Utc::now(),
            result,
            error,
        }
    }
}

/// Compares desired state with runtime state and applies changes through the
/// compose orchestrator. Cycles are serial; the mutex is held for the whole
/// cycle.
pub struct Reconciler {
    cycle: Mutex<()>,
    store: Arc<Store>,
    policy: ReconciliationPolicy,
    compose: Arc<dyn ComposeRunner>,
    inspector: Arc<dyn ContainerInspector>,
    acks: Arc<AckStore>,
    state: Arc<StateManager>,
    event_bus: Arc<EventBus>,
    project_prefix: String,
}

impl Reconciler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        policy: ReconciliationPolicy,
        compose: Arc<dyn ComposeRunner>,
        inspector: Arc<dyn ContainerInspector>,
        acks: Arc<AckStore>,
        state: Arc<StateManager>,
        event_bus: Arc<EventBus>,
        project_prefix: &str,
    ) -> Self {
        Self {
            cycle: Mutex::new(()),
            store,
            policy,
            compose,
            inspector,
            acks,
            state,
            event_bus,
            project_prefix: project_prefix.to_string(),
        }
    }

    /// Performs a full reconciliation cycle and returns one run record per
    /// acted-upon stack. Cancellation propagates into every orchestrator
    /// subprocess the cycle launches.
    pub async fn reconcile(&self, cancel: &Shutdown) -> Vec<ReconciliationRun> {
        let _cycle = self.cycle.lock().await;

        if !self.policy.enabled {
            log::info!("reconciliation disabled, skipping");
            return Vec::new();
        }

        let Some(snap) = self.store.get() else {
            log::info!("no desired state available, skipping reconciliation");
            return Vec::new();
        };

        let runtime = match self.inspector.stack_labels(cancel).await {
            Ok(runtime) => runtime,
            Err(e) => {
                // Inspection failures never mutate the store.
                log::error!("failed to inspect runtime state: {e}");
                return Vec::new();
            }
        };
        log::debug!("runtime labels found for {} stack(s)", runtime.len());
        for rt in runtime.values() {
            log::debug!(
                "runtime stack {}: status={} synced_at={} last_sync_at={} error={:?}",
                rt.stack_path,
                rt.sync_status,
                rt.synced_at,
                rt.last_sync_at,
                rt.sync_error
            );
        }

        let drifts = detect_changes(&snap.stacks, &runtime, self.policy.remove_enabled);

        // Store-correction pass: recover provenance for stacks that are in
        // sync at runtime but stale in the store (e.g. after a restart), and
        // observe live container changes.
        for drift in drifts.iter().filter(|d| !d.need_sync && !d.need_remove) {
            let Some(rt) = runtime.get(&drift.path) else {
                continue;
            };
            let stale = snap
                .stacks
                .iter()
                .any(|s| s.path == drift.path && s.status != StackSyncStatus::Synced);
            if stale {
                log::info!("correcting store status for in-sync stack {}", drift.path);
                self.state.mark_synced(
                    &drift.path,
                    &rt.desired_revision,
                    &rt.desired_commit_message,
                    &rt.desired_compose_hash,
                    &rt.synced_at,
                );
            }
            let project_name = derive_project_name(&self.project_prefix, &drift.path);
            self.state
                .update_container_counts(cancel, &drift.path, &project_name)
                .await;
        }

        let mut runs = Vec::new();

        for drift in drifts.iter().filter(|d| d.need_sync || d.need_remove) {
            self.event_bus.publish(&DomainEvent::drift_detected(
                &drift.path,
                &drift.reason,
                drift.need_sync,
            ));

            if drift.need_remove {
                runs.push(self.remove_stack(cancel, drift, &snap).await);
                continue;
            }

            if self.policy.drift_policy == DriftPolicy::Flag {
                if !self.acks.is_acknowledged(&drift.path) {
                    log::info!(
                        "stack {} has drift but policy is 'flag' and not acknowledged, skipping",
                        drift.path
                    );
                    self.state.update_status(
                        &drift.path,
                        StackSyncStatus::Failed,
                        "drift detected, awaiting acknowledgement",
                    );
                    continue;
                }
                self.acks.clear(&drift.path);
            }

            runs.push(self.sync_stack(cancel, drift, &snap).await);
        }

        runs
    }

    async fn sync_stack(
        &self,
        cancel: &Shutdown,
        drift: &DriftResult,
        snap: &Snapshot,
    ) -> ReconciliationRun {
        let started_at = Utc::now();

        let Some(stack) = snap.stacks.iter().find(|s| s.path == drift.path) else {
            return ReconciliationRun::finish(
                &drift.path,
                &snap.revision,
                "",
                started_at,
                RunResult::Failed,
                "stack not found in desired state".to_string(),
            );
        };

        log::info!("reconciling stack {} (reason: {})", drift.path, drift.reason);
        self.state
            .update_status(&drift.path, StackSyncStatus::Syncing, "");

        let project_name = derive_project_name(&self.project_prefix, &drift.path);

        let service_names = extract_service_names(&stack.content);
        if service_names.is_empty() {
            log::warn!(
                "no service names extracted from compose file for stack {}, labels will not be applied",
                drift.path
            );
        }

        let now = now_rfc3339();
        let override_content = generate_label_override(
            &drift.path,
            &snap.revision,
            &snap.commit_message,
            &stack.compose_hash,
            &service_names,
            &now,
        );

        let scratch = match write_scratch_dir(&stack.compose_file, &stack.content, &override_content)
        {
            Ok(scratch) => scratch,
            Err(e) => {
                let error = format!("failed to write compose files: {e}");
                self.state.update_status(
                    &drift.path,
                    StackSyncStatus::Failed,
                    &truncate_error(&error),
                );
                return ReconciliationRun::finish(
                    &drift.path,
                    &snap.revision,
                    &stack.compose_hash,
                    started_at,
                    RunResult::Failed,
                    error,
                );
            }
        };

        // work_dir is the stack path so compose resolves relative volume
        // mounts and build contexts against the stack directory.
        let override_file = (!override_content.is_empty()).then_some(scratch.override_file.as_path());
        let result = self
            .compose
            .compose_up(
                cancel,
                &project_name,
                &scratch.compose_file,
                override_file,
                Some(std::path::Path::new(&drift.path)),
            )
            .await;

        if let Err(e) = result {
            let error = e.to_string();
            log::error!("reconcile failed for stack {}: {error}", drift.path);
            self.state.update_status(
                &drift.path,
                StackSyncStatus::Failed,
                &truncate_error(&error),
            );
            return ReconciliationRun::finish(
                &drift.path,
                &snap.revision,
                &stack.compose_hash,
                started_at,
                RunResult::Failed,
                error,
            );
        }

        log::info!("reconcile succeeded for stack {}", drift.path);
        self.state.mark_synced(
            &drift.path,
            &snap.revision,
            &snap.commit_message,
            &stack.compose_hash,
            &now,
        );
        self.state
            .update_container_counts(cancel, &drift.path, &project_name)
            .await;

        ReconciliationRun::finish(
            &drift.path,
            &snap.revision,
            &stack.compose_hash,
            started_at,
            RunResult::Success,
            String::new(),
        )
    }

    async fn remove_stack(
        &self,
        cancel: &Shutdown,
        drift: &DriftResult,
        snap: &Snapshot,
    ) -> ReconciliationRun {
        let started_at = Utc::now();

        if !self.policy.remove_enabled {
            return ReconciliationRun::finish(
                &drift.path,
                &snap.revision,
                "",
                started_at,
                RunResult::Skipped,
                String::new(),
            );
        }

        log::info!("removing stack {} (reason: {})", drift.path, drift.reason);
        self.state
            .update_status(&drift.path, StackSyncStatus::Deleting, "");

        let project_name = derive_project_name(&self.project_prefix, &drift.path);

        if let Err(e) = self.compose.compose_down(cancel, &project_name).await {
            let error = e.to_string();
            log::error!("removal failed for stack {}: {error}", drift.path);
            self.state.update_status(
                &drift.path,
                StackSyncStatus::Failed,
                &truncate_error(&error),
            );
            return ReconciliationRun::finish(
                &drift.path,
                &snap.revision,
                "",
                started_at,
                RunResult::Failed,
                error,
            );
        }

        log::info!("removal succeeded for stack {}", drift.path);
        self.state
            .update_status(&drift.path, StackSyncStatus::Missing, "");
        self.event_bus
            .publish(&DomainEvent::stack_removed(&drift.path, &drift.reason));

        ReconciliationRun::finish(
            &drift.path,
            &snap.revision,
            "",
            started_at,
            RunResult::Success,
            String::new(),
        )
    }

    /// Lists the containers of one stack's project.
    pub async fn get_containers(
        &self,
        cancel: &Shutdown,
        stack_path: &str,
    ) -> Result<Vec<ContainerInfo>, OrchestratorError> {
        let project_name = derive_project_name(&self.project_prefix, stack_path);
        self.compose.compose_ps(cancel, &project_name).await
    }
}

#[async_trait::async_trait]
impl crate::refresh::ReconcileHook for Reconciler {
    async fn run_reconcile(&self, cancel: &Shutdown) {
        let runs = self.reconcile(cancel).await;
        for run in &runs {
            log::info!(
                "reconcile {} for stack {} (revision {}, hash {}) in {}ms",
                run.result.as_str(),
                run.stack_path,
                &run.desired_revision[..run.desired_revision.len().min(12)],
                &run.desired_hash[..run.desired_hash.len().min(12)],
                (run.finished_at - run.started_at).num_milliseconds()
            );
            if !run.error.is_empty() {
                log::warn!("stack {} error: {}", run.stack_path, run.error);
            }
        }
    }
}
