//! Drift detection: compares the desired stack list against the sync
//! metadata carried on live containers.
//!
//! The compose-content hash is the authoritative drift signal; the committed
//! revision is tracked for provenance only and never triggers a sync by
//! itself.

use std::collections::HashMap;

use crate::reconcile::labels::StackSyncMetadata;
use crate::state::StackRecord;

/// Drift status for a single stack. At most one of the flags is set; both
/// false means the stack is in sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriftResult {
    pub path: String,
    pub need_sync: bool,
    pub need_remove: bool,
    pub reason: String,
}

impl DriftResult {
    fn in_sync(path: &str) -> Self {
        Self {
            path: path.to_string(),
            need_sync: false,
            need_remove: false,
            reason: "in sync".to_string(),
        }
    }

    fn sync(path: &str, reason: String) -> Self {
        Self {
            path: path.to_string(),
            need_sync: true,
            need_remove: false,
            reason,
        }
    }

    fn remove(path: &str) -> Self {
        Self {
            path: path.to_string(),
            need_sync: false,
            need_remove: true,
            reason: "not in desired state".to_string(),
        }
    }
}

/// Computes per-stack drift, one result per desired stack in input order.
/// When `remove_enabled` is set, runtime stacks absent from the desired set
/// are appended as removal results in path order.
pub fn detect_changes(
    desired: &[StackRecord],
    runtime: &HashMap<String, StackSyncMetadata>,
    remove_enabled: bool,
) -> Vec<DriftResult> {
    let mut results = Vec::with_capacity(desired.len());

    for stack in desired {
        let Some(rt) = runtime.get(&stack.path) else {
            log::debug!("stack {} has no runtime metadata", stack.path);
            results.push(DriftResult::sync(
                &stack.path,
                "no runtime metadata found".to_string(),
            ));
            continue;
        };

        if rt.desired_revision.is_empty() || rt.desired_compose_hash.is_empty() {
            log::debug!("stack {} has incomplete runtime metadata", stack.path);
            results.push(DriftResult::sync(
                &stack.path,
                "missing or invalid sync metadata".to_string(),
            ));
            continue;
        }

        if rt.desired_compose_hash != stack.compose_hash {
            log::info!(
                "stack {} runtime hash differs from desired (runtime={} desired={})",
                stack.path,
                rt.desired_compose_hash,
                stack.compose_hash
            );
            results.push(DriftResult::sync(
                &stack.path,
                format!(
                    "compose hash drift: runtime={} desired={}",
                    rt.desired_compose_hash, stack.compose_hash
                ),
            ));
            continue;
        }

        results.push(DriftResult::in_sync(&stack.path));
    }

    if remove_enabled {
        let mut extra: Vec<&String> = runtime
            .keys()
            .filter(|path| !desired.iter().any(|stack| &stack.path == *path))
            .collect();
        extra.sort();
        for path in extra {
            log::info!("stack {path} exists in runtime but not in desired state");
            results.push(DriftResult::remove(path));
        }
    }

    results
}
