use std::sync::RwLock;

use super::{RefreshStatus, RefreshSummary, Snapshot, StackRecord};

/// Thread-safe holder of the latest desired-state snapshot.
///
/// Reads return deep copies so callers never observe torn state and never
/// share the internal compose-content buffers.
#[derive(Default)]
pub struct Store {
    snapshot: RwLock<Option<Snapshot>>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of the current snapshot, or `None` before the first
    /// refresh.
    pub fn get(&self) -> Option<Snapshot> {
        self.snapshot.read().expect("poisoned store lock").clone()
    }

    /// Replaces the current snapshot.
    pub fn set(&self, snap: Snapshot) {
        *self.snapshot.write().expect("poisoned store lock") = Some(snap);
    }

    /// Updates only the refresh status and error. Allocates an empty snapshot
    /// if none exists yet, so the status is visible before the first refresh
    /// completes.
    pub fn update_status(&self, status: RefreshStatus, refresh_error: &str) {
        let mut guard = self.snapshot.write().expect("poisoned store lock");
        let snap = guard.get_or_insert_with(Snapshot::default);
        snap.refresh_status = status;
        snap.refresh_error = refresh_error.to_string();
    }

    /// Returns a copy of the current stack records, empty before the first
    /// refresh.
    pub fn get_stacks(&self) -> Vec<StackRecord> {
        self.snapshot
            .read()
            .expect("poisoned store lock")
            .as_ref()
            .map(|snap| snap.stacks.clone())
            .unwrap_or_default()
    }

    /// Returns the refresh-status projection without the stack list.
    pub fn get_refresh_status(&self) -> Option<RefreshSummary> {
        self.snapshot
            .read()
            .expect("poisoned store lock")
            .as_ref()
            .map(Snapshot::summary)
    }
}
