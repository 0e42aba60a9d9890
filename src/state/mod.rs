//! Desired state loaded from the Git repository, plus the live view the
//! agent maintains over it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

mod broadcast;
mod hash;
mod store;

pub use broadcast::{Broadcaster, SseEvent, SseEventType, Subscription, SUBSCRIBER_BUFFER};
pub use hash::compose_hash;
pub use store::Store;

/// System-wide refresh status of the desired state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefreshStatus {
    Refreshing,
    #[default]
    Queued,
    Completed,
    Failed,
}

impl RefreshStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefreshStatus::Refreshing => "refreshing",
            RefreshStatus::Queued => "queued",
            RefreshStatus::Completed => "completed",
            RefreshStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for RefreshStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-stack sync status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StackSyncStatus {
    #[default]
    Missing,
    Syncing,
    Synced,
    Deleting,
    Failed,
}

impl StackSyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StackSyncStatus::Missing => "missing",
            StackSyncStatus::Syncing => "syncing",
            StackSyncStatus::Synced => "synced",
            StackSyncStatus::Deleting => "deleting",
            StackSyncStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for StackSyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The kind of Git reference the configured revision resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefType {
    #[default]
    Branch,
    Tag,
}

impl RefType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefType::Branch => "branch",
            RefType::Tag => "tag",
        }
    }
}

/// A single container within a stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub service: String,
    /// running, exited, paused, restarting, dead, created
    pub state: String,
    /// healthy, unhealthy, starting, none
    pub health: String,
    pub image: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ports: String,
}

/// A stack discovered in the repository.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackRecord {
    pub path: String,
    pub compose_file: String,
    pub compose_hash: String,
    pub status: StackSyncStatus,
    /// Raw compose file content. Never serialized; it must not leave the
    /// process boundary.
    #[serde(skip)]
    pub content: Vec<u8>,

    pub containers_running: usize,
    pub containers_total: usize,

    // Sync metadata, populated after reconciliation.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub synced_revision: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub synced_commit_message: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub synced_compose_hash: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub synced_at: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_sync_at: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_sync_status: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_sync_error: String,
}

/// The desired state at one revision, as loaded by a refresh.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub revision: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub commit_message: String,
    #[serde(rename = "ref")]
    pub ref_name: String,
    pub ref_type: RefType,
    pub refreshed_at: Option<DateTime<Utc>>,
    pub refresh_status: RefreshStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub refresh_error: String,
    pub stacks: Vec<StackRecord>,
}

/// The refresh-status projection of a [`Snapshot`], without the stack list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshSummary {
    pub revision: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub commit_message: String,
    #[serde(rename = "ref")]
    pub ref_name: String,
    pub ref_type: RefType,
    pub refreshed_at: Option<DateTime<Utc>>,
    pub refresh_status: RefreshStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub refresh_error: String,
}

impl Snapshot {
    /// Projects the refresh-status fields of this snapshot.
    pub fn summary(&self) -> RefreshSummary {
        RefreshSummary {
            revision: self.revision.clone(),
            commit_message: self.commit_message.clone(),
            ref_name: self.ref_name.clone(),
            ref_type: self.ref_type,
            refreshed_at: self.refreshed_at,
            refresh_status: self.refresh_status,
            refresh_error: self.refresh_error.clone(),
        }
    }
}
