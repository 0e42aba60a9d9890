//! Container identity labels: written into the compose override on apply,
//! carried on live containers, and read back during drift detection.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::docker::{Client, CommandError};
use crate::signals::Shutdown;

pub const LABEL_STACK_PATH: &str = "com.docker-cd.stack.path";
pub const LABEL_DESIRED_REVISION: &str = "com.docker-cd.desired.revision";
pub const LABEL_DESIRED_COMMIT_MESSAGE: &str = "com.docker-cd.desired.commit_message";
pub const LABEL_DESIRED_COMPOSE_HASH: &str = "com.docker-cd.desired.compose_hash";
pub const LABEL_SYNCED_AT: &str = "com.docker-cd.synced.at";
pub const LABEL_SYNC_AT: &str = "com.docker-cd.sync.at";
pub const LABEL_SYNC_STATUS: &str = "com.docker-cd.sync.status";
pub const LABEL_SYNC_ERROR: &str = "com.docker-cd.sync.error";

/// Sync metadata read back from a live container's labels.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StackSyncMetadata {
    pub stack_path: String,
    pub desired_revision: String,
    pub desired_commit_message: String,
    pub desired_compose_hash: String,
    pub synced_at: String,
    pub last_sync_at: String,
    pub sync_status: String,
    pub sync_error: String,
}

/// Converts a container's label map to [`StackSyncMetadata`].
pub fn map_labels_to_metadata(labels: &HashMap<String, String>) -> StackSyncMetadata {
    let get = |key: &str| labels.get(key).cloned().unwrap_or_default();
    StackSyncMetadata {
        stack_path: get(LABEL_STACK_PATH),
        desired_revision: get(LABEL_DESIRED_REVISION),
        desired_commit_message: get(LABEL_DESIRED_COMMIT_MESSAGE),
        desired_compose_hash: get(LABEL_DESIRED_COMPOSE_HASH),
        synced_at: get(LABEL_SYNCED_AT),
        last_sync_at: get(LABEL_SYNC_AT),
        sync_status: get(LABEL_SYNC_STATUS),
        sync_error: get(LABEL_SYNC_ERROR),
    }
}

/// Reads runtime sync metadata from live containers.
#[async_trait]
pub trait ContainerInspector: Send + Sync {
    /// Returns sync metadata grouped by stack path. When multiple containers
    /// share a path, the first one encountered supplies the metadata.
    async fn stack_labels(
        &self,
        cancel: &Shutdown,
    ) -> Result<HashMap<String, StackSyncMetadata>, CommandError>;
}

/// [`ContainerInspector`] backed by the Docker CLI.
pub struct DockerContainerInspector {
    client: Client,
}

impl DockerContainerInspector {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ContainerInspector for DockerContainerInspector {
    async fn stack_labels(
        &self,
        cancel: &Shutdown,
    ) -> Result<HashMap<String, StackSyncMetadata>, CommandError> {
        let containers = self
            .client
            .list_containers_with_label(cancel, LABEL_STACK_PATH)
            .await?;

        let mut result = HashMap::new();
        for container in containers {
            let Some(stack_path) = container.labels.get(LABEL_STACK_PATH) else {
                continue;
            };
            if stack_path.is_empty() || result.contains_key(stack_path) {
                continue;
            }
            log::debug!(
                "container {} ({}) supplies metadata for stack {stack_path}",
                container.container_name,
                &container.container_id[..container.container_id.len().min(12)]
            );
            result.insert(stack_path.clone(), map_labels_to_metadata(&container.labels));
        }
        Ok(result)
    }
}
