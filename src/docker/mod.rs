//! Docker engine access through the `docker` CLI.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;

use crate::signals::Shutdown;

mod runner;

pub use runner::{CommandError, CommandRunner, ExecRunner};

/// Returns the `-H` flag arguments for docker CLI commands.
///
/// Accepts a Unix socket path (`/var/run/docker.sock`), a full URL
/// (`tcp://host:port` or `unix:///path`), or an empty string to fall back to
/// the `DOCKER_HOST` environment variable.
pub fn host_args(socket: &str) -> Vec<String> {
    if socket.is_empty() {
        return Vec::new();
    }
    if socket.starts_with("tcp://") || socket.starts_with("unix://") {
        return vec!["-H".to_string(), socket.to_string()];
    }
    vec!["-H".to_string(), format!("unix://{socket}")]
}

/// A container's identity and labels as reported by `docker inspect`.
#[derive(Debug, Clone)]
pub struct ContainerLabels {
    pub container_id: String,
    pub container_name: String,
    pub labels: HashMap<String, String>,
}

#[derive(Deserialize)]
struct InspectEntry {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Config")]
    config: InspectConfig,
}

#[derive(Deserialize)]
struct InspectConfig {
    #[serde(rename = "Labels", default)]
    labels: HashMap<String, String>,
}

/// Queries the Docker engine via the CLI.
pub struct Client {
    runner: Arc<dyn CommandRunner>,
    socket: String,
}

impl Client {
    pub fn new(runner: Arc<dyn CommandRunner>, socket: &str) -> Self {
        Self {
            runner,
            socket: socket.to_string(),
        }
    }

    /// Counts currently running containers.
    pub async fn container_count(&self, cancel: &Shutdown) -> Result<usize, CommandError> {
        let mut args = host_args(&self.socket);
        args.extend(["ps".to_string(), "-q".to_string()]);

        let out = self.runner.run(cancel, "docker", &args).await?;
        Ok(out.lines().filter(|line| !line.trim().is_empty()).count())
    }

    /// Lists running containers carrying the given label key.
    ///
    /// Two steps: `docker ps -q` with a label filter for the IDs, then
    /// `docker inspect` for reliable JSON label parsing.
    pub async fn list_containers_with_label(
        &self,
        cancel: &Shutdown,
        label_key: &str,
    ) -> Result<Vec<ContainerLabels>, CommandError> {
        let mut args = host_args(&self.socket);
        args.extend([
            "ps".to_string(),
            "-q".to_string(),
            "--no-trunc".to_string(),
            "--filter".to_string(),
            format!("label={label_key}"),
        ]);

        let out = self.runner.run(cancel, "docker", &args).await?;
        let ids: Vec<String> = out
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut inspect_args = host_args(&self.socket);
        inspect_args.extend([
            "inspect".to_string(),
            "--format".to_string(),
            "{{json .}}".to_string(),
        ]);
        inspect_args.extend(ids);

        let inspect_out = self.runner.run(cancel, "docker", &inspect_args).await?;

        // docker inspect with multiple IDs outputs one JSON object per line.
        let mut result = Vec::new();
        for line in inspect_out.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let entry: InspectEntry = match serde_json::from_str(line) {
                Ok(entry) => entry,
                Err(_) => continue,
            };
            result.push(ContainerLabels {
                container_id: entry.id,
                container_name: entry.name.trim_start_matches('/').to_string(),
                labels: entry.config.labels,
            });
        }
        Ok(result)
    }
}
