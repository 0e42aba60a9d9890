//! Compose orchestration: the runner interface over the `docker compose`
//! CLI, label-override generation, and the lightweight service-name scanner.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tempfile::TempDir;

use crate::docker::{host_args, CommandError, CommandRunner};
use crate::reconcile::labels::{
    LABEL_DESIRED_COMMIT_MESSAGE, LABEL_DESIRED_COMPOSE_HASH, LABEL_DESIRED_REVISION,
    LABEL_STACK_PATH, LABEL_SYNCED_AT, LABEL_SYNC_AT, LABEL_SYNC_STATUS,
};
use crate::signals::Shutdown;
use crate::state::ContainerInfo;

/// Failure of a compose orchestrator operation.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("docker compose up failed: {source}")]
    Up {
        #[source]
        source: CommandError,
    },
    #[error("docker compose down failed: {source}")]
    Down {
        #[source]
        source: CommandError,
    },
    #[error("docker compose ps failed: {source}")]
    Ps {
        #[source]
        source: CommandError,
    },
    #[error("failed to write compose files: {0}")]
    Scratch(#[from] std::io::Error),
}

/// Abstracts docker compose command execution. Every operation takes a
/// cancellation token that kills the underlying subprocess.
#[async_trait]
pub trait ComposeRunner: Send + Sync {
    /// Runs `docker compose up -d` with the given project name, compose
    /// file, and optional label-override file. `work_dir` sets
    /// `--project-directory` so relative mounts and build contexts resolve
    /// against the stack directory.
    async fn compose_up(
        &self,
        cancel: &Shutdown,
        project_name: &str,
        compose_file: &Path,
        override_file: Option<&Path>,
        work_dir: Option<&Path>,
    ) -> Result<(), OrchestratorError>;

    /// Runs `docker compose down --remove-orphans` for the project. No
    /// compose file is needed; compose locates containers by project label.
    async fn compose_down(
        &self,
        cancel: &Shutdown,
        project_name: &str,
    ) -> Result<(), OrchestratorError>;

    /// Lists the project's containers, running or not.
    async fn compose_ps(
        &self,
        cancel: &Shutdown,
        project_name: &str,
    ) -> Result<Vec<ContainerInfo>, OrchestratorError>;
}

/// [`ComposeRunner`] backed by the docker compose CLI.
pub struct DockerComposeRunner {
    runner: Arc<dyn CommandRunner>,
    socket: String,
}

impl DockerComposeRunner {
    pub fn new(runner: Arc<dyn CommandRunner>, socket: &str) -> Self {
        Self {
            runner,
            socket: socket.to_string(),
        }
    }
}

#[derive(Deserialize)]
struct ComposePsEntry {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Service")]
    service: String,
    #[serde(rename = "State")]
    state: String,
    #[serde(rename = "Health", default)]
    health: String,
    #[serde(rename = "Image")]
    image: String,
    #[serde(rename = "Publishers", default)]
    publishers: Vec<ComposePsPublisher>,
}

#[derive(Deserialize)]
struct ComposePsPublisher {
    #[serde(rename = "TargetPort")]
    target_port: u16,
    #[serde(rename = "PublishedPort", default)]
    published_port: u16,
    #[serde(rename = "Protocol")]
    protocol: String,
}

#[async_trait]
impl ComposeRunner for DockerComposeRunner {
    async fn compose_up(
        &self,
        cancel: &Shutdown,
        project_name: &str,
        compose_file: &Path,
        override_file: Option<&Path>,
        work_dir: Option<&Path>,
    ) -> Result<(), OrchestratorError> {
        let mut args = host_args(&self.socket);
        args.extend([
            "compose".to_string(),
            "-p".to_string(),
            project_name.to_string(),
        ]);
        if let Some(dir) = work_dir {
            args.extend([
                "--project-directory".to_string(),
                dir.display().to_string(),
            ]);
        }
        args.extend(["-f".to_string(), compose_file.display().to_string()]);
        if let Some(file) = override_file {
            args.extend(["-f".to_string(), file.display().to_string()]);
        }
        args.extend(["up".to_string(), "-d".to_string()]);

        self.runner
            .run(cancel, "docker", &args)
            .await
            .map(|_| ())
            .map_err(|source| OrchestratorError::Up { source })
    }

    async fn compose_down(
        &self,
        cancel: &Shutdown,
        project_name: &str,
    ) -> Result<(), OrchestratorError> {
        let mut args = host_args(&self.socket);
        args.extend([
            "compose".to_string(),
            "-p".to_string(),
            project_name.to_string(),
            "down".to_string(),
            "--remove-orphans".to_string(),
        ]);

        self.runner
            .run(cancel, "docker", &args)
            .await
            .map(|_| ())
            .map_err(|source| OrchestratorError::Down { source })
    }

    async fn compose_ps(
        &self,
        cancel: &Shutdown,
        project_name: &str,
    ) -> Result<Vec<ContainerInfo>, OrchestratorError> {
        let mut args = host_args(&self.socket);
        args.extend([
            "compose".to_string(),
            "-p".to_string(),
            project_name.to_string(),
            "ps".to_string(),
            "-a".to_string(),
            "--format".to_string(),
            "json".to_string(),
        ]);

        let out = self
            .runner
            .run(cancel, "docker", &args)
            .await
            .map_err(|source| OrchestratorError::Ps { source })?;

        // One JSON object per line.
        let mut containers = Vec::new();
        for line in out.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let entry: ComposePsEntry = match serde_json::from_str(line) {
                Ok(entry) => entry,
                Err(_) => continue,
            };

            let ports = entry
                .publishers
                .iter()
                .map(|p| {
                    if p.published_port > 0 {
                        format!("{}:{}/{}", p.published_port, p.target_port, p.protocol)
                    } else {
                        format!("{}/{}", p.target_port, p.protocol)
                    }
                })
                .collect::<Vec<_>>()
                .join(", ");

            let health = if entry.health.is_empty() {
                "none".to_string()
            } else {
                entry.health
            };

            containers.push(ContainerInfo {
                id: entry.id.chars().take(12).collect(),
                name: entry.name,
                service: entry.service,
                state: entry.state,
                health,
                image: entry.image,
                ports,
            });
        }
        Ok(containers)
    }
}

/// Scratch directory holding the compose file and label override for one
/// apply. The directory is removed when this value drops, on every exit path.
pub struct ScratchDir {
    _dir: TempDir,
    pub compose_file: PathBuf,
    pub override_file: PathBuf,
}

/// Writes the committed compose content and the generated override into a
/// fresh scratch directory, returning absolute paths for both.
pub fn write_scratch_dir(
    compose_file_name: &str,
    compose_content: &[u8],
    override_content: &str,
) -> std::io::Result<ScratchDir> {
    let dir = tempfile::Builder::new()
        .prefix("docker-cd-compose-")
        .tempdir()?;

    let compose_file = dir.path().join(compose_file_name);
    std::fs::write(&compose_file, compose_content)?;

    let override_file = dir.path().join("docker-cd-override.yml");
    std::fs::write(&override_file, override_content)?;

    Ok(ScratchDir {
        _dir: dir,
        compose_file,
        override_file,
    })
}

/// Generates a compose override document that injects the identity labels
/// under every service. Returns an empty string when no services are named.
pub fn generate_label_override(
    stack_path: &str,
    revision: &str,
    commit_message: &str,
    compose_hash: &str,
    service_names: &[String],
    now: &str,
) -> String {
    if service_names.is_empty() {
        return String::new();
    }

    let mut out = String::from("services:\n");
    for service in service_names {
        let _ = writeln!(out, "  {service}:");
        out.push_str("    labels:\n");
        let _ = writeln!(out, "      {LABEL_STACK_PATH}: \"{stack_path}\"");
        let _ = writeln!(out, "      {LABEL_DESIRED_REVISION}: \"{revision}\"");
        let _ = writeln!(
            out,
            "      {LABEL_DESIRED_COMMIT_MESSAGE}: \"{}\"",
            escape_yaml_value(commit_message)
        );
        let _ = writeln!(out, "      {LABEL_DESIRED_COMPOSE_HASH}: \"{compose_hash}\"");
        let _ = writeln!(out, "      {LABEL_SYNCED_AT}: \"{now}\"");
        let _ = writeln!(out, "      {LABEL_SYNC_AT}: \"{now}\"");
        let _ = writeln!(out, "      {LABEL_SYNC_STATUS}: \"synced\"");
    }
    out
}

/// Escapes a value for embedding in a double-quoted YAML scalar.
fn escape_yaml_value(value: &str) -> String {
    value.replace('"', "\\\"").replace('\n', " ")
}

/// Creates a compose project name from an optional prefix and a stack path:
/// path separators become dashes and the result is lowercased.
pub fn derive_project_name(prefix: &str, stack_path: &str) -> String {
    let sanitized = stack_path
        .replace(['/', '\\'], "-")
        .to_lowercase();
    if prefix.is_empty() {
        sanitized
    } else {
        format!("{prefix}-{sanitized}")
    }
}

/// Truncates an error message to at most 256 characters.
pub fn truncate_error(message: &str) -> String {
    const MAX_LEN: usize = 256;
    if message.chars().count() <= MAX_LEN {
        message.to_string()
    } else {
        message.chars().take(MAX_LEN).collect()
    }
}

/// Extracts the top-level service names from compose file content.
///
/// Line-based scan instead of a YAML parser: the first indented line after a
/// top-level `services:` key fixes the service indent level, and every line
/// at that level ending in `:` contributes a name. Tabs count as 4 spaces.
pub fn extract_service_names(content: &[u8]) -> Vec<String> {
    let text = String::from_utf8_lossy(content);
    let mut in_services = false;
    let mut service_indent: Option<usize> = None;
    let mut names = Vec::new();

    for raw in text.lines() {
        let line = raw.trim_end_matches([' ', '\t', '\r']);
        let stripped = line.trim_start_matches([' ', '\t']);

        if !in_services {
            if stripped == "services:" && count_indent(line) == 0 {
                in_services = true;
            }
            continue;
        }

        if stripped.is_empty() || stripped.starts_with('#') {
            continue;
        }

        let indent = count_indent(line);

        // Another top-level key ends the services block.
        if indent == 0 {
            break;
        }

        let expected = *service_indent.get_or_insert(indent);
        if indent == expected {
            if let Some(name) = stripped.strip_suffix(':') {
                if !name.is_empty() {
                    names.push(name.to_string());
                }
            }
        }
    }

    names
}

/// Effective indentation width of a line, with tabs as 4 spaces.
fn count_indent(line: &str) -> usize {
    let mut indent = 0;
    for ch in line.chars() {
        match ch {
            ' ' => indent += 1,
            '\t' => indent += 4,
            _ => break,
        }
    }
    indent
}
