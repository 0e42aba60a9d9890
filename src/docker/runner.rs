use std::process::Stdio;

use async_trait::async_trait;

use crate::signals::Shutdown;

/// Failure of an external command.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} exited with status {code:?}: {output}")]
    Failed {
        program: String,
        code: Option<i32>,
        output: String,
    },
    #[error("{program} cancelled: shutting down")]
    Cancelled { program: String },
}

/// Abstracts command execution so callers can be tested without a Docker
/// daemon.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Executes a command and returns its combined stdout/stderr output.
    /// A non-zero exit status is an error carrying that output; cancellation
    /// kills the subprocess.
    async fn run(
        &self,
        cancel: &Shutdown,
        program: &str,
        args: &[String],
    ) -> Result<String, CommandError>;
}

/// Runs commands as real subprocesses.
pub struct ExecRunner;

#[async_trait]
impl CommandRunner for ExecRunner {
    async fn run(
        &self,
        cancel: &Shutdown,
        program: &str,
        args: &[String],
    ) -> Result<String, CommandError> {
        let mut command = tokio::process::Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Dropping the wait future must not leave the child running.
            .kill_on_drop(true);

        let child = command.spawn().map_err(|source| CommandError::Spawn {
            program: program.to_string(),
            source,
        })?;

        let output = tokio::select! {
            output = child.wait_with_output() => {
                output.map_err(|source| CommandError::Spawn {
                    program: program.to_string(),
                    source,
                })?
            }
            _ = cancel.cancelled() => {
                log::warn!("{program} killed by shutdown");
                return Err(CommandError::Cancelled {
                    program: program.to_string(),
                });
            }
        };

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        if output.status.success() {
            Ok(combined)
        } else {
            Err(CommandError::Failed {
                program: program.to_string(),
                code: output.status.code(),
                output: combined.trim().to_string(),
            })
        }
    }
}
