/// Source-access failures, classified so callers and tests can tell an auth
/// problem from a missing ref. The original cause stays attached.
#[derive(Debug, thiserror::Error)]
pub enum GitError {
    #[error("repository URL must be HTTPS, got {0:?}")]
    InvalidUrl(String),
    #[error("failed to access repository: {source}")]
    AuthFailed {
        #[source]
        source: git2::Error,
    },
    #[error("revision {0:?} not found in remote refs")]
    RefNotFound(String),
    #[error("deploy directory {path:?} not found at revision {revision:?}")]
    PathNotFound { path: String, revision: String },
    #[error("repository validation timed out after {0} seconds")]
    Timeout(u64),
    #[error("git operation cancelled: shutting down")]
    Cancelled,
    #[error("git operation failed: {0}")]
    Git(#[from] git2::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl GitError {
    /// Maps a raw git2 error to the classified form.
    pub fn classify(source: git2::Error) -> Self {
        match source.code() {
            git2::ErrorCode::Auth | git2::ErrorCode::Certificate => GitError::AuthFailed { source },
            _ if source.class() == git2::ErrorClass::Http => GitError::AuthFailed { source },
            _ => GitError::Git(source),
        }
    }
}
