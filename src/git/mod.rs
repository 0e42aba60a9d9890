//! Source-of-truth access: reads compose stacks out of the remote Git
//! repository and validates repository access at startup.

use std::path::Path;

use async_trait::async_trait;

use crate::signals::Shutdown;
use crate::state::RefType;

mod errors;
mod validator;

pub use errors::GitError;
pub use validator::{classify_ref, validate_repository, VALIDATION_TIMEOUT_SECS};

/// Username used for token-based basic auth against the remote.
const TOKEN_USERNAME: &str = "x-access-token";

/// Compose files looked for in each stack directory, in preference order.
const COMPOSE_FILE_NAMES: [&str; 2] = ["docker-compose.yml", "docker-compose.yaml"];

/// A compose file found in the repository.
#[derive(Debug, Clone)]
pub struct ComposeEntry {
    /// Directory containing the compose file, relative to the deploy dir.
    pub stack_path: String,
    /// The compose file name within the stack directory.
    pub compose_file: String,
    /// Raw compose file content.
    pub content: Vec<u8>,
}

/// Everything one refresh reads from the repository.
#[derive(Debug, Clone)]
pub struct RepoContents {
    pub entries: Vec<ComposeEntry>,
    /// Resolved commit hash.
    pub revision: String,
    pub commit_message: String,
    pub ref_type: RefType,
}

/// Produces the stack definitions at the configured revision.
#[async_trait]
pub trait ComposeReader: Send + Sync {
    async fn read_compose_files(
        &self,
        cancel: &Shutdown,
        repo_url: &str,
        token: &str,
        revision: &str,
        deploy_dir: &str,
    ) -> Result<RepoContents, GitError>;
}

/// [`ComposeReader`] backed by git2: a shallow fetch of the single configured
/// reference into a scratch repository, then a tree scan without a checkout.
pub struct GitComposeReader;

#[async_trait]
impl ComposeReader for GitComposeReader {
    async fn read_compose_files(
        &self,
        cancel: &Shutdown,
        repo_url: &str,
        token: &str,
        revision: &str,
        deploy_dir: &str,
    ) -> Result<RepoContents, GitError> {
        let repo_url = repo_url.to_string();
        let token = token.to_string();
        let revision = revision.to_string();
        let deploy_dir = deploy_dir.to_string();
        let cancel_inner = cancel.clone();

        // git2 is blocking; keep it off the async workers. The transfer
        // callbacks watch the token so the fetch aborts on shutdown.
        let task = tokio::task::spawn_blocking(move || {
            fetch_and_scan(&cancel_inner, &repo_url, &token, &revision, &deploy_dir)
        });

        tokio::select! {
            result = task => result.map_err(|e| {
                GitError::Io(std::io::Error::other(format!("fetch task failed: {e}")))
            })?,
            _ = cancel.cancelled() => Err(GitError::Cancelled),
        }
    }
}

fn auth_callbacks<'cb>(token: &'cb str, cancel: &Shutdown) -> git2::RemoteCallbacks<'cb> {
    let mut callbacks = git2::RemoteCallbacks::new();
    callbacks.credentials(move |_url, _username, _allowed| {
        git2::Cred::userpass_plaintext(TOKEN_USERNAME, token)
    });
    // Returning false aborts the transfer; checked on every progress tick.
    let cancel = cancel.clone();
    callbacks.transfer_progress(move |_progress| !cancel.is_cancelled());
    callbacks
}

fn fetch_and_scan(
    cancel: &Shutdown,
    repo_url: &str,
    token: &str,
    revision: &str,
    deploy_dir: &str,
) -> Result<RepoContents, GitError> {
    let scratch = tempfile::Builder::new().prefix("docker-cd-git-").tempdir()?;
    let repo = git2::Repository::init(scratch.path())?;

    let mut remote = repo.remote_anonymous(repo_url)?;
    let ref_names: Vec<String> = {
        let connection = remote
            .connect_auth(
                git2::Direction::Fetch,
                Some(auth_callbacks(token, cancel)),
                None,
            )
            .map_err(GitError::classify)?;
        connection
            .list()
            .map_err(GitError::classify)?
            .iter()
            .map(|head| head.name().to_string())
            .collect()
    };
    let (refspec, ref_type) =
        classify_ref(&ref_names, revision).ok_or_else(|| GitError::RefNotFound(revision.to_string()))?;

    if cancel.is_cancelled() {
        return Err(GitError::Cancelled);
    }

    let mut fetch_options = git2::FetchOptions::new();
    fetch_options.remote_callbacks(auth_callbacks(token, cancel));
    fetch_options.depth(1);
    remote
        .fetch(&[refspec.as_str()], Some(&mut fetch_options), None)
        .map_err(GitError::classify)?;

    let fetch_head = repo.find_reference("FETCH_HEAD")?;
    let commit = fetch_head.peel_to_commit()?;

    let contents = scan_commit(&repo, &commit, deploy_dir, revision)?;
    Ok(RepoContents {
        ref_type,
        ..contents
    })
}

/// Scans the immediate subdirectories of the deploy dir in the commit's tree
/// for compose files. No checkout is needed; blobs are read directly.
fn scan_commit(
    repo: &git2::Repository,
    commit: &git2::Commit<'_>,
    deploy_dir: &str,
    revision: &str,
) -> Result<RepoContents, GitError> {
    let root = commit.tree()?;

    let deploy_dir = deploy_dir.trim_matches('/');
    let tree = if deploy_dir.is_empty() {
        root
    } else {
        let entry = root
            .get_path(Path::new(deploy_dir))
            .map_err(|_| GitError::PathNotFound {
                path: deploy_dir.to_string(),
                revision: revision.to_string(),
            })?;
        entry
            .to_object(repo)?
            .peel_to_tree()
            .map_err(|_| GitError::PathNotFound {
                path: deploy_dir.to_string(),
                revision: revision.to_string(),
            })?
    };

    let mut entries = Vec::new();
    for item in tree.iter() {
        if item.kind() != Some(git2::ObjectType::Tree) {
            continue;
        }
        let Some(name) = item.name() else {
            continue;
        };
        let subtree = item.to_object(repo)?.peel_to_tree()?;

        let Some((compose_file, content)) = find_compose_file(repo, &subtree) else {
            continue;
        };
        entries.push(ComposeEntry {
            stack_path: name.to_string(),
            compose_file,
            content,
        });
    }

    Ok(RepoContents {
        entries,
        revision: commit.id().to_string(),
        commit_message: commit.message().unwrap_or("").trim_end().to_string(),
        ref_type: RefType::Branch,
    })
}

/// Looks for a compose file in a stack tree, preferring `.yml` over `.yaml`.
fn find_compose_file(repo: &git2::Repository, tree: &git2::Tree<'_>) -> Option<(String, Vec<u8>)> {
    for name in COMPOSE_FILE_NAMES {
        let Some(entry) = tree.get_name(name) else {
            continue;
        };
        let Ok(blob) = repo.find_blob(entry.id()) else {
            continue;
        };
        return Some((name.to_string(), blob.content().to_vec()));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Builds a bare-bones repository with the given files committed on the
    /// default branch, returning the repo and the commit id.
    fn seed_repo(files: &[(&str, &str)]) -> (TempDir, git2::Repository, git2::Oid) {
        let dir = TempDir::new().unwrap();
        let repo = git2::Repository::init(dir.path()).unwrap();

        {
            let mut index = repo.index().unwrap();
            for (path, content) in files {
                let full = dir.path().join(path);
                std::fs::create_dir_all(full.parent().unwrap()).unwrap();
                std::fs::write(&full, content).unwrap();
                index.add_path(Path::new(path)).unwrap();
            }
            index.write().unwrap();

            let tree_id = index.write_tree().unwrap();
            let tree = repo.find_tree(tree_id).unwrap();
            let sig = git2::Signature::now("tester", "tester@example.com").unwrap();
            repo.commit(Some("HEAD"), &sig, &sig, "initial deploy", &tree, &[])
                .unwrap();
        }

        let commit_id = repo.head().unwrap().target().unwrap();
        (dir, repo, commit_id)
    }

    #[test]
    fn scans_immediate_subdirectories_for_compose_files() {
        let (_dir, repo, commit_id) = seed_repo(&[
            ("myapp/docker-compose.yml", "services:\n  web:\n    image: nginx\n"),
            ("other/docker-compose.yaml", "services:\n  api:\n    image: node\n"),
            ("no-compose/README.md", "nothing here"),
            ("top-level-file.txt", "skipped"),
        ]);
        let commit = repo.find_commit(commit_id).unwrap();

        let contents = scan_commit(&repo, &commit, "", "main").unwrap();
        assert_eq!(contents.revision, commit_id.to_string());
        assert_eq!(contents.commit_message, "initial deploy");

        let paths: Vec<&str> = contents.entries.iter().map(|e| e.stack_path.as_str()).collect();
        assert_eq!(paths, vec!["myapp", "other"]);
        assert_eq!(contents.entries[0].compose_file, "docker-compose.yml");
        assert_eq!(contents.entries[1].compose_file, "docker-compose.yaml");
        assert!(contents.entries[0].content.starts_with(b"services:"));
    }

    #[test]
    fn yml_preferred_over_yaml() {
        let (_dir, repo, commit_id) = seed_repo(&[
            ("app/docker-compose.yml", "services:\n  a:\n    image: x\n"),
            ("app/docker-compose.yaml", "services:\n  b:\n    image: y\n"),
        ]);
        let commit = repo.find_commit(commit_id).unwrap();

        let contents = scan_commit(&repo, &commit, "", "main").unwrap();
        assert_eq!(contents.entries.len(), 1);
        assert_eq!(contents.entries[0].compose_file, "docker-compose.yml");
    }

    #[test]
    fn deploy_dir_restricts_discovery() {
        let (_dir, repo, commit_id) = seed_repo(&[
            ("deploy/myapp/docker-compose.yml", "services:\n  web:\n    image: nginx\n"),
            ("elsewhere/docker-compose.yml", "services:\n  x:\n    image: y\n"),
        ]);
        let commit = repo.find_commit(commit_id).unwrap();

        let contents = scan_commit(&repo, &commit, "deploy/", "main").unwrap();
        assert_eq!(contents.entries.len(), 1);
        assert_eq!(contents.entries[0].stack_path, "myapp");
    }

    #[test]
    fn missing_deploy_dir_is_path_not_found() {
        let (_dir, repo, commit_id) =
            seed_repo(&[("app/docker-compose.yml", "services:\n  a:\n    image: x\n")]);
        let commit = repo.find_commit(commit_id).unwrap();

        let err = scan_commit(&repo, &commit, "does-not-exist", "main").unwrap_err();
        assert!(matches!(err, GitError::PathNotFound { .. }));
    }
}
