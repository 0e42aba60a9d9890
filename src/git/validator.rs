//! Read-only startup validation of the source repository: the URL is HTTPS,
//! the token grants read access, and the configured revision exists.

use std::time::Duration;

use crate::signals::Shutdown;
use crate::state::RefType;

use super::{auth_callbacks, GitError};

pub const VALIDATION_TIMEOUT_SECS: u64 = 10;

/// Matches a configured revision against the advertised remote refs and
/// returns the refspec to fetch plus the actual reference type. Branches win
/// over tags when both exist under the same name.
pub fn classify_ref(ref_names: &[String], revision: &str) -> Option<(String, RefType)> {
    if let Some(name) = ref_names.iter().find(|name| *name == revision) {
        let ref_type = if name.starts_with("refs/tags/") {
            RefType::Tag
        } else {
            RefType::Branch
        };
        return Some((name.clone(), ref_type));
    }

    let branch_ref = format!("refs/heads/{revision}");
    if ref_names.contains(&branch_ref) {
        return Some((branch_ref, RefType::Branch));
    }
    let tag_ref = format!("refs/tags/{revision}");
    if ref_names.contains(&tag_ref) {
        return Some((tag_ref, RefType::Tag));
    }
    None
}

/// Validates repository access with a bounded `ls-remote`. Returns the
/// reference type the revision resolved to.
pub async fn validate_repository(
    cancel: &Shutdown,
    repo_url: &str,
    token: &str,
    revision: &str,
) -> Result<RefType, GitError> {
    if !repo_url.to_lowercase().starts_with("https://") {
        return Err(GitError::InvalidUrl(repo_url.to_string()));
    }

    let repo_url = repo_url.to_string();
    let token = token.to_string();
    let revision_owned = revision.to_string();
    let cancel_inner = cancel.clone();

    let check = tokio::task::spawn_blocking(move || -> Result<RefType, GitError> {
        let ref_names = list_remote_refs(&cancel_inner, &repo_url, &token)?;
        classify_ref(&ref_names, &revision_owned)
            .map(|(_, ref_type)| ref_type)
            .ok_or(GitError::RefNotFound(revision_owned))
    });

    let bounded = tokio::time::timeout(Duration::from_secs(VALIDATION_TIMEOUT_SECS), check);
    tokio::select! {
        result = bounded => match result {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(GitError::Io(std::io::Error::other(format!(
                "validation task failed: {e}"
            )))),
            Err(_) => Err(GitError::Timeout(VALIDATION_TIMEOUT_SECS)),
        },
        _ = cancel.cancelled() => Err(GitError::Cancelled),
    }
}

fn list_remote_refs(cancel: &Shutdown, repo_url: &str, token: &str) -> Result<Vec<String>, GitError> {
    let mut remote = git2::Remote::create_detached(repo_url)?;
    let connection = remote
        .connect_auth(
            git2::Direction::Fetch,
            Some(auth_callbacks(token, cancel)),
            None,
        )
        .map_err(GitError::classify)?;
    Ok(connection
        .list()
        .map_err(GitError::classify)?
        .iter()
        .map(|head| head.name().to_string())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn refs(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn branch_revision_resolves_to_branch() {
        let names = refs(&["HEAD", "refs/heads/main", "refs/tags/v1.0.0"]);
        let (refspec, ref_type) = classify_ref(&names, "main").unwrap();
        assert_eq!(refspec, "refs/heads/main");
        assert_eq!(ref_type, RefType::Branch);
    }

    #[test]
    fn tag_revision_resolves_to_tag() {
        let names = refs(&["HEAD", "refs/heads/main", "refs/tags/v1.0.0"]);
        let (refspec, ref_type) = classify_ref(&names, "v1.0.0").unwrap();
        assert_eq!(refspec, "refs/tags/v1.0.0");
        assert_eq!(ref_type, RefType::Tag);
    }

    #[test]
    fn branch_wins_when_branch_and_tag_share_a_name() {
        let names = refs(&["refs/heads/release", "refs/tags/release"]);
        let (_, ref_type) = classify_ref(&names, "release").unwrap();
        assert_eq!(ref_type, RefType::Branch);
    }

    #[test]
    fn full_ref_names_pass_through() {
        let names = refs(&["refs/heads/main", "refs/tags/v2"]);
        let (refspec, ref_type) = classify_ref(&names, "refs/tags/v2").unwrap();
        assert_eq!(refspec, "refs/tags/v2");
        assert_eq!(ref_type, RefType::Tag);
    }

    #[test]
    fn unknown_revision_is_none() {
        let names = refs(&["refs/heads/main"]);
        assert!(classify_ref(&names, "does-not-exist").is_none());
    }

    #[tokio::test]
    async fn non_https_url_rejected() {
        let err = validate_repository(
            &Shutdown::none(),
            "http://example.com/repo.git",
            "token",
            "main",
        )
        .await
        .unwrap_err();
        assert!(matches!(err, GitError::InvalidUrl(_)));

        let err = validate_repository(&Shutdown::none(), "git@github.com:o/r.git", "token", "main")
            .await
            .unwrap_err();
        assert!(matches!(err, GitError::InvalidUrl(_)));
    }
}
