use std::fmt::Write as _;

const ASCII_ART: &str = r#"
 ____             _                ____ ____
|  _ \  ___   ___| | _____ _ __  / ___/ _  \
| | | |/ _ \ / __| |/ / _ \ '__|| |   | | | |
| |_| | (_) | (__|   <  __/ |   | |___| |_| |
|____/ \___/ \___|_|\_\___|_|    \____|____/
"#;

/// Non-secret repository details for display. The access token never
/// reaches this type.
pub struct RepoInfo {
    pub url: String,
    pub revision: String,
    pub deploy_dir: String,
}

/// Renders the plain-text status page.
pub fn status_page(project_name: &str, running_containers: usize, repo: Option<&RepoInfo>) -> String {
    let mut page = format!(
        "{ASCII_ART}\n  {project_name}\n  Running containers: {running_containers}\n"
    );

    if let Some(repo) = repo {
        let _ = writeln!(page, "  Repository: {}", repo.url);
        let _ = writeln!(page, "  Revision: {}", repo.revision);
        let deploy_dir = if repo.deploy_dir.is_empty() {
            "/"
        } else {
            &repo.deploy_dir
        };
        let _ = writeln!(page, "  Deploy dir: {deploy_dir}");
    }

    page
}
