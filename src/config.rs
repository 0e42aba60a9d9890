//! Environment-sourced runtime configuration.
//!
//! Invalid optional values fall back to their defaults; missing or invalid
//! required fields are collected into one combined error that aborts startup.

use std::time::Duration;

use crate::reconcile::DriftPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, thiserror::Error)]
#[error("invalid configuration: {}", errors.join("; "))]
pub struct ConfigError {
    pub errors: Vec<String>,
}

/// Runtime configuration for the agent.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub project_name: String,
    pub docker_socket: String,

    pub git_repo_url: String,
    pub git_access_token: String,
    pub git_revision: String,
    pub git_deploy_dir: String,

    pub webhook_secret: String,
    /// `None` disables periodic refreshes.
    pub refresh_poll_interval: Option<Duration>,

    pub reconcile_enabled: bool,
    pub reconcile_remove_enabled: bool,
    pub drift_policy: DriftPolicy,

    pub log_level: LogLevel,
    pub log_format: LogFormat,
}

impl Config {
    /// Reads configuration from the process environment.
    pub fn load() -> Result<Config, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads configuration from an arbitrary lookup, so tests can supply a
    /// map instead of mutating the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Config, ConfigError> {
        let get = |key: &str| lookup(key).filter(|value| !value.is_empty());

        let port = get("PORT")
            .and_then(|v| v.parse::<u16>().ok())
            .filter(|p| *p >= 1)
            .unwrap_or(8080);

        let project_name = get("PROJECT_NAME").unwrap_or_else(|| "Docker-CD".to_string());
        let docker_socket =
            get("DOCKER_SOCKET").unwrap_or_else(|| "/var/run/docker.sock".to_string());

        let git_repo_url = get("GIT_REPO_URL").unwrap_or_default();
        let git_access_token = get("GIT_ACCESS_TOKEN").unwrap_or_default();
        let git_revision = get("GIT_REVISION").unwrap_or_default();
        let git_deploy_dir = get("GIT_DEPLOY_DIR").unwrap_or_default();

        let webhook_secret = get("WEBHOOK_SECRET").unwrap_or_default();
        let refresh_poll_interval = get("REFRESH_POLL_INTERVAL")
            .and_then(|v| parse_duration(&v))
            .filter(|d| !d.is_zero());

        let reconcile_enabled = get("RECONCILE_ENABLED")
            .and_then(|v| parse_bool(&v))
            .unwrap_or(true);
        let reconcile_remove_enabled = get("RECONCILE_REMOVE_ENABLED")
            .and_then(|v| parse_bool(&v))
            .unwrap_or(false);

        let drift_policy = get("DRIFT_POLICY")
            .and_then(|v| match v.to_lowercase().as_str() {
                "revert" => Some(DriftPolicy::Revert),
                "flag" => Some(DriftPolicy::Flag),
                _ => None,
            })
            .unwrap_or_default();

        let log_level = get("LOG_LEVEL")
            .and_then(|v| match v.to_lowercase().as_str() {
                "debug" => Some(LogLevel::Debug),
                "info" => Some(LogLevel::Info),
                _ => None,
            })
            .unwrap_or_default();
        let log_format = get("LOG_FORMAT")
            .and_then(|v| match v.to_lowercase().as_str() {
                "text" => Some(LogFormat::Text),
                "json" => Some(LogFormat::Json),
                _ => None,
            })
            .unwrap_or_default();

        let mut errors = Vec::new();
        if git_repo_url.is_empty() {
            errors.push("GIT_REPO_URL is required".to_string());
        } else if !git_repo_url.to_lowercase().starts_with("https://") {
            errors.push(format!(
                "GIT_REPO_URL must be an HTTPS URL, got {git_repo_url:?}"
            ));
        }
        if git_access_token.is_empty() {
            errors.push("GIT_ACCESS_TOKEN is required".to_string());
        }
        if git_revision.is_empty() {
            errors.push("GIT_REVISION is required".to_string());
        }
        if !errors.is_empty() {
            return Err(ConfigError { errors });
        }

        Ok(Config {
            port,
            project_name,
            docker_socket,
            git_repo_url,
            git_access_token,
            git_revision,
            git_deploy_dir,
            webhook_secret,
            refresh_poll_interval,
            reconcile_enabled,
            reconcile_remove_enabled,
            drift_policy,
            log_level,
            log_format,
        })
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

/// Parses `90`, `90s`, `500ms`, `5m` or `1h` into a duration.
fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    let (number, unit): (&str, &str) = if let Some(v) = value.strip_suffix("ms") {
        (v, "ms")
    } else if let Some(v) = value.strip_suffix('s') {
        (v, "s")
    } else if let Some(v) = value.strip_suffix('m') {
        (v, "m")
    } else if let Some(v) = value.strip_suffix('h') {
        (v, "h")
    } else {
        (value, "s")
    };

    let number: u64 = number.trim().parse().ok()?;
    Some(match unit {
        "ms" => Duration::from_millis(number),
        "s" => Duration::from_secs(number),
        "m" => Duration::from_secs(number * 60),
        "h" => Duration::from_secs(number * 3600),
        _ => return None,
    })
}
