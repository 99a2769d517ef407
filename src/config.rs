//! Runtime configuration loaded from environment variables.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;

/// Settings for the release service and its collaborators.
#[derive(Clone, Debug)]
pub struct ReleaseConfig {
    /// SQLite database path (`RELEASE_REGISTRY_DB`).
    pub database_path: Option<PathBuf>,
    /// Registry snapshot file (`RELEASE_REGISTRY_SNAPSHOT`).
    pub snapshot_path: Option<PathBuf>,
    /// Prefix for entry URLs (`RELEASE_REGISTRY_CDN_BASE`).
    pub cdn_base_url: String,
    /// File appended to a version's storage path (`RELEASE_REGISTRY_ENTRY_FILE`).
    pub entry_file: String,
    /// Local artifact root (`RELEASE_REGISTRY_ARTIFACT_ROOT`). When unset,
    /// artifacts are probed over HTTP on the CDN.
    pub artifact_root: Option<PathBuf>,
    /// Upper bound on one artifact existence probe.
    pub artifact_timeout: Duration,
    /// How long audit entries are kept.
    pub audit_retention: chrono::Duration,
    /// Period of the background registry rebuild while serving.
    pub sync_interval: Duration,
    /// Actor → granted permissions. `None` allows everything.
    pub grants: Option<HashMap<String, Vec<String>>>,
    /// Webhook for release notifications (`RELEASE_REGISTRY_WEBHOOK`).
    pub webhook_url: Option<String>,
}

impl ReleaseConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let artifact_timeout = std::env::var("RELEASE_REGISTRY_ARTIFACT_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.artifact_timeout);

        let audit_retention = std::env::var("RELEASE_REGISTRY_AUDIT_RETENTION_DAYS")
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .map(chrono::Duration::days)
            .unwrap_or(defaults.audit_retention);

        let sync_interval = std::env::var("RELEASE_REGISTRY_SYNC_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(defaults.sync_interval);

        Self {
            database_path: std::env::var("RELEASE_REGISTRY_DB").ok().map(PathBuf::from),
            snapshot_path: std::env::var("RELEASE_REGISTRY_SNAPSHOT")
                .ok()
                .map(PathBuf::from),
            cdn_base_url: std::env::var("RELEASE_REGISTRY_CDN_BASE")
                .unwrap_or(defaults.cdn_base_url),
            entry_file: std::env::var("RELEASE_REGISTRY_ENTRY_FILE")
                .unwrap_or(defaults.entry_file),
            artifact_root: std::env::var("RELEASE_REGISTRY_ARTIFACT_ROOT")
                .ok()
                .map(PathBuf::from),
            artifact_timeout,
            audit_retention,
            sync_interval,
            grants: std::env::var("RELEASE_REGISTRY_GRANTS")
                .ok()
                .map(|s| parse_grants(&s)),
            webhook_url: std::env::var("RELEASE_REGISTRY_WEBHOOK").ok(),
        }
    }

    /// Resolved database path, falling back to the platform data directory.
    pub fn database_path(&self) -> Result<PathBuf> {
        match &self.database_path {
            Some(path) => Ok(path.clone()),
            None => Ok(data_dir()?.join("releases.db")),
        }
    }

    /// Resolved snapshot path, falling back to the platform data directory.
    pub fn snapshot_path(&self) -> Result<PathBuf> {
        match &self.snapshot_path {
            Some(path) => Ok(path.clone()),
            None => Ok(data_dir()?.join("registry.json")),
        }
    }
}

impl Default for ReleaseConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            snapshot_path: None,
            cdn_base_url: "https://cdn.example.com/games".to_string(),
            entry_file: "index.html".to_string(),
            artifact_root: None,
            artifact_timeout: Duration::from_secs(5),
            audit_retention: chrono::Duration::days(90),
            sync_interval: Duration::from_secs(300),
            grants: None,
            webhook_url: None,
        }
    }
}

fn data_dir() -> Result<PathBuf> {
    let dirs = directories::ProjectDirs::from("", "", "release-registry")
        .ok_or_else(|| anyhow::anyhow!("Could not determine data directory"))?;
    Ok(dirs.data_dir().to_path_buf())
}

/// Parse `alice=*;bob=release:submit,release:approve`.
fn parse_grants(s: &str) -> HashMap<String, Vec<String>> {
    s.split(';')
        .filter_map(|grant| {
            let (actor, perms) = grant.split_once('=')?;
            let actor = actor.trim();
            if actor.is_empty() {
                return None;
            }
            let perms = perms
                .split(',')
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect();
            Some((actor.to_string(), perms))
        })
        .collect()
}
