//! Interfaces to systems the release pipeline consults but does not own.
//!
//! - [`ArtifactStore`]: does a build exist at a storage path?
//! - [`PermissionCheck`]: may this actor perform this action?
//! - [`NotificationService`]: tell a game's owner something happened.

use std::collections::{HashMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use crate::registry::entry_url;

/// Existence checks for uploaded build artifacts.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Whether the build at `storage_path` is present. Errors mean the store
    /// could not be asked, not that the artifact is missing.
    async fn exists(&self, storage_path: &str) -> Result<bool>;
}

/// Probes the CDN with a `HEAD` request for the version's entry file.
#[derive(Debug, Clone)]
pub struct HttpArtifactStore {
    base_url: String,
    entry_file: String,
    client: Client,
}

impl HttpArtifactStore {
    pub fn new(base_url: impl Into<String>, entry_file: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            entry_file: entry_file.into(),
            client: Client::new(),
        }
    }
}

#[async_trait]
impl ArtifactStore for HttpArtifactStore {
    async fn exists(&self, storage_path: &str) -> Result<bool> {
        let url = entry_url(&self.base_url, storage_path, &self.entry_file);
        let response = self.client.head(&url).send().await?;

        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND | StatusCode::GONE => Ok(false),
            status => anyhow::bail!("artifact probe for {} returned {}", url, status),
        }
    }
}

/// Looks for the entry file under a local directory tree.
#[derive(Debug, Clone)]
pub struct LocalArtifactStore {
    root: PathBuf,
    entry_file: String,
}

impl LocalArtifactStore {
    pub fn new(root: impl Into<PathBuf>, entry_file: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            entry_file: entry_file.into(),
        }
    }
}

#[async_trait]
impl ArtifactStore for LocalArtifactStore {
    async fn exists(&self, storage_path: &str) -> Result<bool> {
        let relative = Path::new(storage_path.trim_start_matches('/'));
        // Never resolve outside the artifact root.
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            tracing::warn!("Rejected artifact path outside root: {}", storage_path);
            return Ok(false);
        }

        let candidate = self.root.join(relative).join(&self.entry_file);
        Ok(tokio::fs::try_exists(&candidate).await?)
    }
}

/// In-process artifact store for local runs and tests.
#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    paths: Mutex<HashSet<String>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, storage_path: impl Into<String>) {
        self.paths
            .lock()
            .expect("artifact store lock poisoned")
            .insert(storage_path.into());
    }

    pub fn remove(&self, storage_path: &str) {
        self.paths
            .lock()
            .expect("artifact store lock poisoned")
            .remove(storage_path);
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn exists(&self, storage_path: &str) -> Result<bool> {
        Ok(self
            .paths
            .lock()
            .expect("artifact store lock poisoned")
            .contains(storage_path))
    }
}

/// Capability lookup. Permission strings look like `release:publish`.
pub trait PermissionCheck: Send + Sync {
    fn allows(&self, actor_id: &str, permission: &str) -> bool;
}

/// Grants everything. Used when no grant table is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl PermissionCheck for AllowAll {
    fn allows(&self, _actor_id: &str, _permission: &str) -> bool {
        true
    }
}

/// Static actor → permission grants. `*` grants everything.
#[derive(Debug, Clone, Default)]
pub struct GrantTable {
    grants: HashMap<String, HashSet<String>>,
}

impl GrantTable {
    pub fn new(grants: HashMap<String, Vec<String>>) -> Self {
        Self {
            grants: grants
                .into_iter()
                .map(|(actor, perms)| (actor, perms.into_iter().collect()))
                .collect(),
        }
    }
}

impl PermissionCheck for GrantTable {
    fn allows(&self, actor_id: &str, permission: &str) -> bool {
        self.grants
            .get(actor_id)
            .is_some_and(|perms| perms.contains("*") || perms.contains(permission))
    }
}

/// What a game owner is told about.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReleaseNotification {
    pub game_slug: String,
    pub version: String,
    pub action: String,
    pub status: String,
    pub actor_id: String,
    pub occurred_at: DateTime<Utc>,
}

/// Delivers notifications to game owners. Callers never wait on delivery.
#[async_trait]
pub trait NotificationService: Send + Sync {
    async fn notify(&self, owner_id: &str, event: &ReleaseNotification) -> Result<()>;
}

/// Writes notifications to the log only.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl NotificationService for LogNotifier {
    async fn notify(&self, owner_id: &str, event: &ReleaseNotification) -> Result<()> {
        tracing::info!(
            owner = owner_id,
            game = %event.game_slug,
            version = %event.version,
            "Release notification: {} -> {}",
            event.action,
            event.status
        );
        Ok(())
    }
}

/// Posts notifications as JSON to a webhook.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    url: String,
    client: Client,
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    owner_id: &'a str,
    #[serde(flatten)]
    event: &'a ReleaseNotification,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: Client::new(),
        }
    }
}

#[async_trait]
impl NotificationService for WebhookNotifier {
    async fn notify(&self, owner_id: &str, event: &ReleaseNotification) -> Result<()> {
        self.client
            .post(&self.url)
            .json(&WebhookPayload { owner_id, event })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}
