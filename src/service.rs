//! Release orchestration.
//!
//! [`ReleaseService`] is the write path for games and versions. A transition
//! is applied in a fixed order:
//!
//! 1. permission check
//! 2. load version and game, pick the rule, probe the artifact store if the
//!    rule asks for it
//! 3. conditional status write; the game's live pointer moves in the same
//!    transaction (set on `publish`/`republish`, cleared when the live version
//!    leaves `published`)
//! 4. audit, notify, and rebuild the registry if visibility changed
//!
//! Step 4 never fails the transition. Registry rebuild errors are logged and
//! the previous snapshot stays in place until the next trigger or scheduled
//! sync.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use crate::audit::AuditSink;
use crate::collaborators::{
    AllowAll, ArtifactStore, GrantTable, HttpArtifactStore, LocalArtifactStore, LogNotifier,
    NotificationService, PermissionCheck, ReleaseNotification, WebhookNotifier,
};
use crate::config::ReleaseConfig;
use crate::db::Database;
use crate::error::{ReleaseError, Result};
use crate::models::*;
use crate::pipeline::{ReleaseAction, StateMachine, TransitionFacts};
use crate::registry::RegistrySync;
use crate::rollout;

/// External systems the service consults.
#[derive(Clone)]
pub struct Collaborators {
    pub artifacts: Arc<dyn ArtifactStore>,
    pub permissions: Arc<dyn PermissionCheck>,
    pub notifier: Arc<dyn NotificationService>,
}

impl Collaborators {
    pub fn from_config(config: &ReleaseConfig) -> Self {
        let artifacts: Arc<dyn ArtifactStore> = match &config.artifact_root {
            Some(root) => Arc::new(LocalArtifactStore::new(root, &config.entry_file)),
            None => Arc::new(HttpArtifactStore::new(
                &config.cdn_base_url,
                &config.entry_file,
            )),
        };

        let permissions: Arc<dyn PermissionCheck> = match &config.grants {
            Some(grants) => Arc::new(GrantTable::new(grants.clone())),
            None => Arc::new(AllowAll),
        };

        let notifier: Arc<dyn NotificationService> = match &config.webhook_url {
            Some(url) => Arc::new(WebhookNotifier::new(url)),
            None => Arc::new(LogNotifier),
        };

        Self {
            artifacts,
            permissions,
            notifier,
        }
    }
}

pub struct ReleaseService {
    db: Database,
    machine: StateMachine,
    registry: Arc<RegistrySync>,
    audit: AuditSink,
    collaborators: Collaborators,
    artifact_timeout: Duration,
}

impl ReleaseService {
    pub fn new(
        db: Database,
        machine: StateMachine,
        registry: Arc<RegistrySync>,
        audit: AuditSink,
        collaborators: Collaborators,
        config: &ReleaseConfig,
    ) -> Self {
        Self {
            db,
            machine,
            registry,
            audit,
            collaborators,
            artifact_timeout: config.artifact_timeout,
        }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn registry(&self) -> &RegistrySync {
        &self.registry
    }

    pub fn audit(&self) -> &AuditSink {
        &self.audit
    }

    // ============================================================
    // State machine queries
    // ============================================================

    pub fn can_transition(&self, status: VersionStatus, action: ReleaseAction) -> bool {
        self.machine.can_transition(status, action)
    }

    pub fn valid_actions(&self, status: VersionStatus) -> Vec<ReleaseAction> {
        self.machine.valid_actions(status)
    }

    // ============================================================
    // Transitions
    // ============================================================

    /// Apply `action` to a version on behalf of `actor_id`.
    pub async fn transition(
        &self,
        version_id: Uuid,
        action: ReleaseAction,
        actor_id: &str,
    ) -> Result<Version> {
        self.authorize(actor_id, &action.permission())?;

        let version = self.load_version(version_id)?;
        let game = self.load_game(version.game_id)?;

        let rule = self.machine.rule_for(version.status, action)?;
        let artifact_present = match &rule.precondition {
            Some(precondition) if precondition.probes_artifact() => {
                Some(self.probe_artifact(&version.storage_path).await?)
            }
            _ => None,
        };

        let facts = TransitionFacts {
            version: &version,
            game: &game,
            artifact_present,
        };
        let next = self.machine.evaluate(action, &facts)?;

        let Some(updated) = self
            .db
            .update_version_status(version.id, version.status, next)?
        else {
            return Err(self.lost_race(version_id, action)?);
        };

        tracing::info!(
            game = %game.slug,
            version = %updated.version,
            actor = actor_id,
            "{}: {} -> {}",
            action,
            version.status,
            updated.status
        );

        self.audit.record(AuditEvent::version(
            actor_id,
            action.as_str(),
            updated.id,
            Some(version.status.to_string()),
            Some(updated.status.to_string()),
        ));
        self.notify_owner(&game, &updated, action.as_str(), actor_id);

        if action.affects_registry() {
            self.refresh_registry().await;
        }

        Ok(updated)
    }

    /// Explain a failed conditional write: if the version moved to a status the
    /// action no longer applies to, that is an invalid transition; otherwise a
    /// plain conflict.
    fn lost_race(&self, version_id: Uuid, action: ReleaseAction) -> Result<ReleaseError> {
        let current = self.load_version(version_id)?;
        if self.machine.can_transition(current.status, action) {
            Ok(ReleaseError::Conflict(format!(
                "version {} changed status concurrently",
                version_id
            )))
        } else {
            Ok(ReleaseError::InvalidTransition {
                action,
                status: current.status,
                valid: self.machine.valid_actions(current.status),
            })
        }
    }

    async fn probe_artifact(&self, storage_path: &str) -> Result<bool> {
        let probe = self.collaborators.artifacts.exists(storage_path);
        match tokio::time::timeout(self.artifact_timeout, probe).await {
            Ok(Ok(present)) => Ok(present),
            Ok(Err(e)) => {
                tracing::warn!("Artifact check for {} failed: {:#}", storage_path, e);
                Err(ReleaseError::PreconditionFailed(format!(
                    "artifact check for {} failed: {}",
                    storage_path, e
                )))
            }
            Err(_) => {
                tracing::warn!(
                    "Artifact check for {} timed out after {:?}",
                    storage_path,
                    self.artifact_timeout
                );
                Err(ReleaseError::PreconditionFailed(format!(
                    "artifact check for {} timed out",
                    storage_path
                )))
            }
        }
    }

    // ============================================================
    // Game operations
    // ============================================================

    pub fn list_games(&self) -> Result<Vec<Game>> {
        Ok(self.db.get_all_games()?)
    }

    pub fn get_game(&self, id: Uuid) -> Result<Game> {
        self.load_game(id)
    }

    pub fn create_game(&self, input: CreateGameInput, actor_id: &str) -> Result<Game> {
        self.authorize(actor_id, "game:create")?;
        let game = self.db.create_game(input)?;
        self.audit.record(AuditEvent::game(actor_id, "create_game", game.id));
        Ok(game)
    }

    /// Patch descriptive fields and refresh the game's registry entry.
    pub fn update_game(&self, id: Uuid, input: UpdateGameInput, actor_id: &str) -> Result<Game> {
        self.authorize(actor_id, "game:update")?;
        self.load_game(id)?;

        let game = self
            .db
            .update_game(id, input)?
            .ok_or_else(|| ReleaseError::not_found("game", id))?;
        self.audit.record(AuditEvent::game(actor_id, "update_game", id));

        self.refresh_entry(&game);
        Ok(game)
    }

    /// Flip the kill-switch. Version statuses are untouched.
    pub async fn set_disabled(&self, id: Uuid, disabled: bool, actor_id: &str) -> Result<Game> {
        let permission = if disabled { "game:disable" } else { "game:enable" };
        self.authorize(actor_id, permission)?;

        let game = self
            .db
            .set_game_disabled(id, disabled)?
            .ok_or_else(|| ReleaseError::not_found("game", id))?;

        self.audit.record(AuditEvent::game(
            actor_id,
            if disabled { "disable" } else { "enable" },
            id,
        ));
        self.refresh_registry().await;
        Ok(game)
    }

    pub fn update_rollout(&self, id: Uuid, percentage: u8, actor_id: &str) -> Result<Game> {
        self.authorize(actor_id, "game:rollout")?;

        let game = self
            .db
            .set_rollout_percentage(id, percentage)?
            .ok_or_else(|| ReleaseError::not_found("game", id))?;

        let mut event = AuditEvent::game(actor_id, "update_rollout", id);
        event.after_status = Some(percentage.to_string());
        self.audit.record(event);

        self.refresh_entry(&game);
        Ok(game)
    }

    /// Take a game offline by clearing its live pointer.
    pub async fn reset(&self, id: Uuid, actor_id: &str) -> Result<Game> {
        self.authorize(actor_id, "game:reset")?;

        let game = self
            .db
            .clear_live_version(id)?
            .ok_or_else(|| ReleaseError::not_found("game", id))?;

        self.audit.record(AuditEvent::game(actor_id, "reset", id));
        self.refresh_registry().await;
        Ok(game)
    }

    /// Make an already-published version of the game live again.
    pub async fn activate(&self, game_id: Uuid, version_id: Uuid, actor_id: &str) -> Result<Game> {
        self.authorize(actor_id, "game:activate")?;

        let game = self.load_game(game_id)?;
        let version = self.load_version(version_id)?;

        if version.game_id != game.id {
            return Err(ReleaseError::Validation(format!(
                "version {} does not belong to game {}",
                version_id, game.slug
            )));
        }
        if version.status != VersionStatus::Published {
            return Err(ReleaseError::PreconditionFailed(format!(
                "version {} is {}, only published versions can go live",
                version.version, version.status
            )));
        }
        if !self.db.set_live_version(game_id, version_id)? {
            return Err(ReleaseError::Conflict(format!(
                "version {} changed before it could go live",
                version.version
            )));
        }

        let mut event = AuditEvent::game(actor_id, "activate", game_id);
        event.before_status = game.live_version_id.map(|id| id.to_string());
        event.after_status = Some(version_id.to_string());
        self.audit.record(event);

        self.refresh_registry().await;
        self.load_game(game_id)
    }

    /// Soft-delete a game and drop it from the registry.
    pub fn delete_game(&self, id: Uuid, actor_id: &str) -> Result<()> {
        self.authorize(actor_id, "game:delete")?;
        let game = self.load_game(id)?;

        if !self.db.delete_game(id)? {
            return Err(ReleaseError::not_found("game", id));
        }
        self.audit.record(AuditEvent::game(actor_id, "delete_game", id));

        if let Err(e) = self.registry.remove_entry(&game.slug) {
            tracing::warn!(game = %game.slug, "Registry entry removal failed: {}", e);
        }
        Ok(())
    }

    // ============================================================
    // Version operations
    // ============================================================

    pub fn list_versions(&self, game_id: Uuid) -> Result<Vec<Version>> {
        self.load_game(game_id)?;
        Ok(self.db.get_versions_by_game(game_id)?)
    }

    pub fn get_version(&self, id: Uuid) -> Result<Version> {
        self.load_version(id)
    }

    pub fn create_version(
        &self,
        game_id: Uuid,
        input: CreateVersionInput,
        actor_id: &str,
    ) -> Result<Version> {
        self.authorize(actor_id, "version:create")?;
        let version = self.db.create_version(game_id, input)?;

        self.audit.record(AuditEvent::version(
            actor_id,
            "create_version",
            version.id,
            None,
            Some(version.status.to_string()),
        ));
        Ok(version)
    }

    /// Patch metadata of a version that is still editable.
    pub fn update_version(
        &self,
        id: Uuid,
        input: UpdateVersionInput,
        actor_id: &str,
    ) -> Result<Version> {
        self.authorize(actor_id, "version:update")?;
        let version = self.load_version(id)?;

        if !version.status.is_editable() {
            return Err(ReleaseError::Validation(format!(
                "version {} is {} and can no longer be edited",
                version.version, version.status
            )));
        }

        let updated = self
            .db
            .update_version_metadata(id, version.status, input)?
            .ok_or_else(|| {
                ReleaseError::Conflict(format!("version {} changed while editing", id))
            })?;

        self.audit.record(AuditEvent::version(
            actor_id,
            "update_version",
            id,
            None,
            None,
        ));
        Ok(updated)
    }

    /// Soft-delete a version. Deleting the live version takes the game offline.
    pub async fn delete_version(&self, id: Uuid, actor_id: &str) -> Result<()> {
        self.authorize(actor_id, "version:delete")?;
        let version = self.load_version(id)?;
        let was_live = self
            .db
            .get_game(version.game_id)?
            .is_some_and(|game| game.live_version_id == Some(id));

        if !self.db.delete_version(id)? {
            return Err(ReleaseError::not_found("version", id));
        }

        self.audit.record(AuditEvent::version(
            actor_id,
            "delete_version",
            id,
            Some(version.status.to_string()),
            None,
        ));

        if was_live {
            self.refresh_registry().await;
        }
        Ok(())
    }

    // ============================================================
    // Registry and audit reads
    // ============================================================

    /// Rebuild the registry now. Unlike the rebuilds triggered by actions,
    /// failures are returned to the caller.
    pub async fn sync_registry(&self) -> Result<RegistrySnapshot> {
        let registry = Arc::clone(&self.registry);
        tokio::task::spawn_blocking(move || registry.sync())
            .await
            .map_err(|e| ReleaseError::StorageUnavailable(format!("sync task failed: {}", e)))?
    }

    /// Operator-requested rebuild.
    pub async fn request_sync(&self, actor_id: &str) -> Result<RegistrySnapshot> {
        self.authorize(actor_id, "registry:sync")?;
        tracing::info!(actor = actor_id, "Manual registry sync requested");
        self.sync_registry().await
    }

    pub fn registry_snapshot(&self) -> RegistrySnapshot {
        self.registry.snapshot()
    }

    /// The entries `consumer_id` sees after rollout filtering.
    pub fn registry_for_consumer(&self, consumer_id: &str) -> Vec<RegistryEntry> {
        let snapshot = self.registry.snapshot();
        rollout::get_for_consumer(&snapshot, consumer_id)
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn audit_log(&self, query: &AuditQuery) -> Result<Vec<AuditEntry>> {
        Ok(self.db.query_audit(query)?)
    }

    // ============================================================
    // Helpers
    // ============================================================

    fn authorize(&self, actor_id: &str, permission: &str) -> Result<()> {
        if self.collaborators.permissions.allows(actor_id, permission) {
            Ok(())
        } else {
            tracing::warn!(actor = actor_id, permission, "Permission denied");
            Err(ReleaseError::Forbidden {
                actor: actor_id.to_string(),
                permission: permission.to_string(),
            })
        }
    }

    fn load_game(&self, id: Uuid) -> Result<Game> {
        self.db
            .get_game(id)?
            .filter(|game| !game.is_deleted)
            .ok_or_else(|| ReleaseError::not_found("game", id))
    }

    fn load_version(&self, id: Uuid) -> Result<Version> {
        self.db
            .get_version(id)?
            .filter(|version| !version.is_deleted)
            .ok_or_else(|| ReleaseError::not_found("version", id))
    }

    /// Re-project one game's entry from the database, dropping it if the game
    /// is no longer servable.
    fn refresh_entry(&self, game: &Game) {
        let refreshed = self
            .registry
            .entry_for_game(game.id)
            .and_then(|entry| match entry {
                Some(entry) => self.registry.upsert_entry(entry),
                None => self.registry.remove_entry(&game.slug),
            });
        if let Err(e) = refreshed {
            tracing::warn!(game = %game.slug, "Registry entry refresh failed: {}", e);
        }
    }

    /// Best-effort registry rebuild after a visibility change.
    async fn refresh_registry(&self) {
        if let Err(e) = self.sync_registry().await {
            tracing::error!("Registry sync failed, keeping previous snapshot: {}", e);
        }
    }

    fn notify_owner(&self, game: &Game, version: &Version, action: &str, actor_id: &str) {
        let notifier = Arc::clone(&self.collaborators.notifier);
        let owner_id = game.owner_id.clone();
        let event = ReleaseNotification {
            game_slug: game.slug.clone(),
            version: version.version.clone(),
            action: action.to_string(),
            status: version.status.to_string(),
            actor_id: actor_id.to_string(),
            occurred_at: Utc::now(),
        };

        tokio::spawn(async move {
            if let Err(e) = notifier.notify(&owner_id, &event).await {
                tracing::warn!(owner = %owner_id, "Notification delivery failed: {:#}", e);
            }
        });
    }
}
