//! Public registry synchronization.
//!
//! The registry is a denormalized, consumer-facing projection of which games
//! are live. It is rebuilt from the database, never trusted as a source of
//! truth, and written to an external [`RegistryStore`] as a whole snapshot.
//!
//! All writes for one store go through a single writer lock on
//! [`RegistrySync`]. A full sync holds the lock from reading the database to
//! replacing the snapshot, so a point update can never interleave with it.
//! Each snapshot carries a strictly increasing `generated_at` stamp, and
//! [`RegistrySync::commit`] drops a snapshot built elsewhere whose stamp is not
//! newer than the persisted one.
//!
//! [`spawn_scheduled_sync`] rebuilds on an interval so a failed or dropped
//! rebuild is corrected without waiting for the next triggering action.

mod store;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use uuid::Uuid;

pub use store::{FileRegistryStore, MemoryRegistryStore, RegistryStore};

use crate::config::ReleaseConfig;
use crate::db::Database;
use crate::error::ReleaseError;
use crate::models::{Game, RegistryEntry, RegistrySnapshot, Version, VersionStatus};

/// Build an entry URL from the CDN base, a storage path and the entry file.
pub fn entry_url(base_url: &str, storage_path: &str, entry_file: &str) -> String {
    [
        base_url.trim_end_matches('/'),
        storage_path.trim_matches('/'),
        entry_file.trim_start_matches('/'),
    ]
    .into_iter()
    .filter(|part| !part.is_empty())
    .collect::<Vec<_>>()
    .join("/")
}

/// Parse and validate a persisted snapshot body.
pub fn parse_snapshot(body: &str) -> Result<RegistrySnapshot, String> {
    let snapshot: RegistrySnapshot =
        serde_json::from_str(body).map_err(|e| format!("malformed snapshot: {}", e))?;
    snapshot.validate()?;
    Ok(snapshot)
}

/// Rebuilds and patches the public registry for one store.
pub struct RegistrySync {
    db: Database,
    store: Arc<dyn RegistryStore>,
    cdn_base_url: String,
    entry_file: String,
    writer: Mutex<()>,
}

impl RegistrySync {
    pub fn new(db: Database, store: Arc<dyn RegistryStore>, config: &ReleaseConfig) -> Self {
        Self {
            db,
            store,
            cdn_base_url: config.cdn_base_url.clone(),
            entry_file: config.entry_file.clone(),
            writer: Mutex::new(()),
        }
    }

    /// The currently persisted projection.
    ///
    /// A missing, unreadable or structurally invalid snapshot is served as an
    /// empty projection.
    pub fn snapshot(&self) -> RegistrySnapshot {
        match self.read_current() {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => RegistrySnapshot::empty(),
            Err(e) => {
                tracing::warn!("Registry store unreadable, serving empty projection: {}", e);
                RegistrySnapshot::empty()
            }
        }
    }

    /// Rebuild the whole projection from the database and replace the
    /// persisted snapshot.
    ///
    /// The writer lock is held from the database read to the replace, and the
    /// new generation is stamped after the persisted one. On failure nothing is
    /// written.
    pub fn sync(&self) -> Result<RegistrySnapshot, ReleaseError> {
        let _writer = self.writer.lock().expect("registry writer lock poisoned");

        let previous = self.read_current()?.unwrap_or_else(RegistrySnapshot::empty);
        let snapshot = self.build_snapshot(next_generation(previous.generated_at))?;
        self.write(&snapshot)?;

        tracing::info!(
            entries = snapshot.entries.len(),
            generated_at = %snapshot.generated_at,
            "Registry sync complete"
        );
        Ok(snapshot)
    }

    /// Project every visible game into registry entries without writing anything.
    pub fn build_snapshot(
        &self,
        generated_at: DateTime<Utc>,
    ) -> Result<RegistrySnapshot, ReleaseError> {
        let candidates = self.db.get_syncable_games()?;
        tracing::debug!(candidates = candidates.len(), "Fetched enabled games with a live version");

        let mut entries = Vec::with_capacity(candidates.len());
        let mut discarded = 0usize;

        for game in &candidates {
            let Some(live_id) = game.live_version_id else {
                continue;
            };

            match self.db.get_version(live_id)? {
                Some(version) if is_servable(game, &version) => {
                    entries.push(self.project(game, &version));
                }
                Some(version) => {
                    discarded += 1;
                    tracing::warn!(
                        game = %game.slug,
                        version_id = %version.id,
                        status = %version.status,
                        "Live pointer names a version that is not servable; skipping"
                    );
                }
                None => {
                    discarded += 1;
                    tracing::warn!(
                        game = %game.slug,
                        version_id = %live_id,
                        "Live pointer names a missing version; skipping"
                    );
                }
            }
        }

        tracing::info!(
            candidates = candidates.len(),
            published = entries.len(),
            discarded,
            "Built registry projection"
        );

        Ok(RegistrySnapshot::new(entries, generated_at))
    }

    /// The whitelisted public view of one game and its live version.
    pub fn project(&self, game: &Game, version: &Version) -> RegistryEntry {
        RegistryEntry {
            id: game.slug.clone(),
            title: game.title.clone(),
            entry_url: entry_url(&self.cdn_base_url, &version.storage_path, &self.entry_file),
            icon_url: game.icon_url.clone(),
            runtime: game.runtime.clone(),
            capabilities: game.capabilities.clone(),
            rollout_percentage: game.rollout_percentage,
            version: version.version.clone(),
            updated_at: game.updated_at,
            min_client_version: game.min_client_version.clone(),
        }
    }

    /// The entry a full sync would produce for `game_id`, if any.
    pub fn entry_for_game(&self, game_id: Uuid) -> Result<Option<RegistryEntry>, ReleaseError> {
        let Some(game) = self.db.get_game(game_id)? else {
            return Ok(None);
        };
        if game.disabled || game.is_deleted {
            return Ok(None);
        }
        let Some(live_id) = game.live_version_id else {
            return Ok(None);
        };

        Ok(self
            .db
            .get_version(live_id)?
            .filter(|version| is_servable(&game, version))
            .map(|version| self.project(&game, &version)))
    }

    /// Insert or replace one entry without a full rebuild.
    pub fn upsert_entry(&self, entry: RegistryEntry) -> Result<RegistrySnapshot, ReleaseError> {
        if entry.rollout_percentage > 100 {
            return Err(ReleaseError::Validation(format!(
                "rollout percentage {} outside 0..=100",
                entry.rollout_percentage
            )));
        }

        self.patch(|entries| {
            match entries.iter_mut().find(|e| e.id == entry.id) {
                Some(existing) => *existing = entry,
                None => {
                    entries.push(entry);
                    entries.sort_by(|a, b| a.id.cmp(&b.id));
                }
            }
            true
        })
    }

    /// Drop the entry with public id `id`. A missing entry is not an error.
    pub fn remove_entry(&self, id: &str) -> Result<RegistrySnapshot, ReleaseError> {
        self.patch(|entries| {
            let before = entries.len();
            entries.retain(|e| e.id != id);
            entries.len() != before
        })
    }

    /// Change one entry's rollout percentage. A missing entry is left alone.
    pub fn update_rollout(
        &self,
        id: &str,
        rollout_percentage: u8,
    ) -> Result<RegistrySnapshot, ReleaseError> {
        if rollout_percentage > 100 {
            return Err(ReleaseError::Validation(format!(
                "rollout percentage {} outside 0..=100",
                rollout_percentage
            )));
        }

        let updated_at = self
            .db
            .get_game_by_slug(id)?
            .map_or_else(Utc::now, |game| game.updated_at);

        self.patch(|entries| match entries.iter_mut().find(|e| e.id == id) {
            Some(entry) => {
                entry.rollout_percentage = rollout_percentage;
                entry.updated_at = updated_at;
                true
            }
            None => false,
        })
    }

    /// Read-modify-write the persisted snapshot under the writer lock.
    ///
    /// `mutate` returns whether it changed anything; unchanged snapshots are
    /// not rewritten.
    fn patch(
        &self,
        mutate: impl FnOnce(&mut Vec<RegistryEntry>) -> bool,
    ) -> Result<RegistrySnapshot, ReleaseError> {
        let _writer = self.writer.lock().expect("registry writer lock poisoned");

        let current = self.read_current()?.unwrap_or_else(RegistrySnapshot::empty);
        let mut entries = current.entries.clone();

        if !mutate(&mut entries) {
            return Ok(current);
        }

        let next = RegistrySnapshot::new(entries, next_generation(current.generated_at));
        self.write(&next)?;
        Ok(next)
    }

    /// Persist a snapshot built with [`build_snapshot`](Self::build_snapshot)
    /// unless the store already holds the same or a newer generation.
    ///
    /// Returns the snapshot that is current afterwards.
    pub fn commit(&self, snapshot: RegistrySnapshot) -> Result<RegistrySnapshot, ReleaseError> {
        let _writer = self.writer.lock().expect("registry writer lock poisoned");

        if let Some(current) = self.read_current()? {
            if snapshot.generated_at <= current.generated_at {
                tracing::warn!(
                    attempted = %snapshot.generated_at,
                    persisted = %current.generated_at,
                    "Dropping stale registry snapshot"
                );
                return Ok(current);
            }
        }

        self.write(&snapshot)?;
        Ok(snapshot)
    }

    fn write(&self, snapshot: &RegistrySnapshot) -> Result<(), ReleaseError> {
        let body = serde_json::to_string_pretty(snapshot)
            .map_err(|e| ReleaseError::StorageUnavailable(e.to_string()))?;
        self.store.replace(&body)?;
        tracing::debug!(entries = snapshot.entries.len(), "Registry snapshot written");
        Ok(())
    }

    /// Load the persisted snapshot. Invalid bodies read as absent so the next
    /// write replaces them; store I/O failures are errors.
    fn read_current(&self) -> Result<Option<RegistrySnapshot>, ReleaseError> {
        let Some(body) = self.store.load()? else {
            return Ok(None);
        };

        match parse_snapshot(&body) {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(reason) => {
                tracing::warn!("Ignoring invalid registry snapshot: {}", reason);
                Ok(None)
            }
        }
    }
}

/// Run [`RegistrySync::sync`] every `every`, starting immediately. Failures
/// are logged and retried on the next tick.
pub fn spawn_scheduled_sync(registry: Arc<RegistrySync>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let registry = Arc::clone(&registry);
            match tokio::task::spawn_blocking(move || registry.sync()).await {
                Ok(Ok(snapshot)) => tracing::debug!(
                    entries = snapshot.entries.len(),
                    "Scheduled registry sync complete"
                ),
                Ok(Err(e)) => tracing::warn!("Scheduled registry sync failed: {}", e),
                Err(e) => tracing::error!("Scheduled registry sync task panicked: {}", e),
            }
        }
    })
}

fn is_servable(game: &Game, version: &Version) -> bool {
    version.status == VersionStatus::Published && !version.is_deleted && version.game_id == game.id
}

/// A generation stamp strictly after `previous`, normally "now".
fn next_generation(previous: DateTime<Utc>) -> DateTime<Utc> {
    let now = Utc::now();
    if now > previous {
        now
    } else {
        previous + chrono::Duration::milliseconds(1)
    }
}
