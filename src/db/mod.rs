mod schema;

use std::cmp::Ordering;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row, ToSql};
use uuid::Uuid;

use crate::error::ReleaseError;
use crate::models::*;

const GAME_COLUMNS: &str = "id, slug, title, owner_id, runtime, capabilities, icon_url, \
     min_client_version, latest_version_id, live_version_id, disabled, rollout_percentage, \
     is_deleted, created_at, updated_at";

const VERSION_COLUMNS: &str = "id, game_id, version, storage_path, status, release_notes, \
     self_checklist, is_deleted, submitted_at, created_at, updated_at";

const AUDIT_COLUMNS: &str =
    "id, actor_id, action, target_kind, target_id, before_status, after_status, created_at";

const DEFAULT_AUDIT_LIMIT: u32 = 100;

/// Durable store for games, versions and the audit log.
///
/// Every method takes the connection lock for its whole duration, so a single
/// call is atomic with respect to other calls on the same `Database`. Methods
/// that touch two tables do so inside one SQLite transaction.
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open(path: PathBuf) -> Result<Self> {
        let parent = path
            .parent()
            .ok_or_else(|| anyhow::anyhow!("Database path has no parent directory"))?;
        std::fs::create_dir_all(parent)?;
        let conn = Connection::open(&path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().expect("database lock poisoned");
        schema::run_migrations(&conn)
    }

    // ============================================================
    // Game operations
    // ============================================================

    pub fn get_all_games(&self) -> Result<Vec<Game>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let mut stmt = conn.prepare(&format!(
            "SELECT {GAME_COLUMNS} FROM games WHERE is_deleted = 0 ORDER BY title"
        ))?;

        let games = stmt
            .query_map([], game_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(games)
    }

    /// Look up a game by id, including soft-deleted ones.
    pub fn get_game(&self, id: Uuid) -> Result<Option<Game>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        Ok(query_game(&conn, id)?)
    }

    pub fn get_game_by_slug(&self, slug: &str) -> Result<Option<Game>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let game = conn
            .query_row(
                &format!("SELECT {GAME_COLUMNS} FROM games WHERE slug = ?"),
                [slug],
                game_from_row,
            )
            .optional()?;
        Ok(game)
    }

    pub fn create_game(&self, input: CreateGameInput) -> Result<Game> {
        let rollout_percentage = input.rollout_percentage.unwrap_or(100);
        if rollout_percentage > 100 {
            return Err(ReleaseError::Validation(format!(
                "rollout percentage {} outside 0..=100",
                rollout_percentage
            ))
            .into());
        }
        if input.slug.trim().is_empty() {
            return Err(ReleaseError::Validation("slug must not be empty".to_string()).into());
        }

        let conn = self.conn.lock().expect("database lock poisoned");

        let taken: i32 = conn.query_row(
            "SELECT COUNT(*) FROM games WHERE slug = ?",
            [&input.slug],
            |row| row.get(0),
        )?;
        if taken > 0 {
            return Err(
                ReleaseError::Validation(format!("slug {} is already taken", input.slug)).into(),
            );
        }

        let id = Uuid::new_v4();
        let now = Utc::now();
        let runtime = input.runtime.unwrap_or_else(|| "html5".to_string());

        conn.execute(
            "INSERT INTO games (id, slug, title, owner_id, runtime, capabilities, icon_url,
                                min_client_version, rollout_percentage, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            (
                id.to_string(),
                &input.slug,
                &input.title,
                &input.owner_id,
                &runtime,
                serde_json::to_string(&input.capabilities)?,
                &input.icon_url,
                &input.min_client_version,
                rollout_percentage,
                timestamp(now),
                timestamp(now),
            ),
        )?;

        Ok(Game {
            id,
            slug: input.slug,
            title: input.title,
            owner_id: input.owner_id,
            runtime,
            capabilities: input.capabilities,
            icon_url: input.icon_url,
            min_client_version: input.min_client_version,
            latest_version_id: None,
            live_version_id: None,
            disabled: false,
            rollout_percentage,
            is_deleted: false,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn update_game(&self, id: Uuid, input: UpdateGameInput) -> Result<Option<Game>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let Some(existing) = query_game(&conn, id)? else {
            return Ok(None);
        };

        let title = input.title.unwrap_or(existing.title.clone());
        let runtime = input.runtime.unwrap_or(existing.runtime.clone());
        let capabilities = input
            .capabilities
            .unwrap_or(existing.capabilities.clone());
        let icon_url = input.icon_url.or(existing.icon_url.clone());
        let min_client_version = input
            .min_client_version
            .or(existing.min_client_version.clone());

        conn.execute(
            "UPDATE games SET title = ?, runtime = ?, capabilities = ?, icon_url = ?,
                              min_client_version = ?, updated_at = ?
             WHERE id = ?",
            (
                &title,
                &runtime,
                serde_json::to_string(&capabilities)?,
                &icon_url,
                &min_client_version,
                timestamp(Utc::now()),
                id.to_string(),
            ),
        )?;

        Ok(query_game(&conn, id)?)
    }

    pub fn set_game_disabled(&self, id: Uuid, disabled: bool) -> Result<Option<Game>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let rows = conn.execute(
            "UPDATE games SET disabled = ?, updated_at = ? WHERE id = ? AND is_deleted = 0",
            (disabled, timestamp(Utc::now()), id.to_string()),
        )?;
        if rows == 0 {
            return Ok(None);
        }
        Ok(query_game(&conn, id)?)
    }

    pub fn set_rollout_percentage(&self, id: Uuid, percentage: u8) -> Result<Option<Game>> {
        if percentage > 100 {
            return Err(ReleaseError::Validation(format!(
                "rollout percentage {} outside 0..=100",
                percentage
            ))
            .into());
        }

        let conn = self.conn.lock().expect("database lock poisoned");
        let rows = conn.execute(
            "UPDATE games SET rollout_percentage = ?, updated_at = ? WHERE id = ? AND is_deleted = 0",
            (percentage, timestamp(Utc::now()), id.to_string()),
        )?;
        if rows == 0 {
            return Ok(None);
        }
        Ok(query_game(&conn, id)?)
    }

    /// Soft-delete a game. Its live pointer is cleared in the same statement.
    pub fn delete_game(&self, id: Uuid) -> Result<bool> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let rows = conn.execute(
            "UPDATE games SET is_deleted = 1, live_version_id = NULL, updated_at = ?
             WHERE id = ? AND is_deleted = 0",
            (timestamp(Utc::now()), id.to_string()),
        )?;
        Ok(rows > 0)
    }

    /// Take a game offline without touching any version status.
    pub fn clear_live_version(&self, game_id: Uuid) -> Result<Option<Game>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let rows = conn.execute(
            "UPDATE games SET live_version_id = NULL, updated_at = ? WHERE id = ? AND is_deleted = 0",
            (timestamp(Utc::now()), game_id.to_string()),
        )?;
        if rows == 0 {
            return Ok(None);
        }
        Ok(query_game(&conn, game_id)?)
    }

    /// Point a game's live pointer at `version_id`.
    ///
    /// The write only happens if the version belongs to the game, is
    /// `published` and is not deleted at the moment of the update. Returns
    /// `false` when that condition does not hold.
    pub fn set_live_version(&self, game_id: Uuid, version_id: Uuid) -> Result<bool> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let rows = conn.execute(
            "UPDATE games SET live_version_id = ?1, updated_at = ?2
             WHERE id = ?3 AND is_deleted = 0
               AND EXISTS (SELECT 1 FROM versions
                           WHERE id = ?1 AND game_id = ?3
                             AND status = 'published' AND is_deleted = 0)",
            (version_id.to_string(), timestamp(Utc::now()), game_id.to_string()),
        )?;
        Ok(rows > 0)
    }

    /// Games that may appear in the public registry: enabled, not deleted and
    /// with a live pointer.
    pub fn get_syncable_games(&self) -> Result<Vec<Game>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let mut stmt = conn.prepare(&format!(
            "SELECT {GAME_COLUMNS} FROM games
             WHERE disabled = 0 AND is_deleted = 0 AND live_version_id IS NOT NULL
             ORDER BY slug"
        ))?;

        let games = stmt
            .query_map([], game_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(games)
    }

    // ============================================================
    // Version operations
    // ============================================================

    pub fn get_version(&self, id: Uuid) -> Result<Option<Version>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        Ok(query_version(&conn, id)?)
    }

    /// Non-deleted versions of a game, newest first.
    pub fn get_versions_by_game(&self, game_id: Uuid) -> Result<Vec<Version>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let mut stmt = conn.prepare(&format!(
            "SELECT {VERSION_COLUMNS} FROM versions
             WHERE game_id = ? AND is_deleted = 0
             ORDER BY created_at DESC"
        ))?;

        let versions = stmt
            .query_map([game_id.to_string()], version_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(versions)
    }

    /// Create a version in `draft` and make it the game's latest.
    ///
    /// The version string must be a semantic version strictly greater than
    /// every version the game has ever had, deleted ones included.
    pub fn create_version(&self, game_id: Uuid, input: CreateVersionInput) -> Result<Version> {
        let requested = semver::Version::parse(input.version.trim()).map_err(|e| {
            ReleaseError::Validation(format!(
                "version {:?} is not a semantic version: {}",
                input.version, e
            ))
        })?;
        if input.storage_path.trim().is_empty() {
            return Err(
                ReleaseError::Validation("storage path must not be empty".to_string()).into(),
            );
        }

        let mut conn = self.conn.lock().expect("database lock poisoned");
        let tx = conn.transaction()?;

        match query_game(&tx, game_id)? {
            Some(game) if !game.is_deleted => {}
            _ => return Err(ReleaseError::not_found("game", game_id).into()),
        }

        let existing = {
            let mut stmt = tx.prepare("SELECT version FROM versions WHERE game_id = ?")?;
            let rows = stmt
                .query_map([game_id.to_string()], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        if let Some(highest) = existing
            .iter()
            .filter_map(|v| semver::Version::parse(v).ok())
            .max_by(|a, b| a.cmp_precedence(b))
        {
            // Build metadata carries no precedence.
            if requested.cmp_precedence(&highest) != Ordering::Greater {
                return Err(ReleaseError::Validation(format!(
                    "version {} must be greater than {}",
                    requested, highest
                ))
                .into());
            }
        }

        let id = Uuid::new_v4();
        let now = Utc::now();
        let version = requested.to_string();
        let checklist = input
            .self_checklist
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        tx.execute(
            "INSERT INTO versions (id, game_id, version, storage_path, status, release_notes,
                                   self_checklist, created_at, updated_at)
             VALUES (?, ?, ?, ?, 'draft', ?, ?, ?, ?)",
            (
                id.to_string(),
                game_id.to_string(),
                &version,
                &input.storage_path,
                &input.release_notes,
                &checklist,
                timestamp(now),
                timestamp(now),
            ),
        )?;

        tx.execute(
            "UPDATE games SET latest_version_id = ?, updated_at = ? WHERE id = ?",
            (id.to_string(), timestamp(now), game_id.to_string()),
        )?;

        tx.commit()?;

        Ok(Version {
            id,
            game_id,
            version,
            storage_path: input.storage_path,
            status: VersionStatus::Draft,
            release_notes: input.release_notes,
            self_checklist: input.self_checklist,
            is_deleted: false,
            submitted_at: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Patch a version's metadata while it is still in `expected` status.
    ///
    /// Returns `None` if the version is gone or its status moved on.
    pub fn update_version_metadata(
        &self,
        id: Uuid,
        expected: VersionStatus,
        input: UpdateVersionInput,
    ) -> Result<Option<Version>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let Some(existing) = query_version(&conn, id)? else {
            return Ok(None);
        };

        let storage_path = input.storage_path.unwrap_or(existing.storage_path);
        let release_notes = input.release_notes.or(existing.release_notes);
        let checklist = input
            .self_checklist
            .or(existing.self_checklist)
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let rows = conn.execute(
            "UPDATE versions SET storage_path = ?, release_notes = ?, self_checklist = ?, updated_at = ?
             WHERE id = ? AND status = ? AND is_deleted = 0",
            (
                &storage_path,
                &release_notes,
                &checklist,
                timestamp(Utc::now()),
                id.to_string(),
                expected.as_str(),
            ),
        )?;

        if rows == 0 {
            return Ok(None);
        }
        Ok(query_version(&conn, id)?)
    }

    /// Conditionally move a version from `expected` to `next`.
    ///
    /// Returns `None` when the version's stored status is no longer
    /// `expected` (a concurrent transition won). The owning game's live pointer
    /// follows in the same transaction: it is set to this version when `next`
    /// is `published`, and cleared if it names this version otherwise.
    pub fn update_version_status(
        &self,
        id: Uuid,
        expected: VersionStatus,
        next: VersionStatus,
    ) -> Result<Option<Version>> {
        let mut conn = self.conn.lock().expect("database lock poisoned");
        let tx = conn.transaction()?;
        let now = timestamp(Utc::now());

        let rows = tx.execute(
            "UPDATE versions
             SET status = ?1, updated_at = ?2,
                 submitted_at = CASE WHEN ?1 = 'uploaded' THEN ?2 ELSE submitted_at END
             WHERE id = ?3 AND status = ?4 AND is_deleted = 0",
            (next.as_str(), &now, id.to_string(), expected.as_str()),
        )?;

        if rows == 0 {
            return Ok(None);
        }

        if next == VersionStatus::Published {
            tx.execute(
                "UPDATE games SET live_version_id = ?1, updated_at = ?2
                 WHERE id = (SELECT game_id FROM versions WHERE id = ?1) AND is_deleted = 0",
                (id.to_string(), &now),
            )?;
        } else {
            let cleared = tx.execute(
                "UPDATE games SET live_version_id = NULL, updated_at = ? WHERE live_version_id = ?",
                (&now, id.to_string()),
            )?;
            if cleared > 0 {
                tracing::info!(version_id = %id, "Cleared live pointer for version leaving published");
            }
        }

        let version = query_version(&tx, id)?;
        tx.commit()?;
        Ok(version)
    }

    /// Soft-delete a version.
    ///
    /// Clears any live pointer naming it and moves the game's latest pointer
    /// to the newest remaining version, all in one transaction.
    pub fn delete_version(&self, id: Uuid) -> Result<bool> {
        let mut conn = self.conn.lock().expect("database lock poisoned");
        let tx = conn.transaction()?;
        let now = timestamp(Utc::now());

        let rows = tx.execute(
            "UPDATE versions SET is_deleted = 1, updated_at = ? WHERE id = ? AND is_deleted = 0",
            (&now, id.to_string()),
        )?;
        if rows == 0 {
            return Ok(false);
        }

        tx.execute(
            "UPDATE games SET live_version_id = NULL, updated_at = ? WHERE live_version_id = ?",
            (&now, id.to_string()),
        )?;

        tx.execute(
            "UPDATE games SET updated_at = ?1,
                latest_version_id = (SELECT v.id FROM versions v
                                     WHERE v.game_id = games.id AND v.is_deleted = 0
                                     ORDER BY v.created_at DESC LIMIT 1)
             WHERE latest_version_id = ?2",
            (&now, id.to_string()),
        )?;

        tx.commit()?;
        Ok(true)
    }

    // ============================================================
    // Audit log operations
    // ============================================================

    pub fn insert_audit_entry(&self, event: &AuditEvent) -> Result<AuditEntry> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let id = Uuid::new_v4();

        conn.execute(
            "INSERT INTO audit_log (id, actor_id, action, target_kind, target_id,
                                    before_status, after_status, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            (
                id.to_string(),
                &event.actor_id,
                &event.action,
                &event.target_kind,
                event.target_id.to_string(),
                &event.before_status,
                &event.after_status,
                timestamp(event.occurred_at),
            ),
        )?;

        Ok(AuditEntry {
            id,
            actor_id: event.actor_id.clone(),
            action: event.action.clone(),
            target_kind: event.target_kind.clone(),
            target_id: event.target_id,
            before_status: event.before_status.clone(),
            after_status: event.after_status.clone(),
            created_at: event.occurred_at,
        })
    }

    /// Audit entries matching every given filter, newest first.
    pub fn query_audit(&self, query: &AuditQuery) -> Result<Vec<AuditEntry>> {
        let conn = self.conn.lock().expect("database lock poisoned");

        let mut filters = Vec::new();
        let mut params: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(target_id) = query.target_id {
            filters.push("target_id = ?");
            params.push(Box::new(target_id.to_string()));
        }
        if let Some(actor_id) = &query.actor_id {
            filters.push("actor_id = ?");
            params.push(Box::new(actor_id.clone()));
        }
        if let Some(since) = query.since {
            filters.push("created_at >= ?");
            params.push(Box::new(timestamp(since)));
        }
        if let Some(until) = query.until {
            filters.push("created_at <= ?");
            params.push(Box::new(timestamp(until)));
        }

        let where_clause = if filters.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", filters.join(" AND "))
        };

        params.push(Box::new(query.limit.unwrap_or(DEFAULT_AUDIT_LIMIT)));

        let sql = format!(
            "SELECT {AUDIT_COLUMNS} FROM audit_log {where_clause}
             ORDER BY created_at DESC, rowid DESC LIMIT ?"
        );
        let params_ref: Vec<&dyn ToSql> = params.iter().map(|p| p.as_ref()).collect();

        let mut stmt = conn.prepare(&sql)?;
        let entries = stmt
            .query_map(params_ref.as_slice(), audit_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(entries)
    }

    /// Delete audit entries created before `cutoff`. Returns the number removed.
    pub fn purge_audit_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let rows = conn.execute(
            "DELETE FROM audit_log WHERE created_at < ?",
            [timestamp(cutoff)],
        )?;
        Ok(rows)
    }
}

impl Clone for Database {
    fn clone(&self) -> Self {
        Self {
            conn: self.conn.clone(),
        }
    }
}

fn query_game(conn: &Connection, id: Uuid) -> rusqlite::Result<Option<Game>> {
    conn.query_row(
        &format!("SELECT {GAME_COLUMNS} FROM games WHERE id = ?"),
        [id.to_string()],
        game_from_row,
    )
    .optional()
}

fn query_version(conn: &Connection, id: Uuid) -> rusqlite::Result<Option<Version>> {
    conn.query_row(
        &format!("SELECT {VERSION_COLUMNS} FROM versions WHERE id = ?"),
        [id.to_string()],
        version_from_row,
    )
    .optional()
}

fn game_from_row(row: &Row<'_>) -> rusqlite::Result<Game> {
    Ok(Game {
        id: parse_uuid(row.get::<_, String>(0)?),
        slug: row.get(1)?,
        title: row.get(2)?,
        owner_id: row.get(3)?,
        runtime: row.get(4)?,
        capabilities: serde_json::from_str(&row.get::<_, String>(5)?).unwrap_or_default(),
        icon_url: row.get(6)?,
        min_client_version: row.get(7)?,
        latest_version_id: row.get::<_, Option<String>>(8)?.map(parse_uuid),
        live_version_id: row.get::<_, Option<String>>(9)?.map(parse_uuid),
        disabled: row.get(10)?,
        rollout_percentage: row.get::<_, i64>(11)?.clamp(0, 100) as u8,
        is_deleted: row.get(12)?,
        created_at: parse_datetime(row.get::<_, String>(13)?),
        updated_at: parse_datetime(row.get::<_, String>(14)?),
    })
}

fn version_from_row(row: &Row<'_>) -> rusqlite::Result<Version> {
    Ok(Version {
        id: parse_uuid(row.get::<_, String>(0)?),
        game_id: parse_uuid(row.get::<_, String>(1)?),
        version: row.get(2)?,
        storage_path: row.get(3)?,
        status: VersionStatus::from_str(&row.get::<_, String>(4)?)
            .unwrap_or(VersionStatus::Draft),
        release_notes: row.get(5)?,
        self_checklist: row
            .get::<_, Option<String>>(6)?
            .and_then(|json| serde_json::from_str(&json).ok()),
        is_deleted: row.get(7)?,
        submitted_at: row.get::<_, Option<String>>(8)?.map(parse_datetime),
        created_at: parse_datetime(row.get::<_, String>(9)?),
        updated_at: parse_datetime(row.get::<_, String>(10)?),
    })
}

fn audit_from_row(row: &Row<'_>) -> rusqlite::Result<AuditEntry> {
    Ok(AuditEntry {
        id: parse_uuid(row.get::<_, String>(0)?),
        actor_id: row.get(1)?,
        action: row.get(2)?,
        target_kind: row.get(3)?,
        target_id: parse_uuid(row.get::<_, String>(4)?),
        before_status: row.get(5)?,
        after_status: row.get(6)?,
        created_at: parse_datetime(row.get::<_, String>(7)?),
    })
}

/// Fixed-width UTC timestamps so lexical order in SQL matches time order.
fn timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_uuid(s: String) -> Uuid {
    Uuid::parse_str(&s).unwrap_or_else(|_| Uuid::nil())
}

fn parse_datetime(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
