use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A release container: one distributable game and its pointers into the
/// version history.
///
/// `live_version_id` is the build end consumers see. When set it must name a
/// version of this game whose status is `published` and which is not deleted;
/// every write path that moves a version out of `published` clears it in the
/// same transaction.
///
/// `disabled` is a kill-switch independent of any version status: a disabled
/// game keeps its live pointer but is dropped from the public registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Game {
    pub id: Uuid,
    /// Public identifier used as the registry entry id.
    pub slug: String,
    pub title: String,
    /// Account that receives release notifications.
    pub owner_id: String,
    /// Runtime the entry file targets (e.g. `html5`).
    pub runtime: String,
    pub capabilities: Vec<String>,
    pub icon_url: Option<String>,
    pub min_client_version: Option<String>,
    pub latest_version_id: Option<Uuid>,
    pub live_version_id: Option<Uuid>,
    pub disabled: bool,
    /// Share of consumers, 0..=100, that see the live version.
    pub rollout_percentage: u8,
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating a new game.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateGameInput {
    pub slug: String,
    pub title: String,
    pub owner_id: String,
    /// Defaults to `html5`.
    pub runtime: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub icon_url: Option<String>,
    pub min_client_version: Option<String>,
    /// Defaults to 100 (everyone).
    pub rollout_percentage: Option<u8>,
}

/// Input for updating a game's descriptive fields. All fields are optional for partial updates.
///
/// Release pointers, the kill-switch and the rollout percentage have their own
/// operations and are not patchable here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateGameInput {
    pub title: Option<String>,
    pub runtime: Option<String>,
    pub capabilities: Option<Vec<String>>,
    pub icon_url: Option<String>,
    pub min_client_version: Option<String>,
}

/// Body for `PUT /games/{id}/rollout`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolloutInput {
    pub rollout_percentage: u8,
}
