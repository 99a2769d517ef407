use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An immutable record of an accepted release action.
///
/// Audit entries are append-only and expire after the configured retention
/// window.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEntry {
    pub id: Uuid,
    pub actor_id: String,
    /// Action name, e.g. `publish` or `disable`.
    pub action: String,
    /// `version` or `game`.
    pub target_kind: String,
    pub target_id: Uuid,
    pub before_status: Option<String>,
    pub after_status: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// An event handed to the audit sink. The entry id and timestamp are assigned on write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub actor_id: String,
    pub action: String,
    pub target_kind: String,
    pub target_id: Uuid,
    pub before_status: Option<String>,
    pub after_status: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn version(
        actor_id: &str,
        action: &str,
        target_id: Uuid,
        before: Option<String>,
        after: Option<String>,
    ) -> Self {
        Self {
            actor_id: actor_id.to_string(),
            action: action.to_string(),
            target_kind: "version".to_string(),
            target_id,
            before_status: before,
            after_status: after,
            occurred_at: Utc::now(),
        }
    }

    pub fn game(actor_id: &str, action: &str, target_id: Uuid) -> Self {
        Self {
            actor_id: actor_id.to_string(),
            action: action.to_string(),
            target_kind: "game".to_string(),
            target_id,
            before_status: None,
            after_status: None,
            occurred_at: Utc::now(),
        }
    }
}

/// Filters for audit queries. Results are always newest first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditQuery {
    pub target_id: Option<Uuid>,
    pub actor_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    /// Defaults to 100.
    pub limit: Option<u32>,
}
