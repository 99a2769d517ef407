//! Error taxonomy for release operations.

use thiserror::Error;

use crate::models::VersionStatus;
use crate::pipeline::ReleaseAction;

/// Errors surfaced by the release pipeline and its orchestration.
///
/// Audit write failures are deliberately absent: the audit sink logs and
/// swallows them.
#[derive(Debug, Error)]
pub enum ReleaseError {
    #[error("cannot {action} a version in status {status}; valid actions: {}", format_actions(.valid))]
    InvalidTransition {
        action: ReleaseAction,
        status: VersionStatus,
        valid: Vec<ReleaseAction>,
    },

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("{actor} lacks permission {permission}")]
    Forbidden { actor: String, permission: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid input: {0}")]
    Validation(String),
}

impl ReleaseError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Whether the caller may retry the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StorageUnavailable(_) | Self::Conflict(_))
    }
}

/// Repository methods return `anyhow::Result` and raise domain rejections as
/// a wrapped `ReleaseError`; those come back out unchanged. Anything else is
/// a storage failure.
impl From<anyhow::Error> for ReleaseError {
    fn from(e: anyhow::Error) -> Self {
        match e.downcast::<ReleaseError>() {
            Ok(release_error) => release_error,
            Err(other) => Self::StorageUnavailable(format!("{:#}", other)),
        }
    }
}

impl From<rusqlite::Error> for ReleaseError {
    fn from(e: rusqlite::Error) -> Self {
        Self::StorageUnavailable(e.to_string())
    }
}

fn format_actions(actions: &[ReleaseAction]) -> String {
    if actions.is_empty() {
        return "none".to_string();
    }
    actions
        .iter()
        .map(|a| a.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

pub type Result<T, E = ReleaseError> = std::result::Result<T, E>;
