use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One releasable build of a game.
///
/// Versions are never hard-deleted; `is_deleted` hides them while keeping the
/// history (and the version string) reserved. Status only changes through the
/// release state machine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Version {
    pub id: Uuid,
    pub game_id: Uuid,
    /// Semantic version string, strictly increasing per game.
    pub version: String,
    /// Path of the build directory under the artifact store / CDN base.
    pub storage_path: String,
    pub status: VersionStatus,
    pub release_notes: Option<String>,
    pub self_checklist: Option<SelfChecklist>,
    pub is_deleted: bool,
    pub submitted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The release status of a version.
///
/// ```text
/// draft -> uploaded -> qc_processing -> qc_passed -> approved -> published -> archived
///             ^              |              |           |                       |
///             |              v              v           v                       |
///             +-------- qc_failed <---------+-----------+        published <----+
/// ```
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum VersionStatus {
    Draft,
    Uploaded,
    QcProcessing,
    QcPassed,
    QcFailed,
    Approved,
    Published,
    Archived,
}

impl VersionStatus {
    pub const ALL: [VersionStatus; 8] = [
        Self::Draft,
        Self::Uploaded,
        Self::QcProcessing,
        Self::QcPassed,
        Self::QcFailed,
        Self::Approved,
        Self::Published,
        Self::Archived,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Uploaded => "uploaded",
            Self::QcProcessing => "qc_processing",
            Self::QcPassed => "qc_passed",
            Self::QcFailed => "qc_failed",
            Self::Approved => "approved",
            Self::Published => "published",
            Self::Archived => "archived",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(Self::Draft),
            "uploaded" => Some(Self::Uploaded),
            "qc_processing" => Some(Self::QcProcessing),
            "qc_passed" => Some(Self::QcPassed),
            "qc_failed" => Some(Self::QcFailed),
            "approved" => Some(Self::Approved),
            "published" => Some(Self::Published),
            "archived" => Some(Self::Archived),
            _ => None,
        }
    }

    /// Whether metadata (storage path, notes, checklist) may still be edited.
    pub fn is_editable(&self) -> bool {
        matches!(self, Self::Draft | Self::QcFailed)
    }
}

impl fmt::Display for VersionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The developer's pre-submission attestation.
///
/// A version can only be submitted once every item is attested.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SelfChecklist {
    pub assets_licensed: bool,
    pub no_external_tracking: bool,
    pub runs_offline: bool,
    pub content_age_appropriate: bool,
    pub tested_on_target_devices: bool,
}

impl SelfChecklist {
    /// A checklist with every item attested.
    pub fn attested() -> Self {
        Self {
            assets_licensed: true,
            no_external_tracking: true,
            runs_offline: true,
            content_age_appropriate: true,
            tested_on_target_devices: true,
        }
    }

    /// Names of the items that are still unchecked.
    pub fn missing(&self) -> Vec<&'static str> {
        [
            ("assets_licensed", self.assets_licensed),
            ("no_external_tracking", self.no_external_tracking),
            ("runs_offline", self.runs_offline),
            ("content_age_appropriate", self.content_age_appropriate),
            ("tested_on_target_devices", self.tested_on_target_devices),
        ]
        .into_iter()
        .filter(|(_, checked)| !checked)
        .map(|(name, _)| name)
        .collect()
    }

    pub fn is_fully_attested(&self) -> bool {
        self.missing().is_empty()
    }
}

/// Input for creating a new version. New versions always start in `draft`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateVersionInput {
    pub version: String,
    pub storage_path: String,
    pub release_notes: Option<String>,
    pub self_checklist: Option<SelfChecklist>,
}

/// Metadata patch for a version. Never touches status.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateVersionInput {
    pub storage_path: Option<String>,
    pub release_notes: Option<String>,
    pub self_checklist: Option<SelfChecklist>,
}
