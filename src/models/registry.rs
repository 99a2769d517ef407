use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Schema version written into every registry snapshot.
pub const REGISTRY_SCHEMA_VERSION: &str = "1.0";

/// One consumer-visible game in the public registry.
///
/// Only whitelisted fields appear here: no owner, no internal ids, no
/// review metadata. The registry is a disposable projection and can always be
/// rebuilt from the database.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RegistryEntry {
    /// The game's public slug.
    pub id: String,
    pub title: String,
    pub entry_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon_url: Option<String>,
    pub runtime: String,
    pub capabilities: Vec<String>,
    pub rollout_percentage: u8,
    pub version: String,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_client_version: Option<String>,
}

/// The whole public registry as persisted to the read store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RegistrySnapshot {
    pub entries: Vec<RegistryEntry>,
    /// Monotonic generation stamp. Writes not newer than the persisted one are rejected.
    pub generated_at: DateTime<Utc>,
    pub schema_version: String,
}

impl RegistrySnapshot {
    pub fn new(entries: Vec<RegistryEntry>, generated_at: DateTime<Utc>) -> Self {
        Self {
            entries,
            generated_at,
            schema_version: REGISTRY_SCHEMA_VERSION.to_string(),
        }
    }

    /// The projection served when nothing valid has been persisted yet.
    pub fn empty() -> Self {
        Self::new(Vec::new(), DateTime::<Utc>::UNIX_EPOCH)
    }

    pub fn entry(&self, id: &str) -> Option<&RegistryEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    /// Structural checks applied to every snapshot read back from a store.
    pub fn validate(&self) -> Result<(), String> {
        if self.schema_version != REGISTRY_SCHEMA_VERSION {
            return Err(format!(
                "unsupported schema version {:?} (expected {})",
                self.schema_version, REGISTRY_SCHEMA_VERSION
            ));
        }

        let mut seen = HashSet::new();
        for entry in &self.entries {
            if entry.id.is_empty() {
                return Err("entry with empty id".to_string());
            }
            if !seen.insert(entry.id.as_str()) {
                return Err(format!("duplicate entry id {}", entry.id));
            }
            if entry.entry_url.is_empty() {
                return Err(format!("entry {} has no entry url", entry.id));
            }
            if entry.version.is_empty() {
                return Err(format!("entry {} has no version", entry.id));
            }
            if entry.rollout_percentage > 100 {
                return Err(format!(
                    "entry {} has rollout percentage {} outside 0..=100",
                    entry.id, entry.rollout_percentage
                ));
            }
        }

        Ok(())
    }
}
