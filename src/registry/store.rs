//! Backends the public registry snapshot is written to.

use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};

/// An external read store holding one serialized registry snapshot.
///
/// Implementations only move bytes; parsing, validation and generation checks
/// live in [`super::RegistrySync`].
pub trait RegistryStore: Send + Sync {
    /// The persisted snapshot, or `None` if nothing has been written yet.
    fn load(&self) -> Result<Option<String>>;

    /// Replace the persisted snapshot in a single step. Readers see either the
    /// old body or the new one, never a mix.
    fn replace(&self, body: &str) -> Result<()>;
}

/// Snapshot stored as a JSON file, replaced via write-to-temp and rename.
#[derive(Debug, Clone)]
pub struct FileRegistryStore {
    path: PathBuf,
}

impl FileRegistryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "registry".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl RegistryStore for FileRegistryStore {
    fn load(&self) -> Result<Option<String>> {
        match std::fs::read_to_string(&self.path) {
            Ok(body) => Ok(Some(body)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e)
                .with_context(|| format!("Failed to read registry {}", self.path.display())),
        }
    }

    fn replace(&self, body: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let temp = self.temp_path();
        std::fs::write(&temp, body)
            .with_context(|| format!("Failed to write {}", temp.display()))?;
        std::fs::rename(&temp, &self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

/// Snapshot held in memory.
#[derive(Debug, Default)]
pub struct MemoryRegistryStore {
    body: Mutex<Option<String>>,
}

impl MemoryRegistryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RegistryStore for MemoryRegistryStore {
    fn load(&self) -> Result<Option<String>> {
        Ok(self.body.lock().expect("registry store lock poisoned").clone())
    }

    fn replace(&self, body: &str) -> Result<()> {
        *self.body.lock().expect("registry store lock poisoned") = Some(body.to_string());
        Ok(())
    }
}
