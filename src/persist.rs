//! Persistence of the two explicit service flags.
//!
//! `disabled` and `screensaver_mode` survive restarts; everything else is
//! rebuilt from scratch.  The store is a trait so the service shim can
//! supply whatever key/value mechanism the platform uses; the default
//! implementation is a small TOML file next to the cache.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistedFlags {
    pub screensaver_mode: bool,
    pub disabled: bool,
}

pub trait StateStore: Send + Sync {
    /// Load the persisted flags; a missing record reads as defaults.
    fn load(&self) -> Result<PersistedFlags>;
    fn save(&self, flags: &PersistedFlags) -> Result<()>;
}

// ---------------------------------------------------------------------------
// TOML-file store
// ---------------------------------------------------------------------------

pub struct TomlStateStore {
    path: PathBuf,
}

impl TomlStateStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl StateStore for TomlStateStore {
    fn load(&self) -> Result<PersistedFlags> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "no persisted state, using defaults");
            return Ok(PersistedFlags::default());
        }
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read state file: {}", self.path.display()))?;
        let flags = toml::from_str(&content)
            .with_context(|| format!("failed to parse state file: {}", self.path.display()))?;
        Ok(flags)
    }

    fn save(&self, flags: &PersistedFlags) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create state directory: {}", parent.display())
                })?;
            }
        }
        let content = toml::to_string_pretty(flags).context("failed to serialize state")?;
        std::fs::write(&self.path, content)
            .with_context(|| format!("failed to write state file: {}", self.path.display()))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// Store that forgets on drop; used by tests and `--console` trial runs.
#[derive(Default)]
pub struct MemoryStateStore {
    flags: Mutex<PersistedFlags>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self) -> Result<PersistedFlags> {
        Ok(*self.flags.lock().unwrap())
    }

    fn save(&self, flags: &PersistedFlags) -> Result<()> {
        *self.flags.lock().unwrap() = *flags;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_reads_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = TomlStateStore::new(dir.path().join("state.toml"));
        assert_eq!(store.load().unwrap(), PersistedFlags::default());
    }

    #[test]
    fn test_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = TomlStateStore::new(dir.path().join("state.toml"));

        let flags = PersistedFlags {
            screensaver_mode: true,
            disabled: true,
        };
        store.save(&flags).unwrap();
        assert_eq!(store.load().unwrap(), flags);

        // Saving again overwrites.
        let cleared = PersistedFlags::default();
        store.save(&cleared).unwrap();
        assert_eq!(store.load().unwrap(), cleared);
    }

    #[test]
    fn test_creates_parent_directory() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = TomlStateStore::new(dir.path().join("nested/deeper/state.toml"));
        store.save(&PersistedFlags::default()).unwrap();
        assert!(store.load().is_ok());
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryStateStore::new();
        assert_eq!(store.load().unwrap(), PersistedFlags::default());
        let flags = PersistedFlags {
            screensaver_mode: false,
            disabled: true,
        };
        store.save(&flags).unwrap();
        assert_eq!(store.load().unwrap(), flags);
    }
}
