//! Synchronization configuration.

use crate::conflict::ConflictPolicy;
use fieldpack_storage::DEFAULT_BATCH_SIZE;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Settings for one synchronization run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// What to do with conflicting edits.
    pub policy: ConflictPolicy,
    /// Features compared per batch.
    pub batch_size: usize,
    /// Bound on opening each source, in seconds.
    pub timeout_secs: u64,
    /// Write `conflicts.json` into the package root.
    pub write_report: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            policy: ConflictPolicy::Manual,
            batch_size: DEFAULT_BATCH_SIZE,
            timeout_secs: 10,
            write_report: true,
        }
    }
}

impl SyncConfig {
    /// Loads configuration from an explicit path.
    pub fn load_from(path: &Path) -> Self {
        if !path.exists() {
            info!("No sync config at {:?}, using defaults", path);
            return Self::default();
        }
        match std::fs::read_to_string(path) {
            Ok(text) => match toml::from_str::<Self>(&text) {
                Ok(config) => {
                    info!("Loaded sync config from {:?}", path);
                    config
                }
                Err(e) => {
                    warn!(
                        "Failed to parse sync config {:?}: {}. Falling back to defaults.",
                        path, e
                    );
                    Self::default()
                }
            },
            Err(e) => {
                warn!("Failed to read sync config {:?}: {}", path, e);
                Self::default()
            }
        }
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }

    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.batch_size.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_leave_conflicts_to_the_user() {
        let config = SyncConfig::default();
        assert_eq!(config.policy, ConflictPolicy::Manual);
        assert_eq!(config.batch_size, 500);
        assert!(config.write_report);
    }

    #[test]
    fn policy_is_read_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.toml");
        std::fs::write(&path, "policy = \"prefer-remote\"\nbatch_size = 50\nunknown = 1\n").unwrap();
        let config = SyncConfig::load_from(&path);
        assert_eq!(config.policy, ConflictPolicy::PreferRemote);
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.timeout_secs, 10);
    }

    #[test]
    fn broken_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.toml");
        std::fs::write(&path, "policy = [").unwrap();
        assert_eq!(SyncConfig::load_from(&path), SyncConfig::default());
    }
}
