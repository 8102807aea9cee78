//! Engine configuration (spec.md §6.4), persisted as TOML through the same
//! [`FileSystem`] abstraction every other component uses.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::fs::FileSystem;

/// Every tunable the engine reads at startup. Field names and defaults are
/// normative (spec.md §6.4); components that care about one of these
/// (rotation thresholds, stale-gap thresholds, retention windows) take it as
/// a constructor argument rather than reading this struct directly, so
/// tests can exercise non-default values without going through TOML.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Interval between polling-fallback ticks of the file watcher (C13)
    /// and the activity/deletion sync poller (C8/C9), in milliseconds.
    pub poll_interval_ms: u64,
    /// Size at which a `.crdtlog` file rotates to a fresh one (C2).
    pub log_rotation_bytes: u64,
    /// Size at which an instance's own activity/deletion feed file is
    /// rewritten down to its newest entries (C7/C9).
    pub activity_log_rotation_bytes: u64,
    /// Updates accumulated since the newest snapshot before a re-snapshot
    /// is due (C10 "Re-snapshot").
    pub snapshot_updates_trigger: u64,
    /// Sequence-gap threshold beyond which a missing record is treated as a
    /// stale peer rather than ordinary replication lag (C8).
    pub stale_gap_threshold: u64,
    /// Minimum contiguous run length before packing (C10 "Packing").
    pub pack_min_entries: usize,
    /// Age, in seconds, before a fully-covered pack/log file is eligible
    /// for GC (C10 "GC").
    pub pack_retention_seconds: u64,
    /// Age, in seconds, before an untouched foreign activity log is removed
    /// on startup (C8 "Orphan cleanup").
    pub orphan_activity_retention_seconds: u64,
    /// Time a cross-SD move's owner may go quiet before another instance
    /// may take over (C11).
    pub move_owner_stale_seconds: u64,
    /// Root directory backups are written under (C14).
    pub backup_root: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5_000,
            log_rotation_bytes: 10 * 1024 * 1024,
            activity_log_rotation_bytes: 1024 * 1024,
            snapshot_updates_trigger: 1_000,
            stale_gap_threshold: 50,
            pack_min_entries: 100,
            pack_retention_seconds: 86_400,
            orphan_activity_retention_seconds: 604_800,
            move_owner_stale_seconds: 300,
            backup_root: PathBuf::from("backups"),
        }
    }
}

impl EngineConfig {
    /// Load configuration from `path`, falling back to [`Default::default`]
    /// if the file does not exist.
    pub fn load_or_default(fs: &dyn FileSystem, path: &Path) -> Result<Self> {
        if !fs.exists(path) {
            return Ok(Self::default());
        }
        Self::load(fs, path)
    }

    /// Load and parse configuration from `path`, erroring if it's missing
    /// or malformed.
    pub fn load(fs: &dyn FileSystem, path: &Path) -> Result<Self> {
        let bytes = fs.read(path).map_err(|source| EngineError::IoAt {
            path: path.to_path_buf(),
            source,
        })?;
        let text = String::from_utf8_lossy(&bytes);
        let config: EngineConfig = toml::from_str(&text)?;
        Ok(config)
    }

    /// Serialize and write configuration to `path`, creating parent
    /// directories as needed.
    pub fn save(&self, fs: &dyn FileSystem, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs.create_dir_all(parent)?;
            }
        }
        let text = toml::to_string_pretty(self)?;
        fs.write_file(path, text.as_bytes())?;
        Ok(())
    }
}
