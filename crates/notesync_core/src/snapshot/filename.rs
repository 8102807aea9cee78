//! Snapshot filename parsing: `snapshot_{totalChanges}_{instanceId}.snapshot`.

use std::path::{Path, PathBuf};

use crate::id::EntityId;

/// A parsed `.snapshot` filename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotFileName {
    /// Sum of sequences incorporated across all instances at write time.
    pub total_changes: u64,
    /// Instance that produced this snapshot.
    pub instance_id: EntityId,
}

impl SnapshotFileName {
    /// Build the filename (without directory) for these parameters.
    pub fn format(&self) -> String {
        format!("snapshot_{}_{}.snapshot", self.total_changes, self.instance_id)
    }

    /// Parse a bare filename (no directory components).
    pub fn parse(name: &str) -> Option<Self> {
        let stem = name.strip_prefix("snapshot_")?.strip_suffix(".snapshot")?;
        let (total_changes, instance_id) = stem.split_once('_')?;
        Some(Self {
            total_changes: total_changes.parse().ok()?,
            instance_id: instance_id.parse().ok()?,
        })
    }

    /// Parse the filename component of a full path.
    pub fn parse_path(path: &Path) -> Option<Self> {
        Self::parse(path.file_name()?.to_str()?)
    }

    /// Join this filename onto a containing `snapshots/` directory.
    pub fn path_in(&self, snapshots_dir: &Path) -> PathBuf {
        snapshots_dir.join(self.format())
    }
}

/// Deterministic selection order: highest `total_changes` first, ties
/// broken lexicographically on the instance id's compact string form
/// (spec.md §4.4 "Selection").
pub fn selection_order(candidates: &mut [SnapshotFileName]) {
    candidates.sort_by(|a, b| {
        b.total_changes
            .cmp(&a.total_changes)
            .then_with(|| a.instance_id.to_compact().cmp(&b.instance_id.to_compact()))
    });
}
