//! Per-(SD, document, instance) sequence allocation (C5).

use std::path::Path;

use crate::db::CacheDb;
use crate::error::Result;
use crate::fs::FileSystem;
use crate::id::EntityId;
use crate::log::{LogFileName, LogReader};

/// Current write position for one `(SD, document, instance)` triple: the
/// last sequence this instance stamped, and where in its active log file
/// that record ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequencePosition {
    /// Last sequence number stamped by this instance for this document.
    pub sequence: u64,
    /// Active log filename sequence numbers are currently being stamped into.
    pub file: String,
    /// Byte offset immediately after the last record in `file`.
    pub offset: u64,
}

impl SequencePosition {
    fn fresh() -> Self {
        Self {
            sequence: 0,
            file: String::new(),
            offset: 0,
        }
    }
}

/// Loads, persists, and (on crash-recovery) rebuilds sequence positions.
pub struct SequenceManager<'a> {
    db: &'a CacheDb,
}

impl<'a> SequenceManager<'a> {
    /// Bind a sequence manager to the profile's cache database.
    pub fn new(db: &'a CacheDb) -> Self {
        Self { db }
    }

    /// Load the current position for `(sd_id, document_id)`, validating the
    /// persisted state against the filesystem. If the persisted file exists
    /// and is at least as long as the persisted offset, the DB is trusted
    /// (fast path); otherwise the log directory is rescanned for this
    /// instance's own files to rebuild it (spec.md §4.5).
    pub fn load_or_rescan(
        &self,
        fs: &dyn FileSystem,
        sd_id: EntityId,
        document_id: EntityId,
        instance_id: EntityId,
        logs_dir: &Path,
    ) -> Result<SequencePosition> {
        if let Some((sequence, file, offset)) = self.db.get_sequence_state(sd_id, document_id)? {
            let path = logs_dir.join(&file);
            if fs.file_len(&path).map(|len| len >= offset).unwrap_or(false) {
                return Ok(SequencePosition { sequence, file, offset });
            }
        }

        let rebuilt = rescan(fs, logs_dir, instance_id)?;
        self.db.set_sequence_state(sd_id, document_id, rebuilt.sequence, &rebuilt.file, rebuilt.offset)?;
        Ok(rebuilt)
    }

    /// Record a freshly stamped sequence, persisting it immediately — the
    /// caller invokes this only after the corresponding log append has been
    /// fsynced, preserving the "sequence visible implies durable" invariant.
    pub fn record(&self, sd_id: EntityId, document_id: EntityId, position: &SequencePosition) -> Result<()> {
        self.db
            .set_sequence_state(sd_id, document_id, position.sequence, &position.file, position.offset)
    }
}

/// Rebuild a position by replaying every log file this instance owns in
/// `logs_dir`, in creation order, summing record lengths to the final
/// offset of the last (possibly unfinalized) file.
fn rescan(fs: &dyn FileSystem, logs_dir: &Path, instance_id: EntityId) -> Result<SequencePosition> {
    let entries = fs.list_dir(logs_dir)?;
    let mut own_files: Vec<LogFileName> = entries
        .iter()
        .filter_map(|p| LogFileName::parse_path(p))
        .filter(|n| n.instance_id == instance_id)
        .collect();
    own_files.sort_by_key(|n| n.creation_millis);

    let mut position = SequencePosition::fresh();
    for name in own_files {
        let path = name.path_in(logs_dir);
        let outcome = LogReader::read_file(fs, &path)?;
        if let Some(last) = outcome.records.last() {
            position.sequence = last.sequence;
        }
        position.file = name.format();
        position.offset = fs.file_len(&path).unwrap_or(0);
    }
    Ok(position)
}
