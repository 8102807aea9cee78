//! Snapshot reading, including highest-`total_changes` selection with
//! fallback to the next candidate on corruption (C4).

use std::io::Cursor;
use std::path::Path;

use crate::clock::VectorClock;
use crate::codec;
use crate::error::{EngineError, Result};
use crate::fs::FileSystem;

use super::filename::{selection_order, SnapshotFileName};
use super::{STATUS_COMPLETE, STATUS_OFFSET};

/// The decoded contents of one complete snapshot file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadOutcome {
    /// Vector clock embedded in the snapshot.
    pub clock: VectorClock,
    /// Raw encoded document state, opaque to this crate.
    pub state: Vec<u8>,
}

/// Read and decode a single snapshot file, returning `Ok(None)` if its
/// status byte marks it incomplete (readers must skip these, never error).
pub fn read_file(fs: &dyn FileSystem, path: &Path) -> Result<Option<ReadOutcome>> {
    let bytes = fs.read(path).map_err(|source| EngineError::IoAt {
        path: path.to_path_buf(),
        source,
    })?;
    let mut cursor = Cursor::new(bytes.as_slice());
    codec::read_header(&mut cursor, codec::SNAPSHOT_MAGIC, path)?;

    if (STATUS_OFFSET as usize) >= bytes.len() {
        return Err(EngineError::Corrupt {
            reason: "file too short for status byte".to_string(),
            path: path.to_path_buf(),
        });
    }
    let status = bytes[STATUS_OFFSET as usize];
    if status != STATUS_COMPLETE {
        return Ok(None);
    }
    cursor.set_position(STATUS_OFFSET + 1);

    let clock = VectorClock::decode(&mut cursor)?;
    let state = bytes[cursor.position() as usize..].to_vec();
    Ok(Some(ReadOutcome { clock, state }))
}

/// Select and load the best snapshot in `snapshots_dir`: highest
/// `total_changes`, falling back to the next candidate if a file is
/// incomplete or fails to parse. Returns `Ok(None)` if no usable snapshot
/// exists, which is normal for a document that hasn't rotated yet.
pub fn load_latest(fs: &dyn FileSystem, snapshots_dir: &Path) -> Result<Option<ReadOutcome>> {
    let entries = fs.list_dir(snapshots_dir)?;
    let mut candidates: Vec<SnapshotFileName> = entries
        .iter()
        .filter_map(|p| SnapshotFileName::parse_path(p))
        .collect();
    selection_order(&mut candidates);

    for candidate in candidates {
        let path = candidate.path_in(snapshots_dir);
        match read_file(fs, &path) {
            Ok(Some(outcome)) => return Ok(Some(outcome)),
            Ok(None) => continue,
            Err(_) => continue,
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::InMemoryFileSystem;
    use crate::id::EntityId;
    use crate::snapshot::write_snapshot;

    #[test]
    fn incomplete_snapshot_is_skipped_not_errored() {
        let fs = InMemoryFileSystem::new();
        let mut buf = Vec::new();
        codec::write_header(&mut buf, codec::SNAPSHOT_MAGIC).unwrap();
        buf.push(super::super::STATUS_WRITING);
        let clock = VectorClock::new();
        clock.encode(&mut buf).unwrap();
        fs.write_atomic(Path::new("/s/snapshot_0_abc.snapshot"), &buf).unwrap();

        let outcome = read_file(&fs, Path::new("/s/snapshot_0_abc.snapshot")).unwrap();
        assert!(outcome.is_none());
    }

    #[test]
    fn load_latest_falls_back_past_corrupt_candidate() {
        let fs = InMemoryFileSystem::new();
        let instance_a = EntityId::new_random();
        let instance_b = EntityId::new_random();

        let mut low_clock = VectorClock::new();
        low_clock.advance(instance_a, 5, 10, "a.crdtlog");
        write_snapshot(&fs, Path::new("/s"), instance_a, &low_clock, b"low-state").unwrap();

        // Higher total_changes but corrupt: readers must fall back.
        let mut corrupt = Vec::new();
        codec::write_header(&mut corrupt, codec::SNAPSHOT_MAGIC).unwrap();
        corrupt.push(super::super::STATUS_COMPLETE);
        corrupt.extend_from_slice(b"not a valid vector clock at all");
        fs.write_atomic(
            Path::new(&format!("/s/snapshot_999_{instance_b}.snapshot")),
            &corrupt,
        )
        .unwrap();

        let outcome = load_latest(&fs, Path::new("/s")).unwrap().unwrap();
        assert_eq!(outcome.state, b"low-state");
    }
}
