//! Two-phase snapshot commit (C4).

use std::path::{Path, PathBuf};

use crate::clock::VectorClock;
use crate::codec;
use crate::error::Result;
use crate::fs::FileSystem;
use crate::id::EntityId;

use super::filename::SnapshotFileName;
use super::{STATUS_COMPLETE, STATUS_OFFSET, STATUS_WRITING};

/// Write a new snapshot for `instance_id` holding `clock` and `state`,
/// naming it by `clock.total_changes()`.
///
/// Phase 1 writes the full file — header, a `writing` status byte, the
/// vector clock, and the document state — and fsyncs it under its final
/// name. Phase 2 patches just the status byte to `complete` and fsyncs
/// again. A reader that observes the file between phases sees `writing` and
/// skips it; a crash between phases leaves a harmless, ignorable file
/// rather than a half-applied in-place edit.
pub fn write_snapshot(
    fs: &dyn FileSystem,
    snapshots_dir: &Path,
    instance_id: EntityId,
    clock: &VectorClock,
    state: &[u8],
) -> Result<PathBuf> {
    let name = SnapshotFileName {
        total_changes: clock.total_changes(),
        instance_id,
    };
    let path = name.path_in(snapshots_dir);

    let mut buf = Vec::new();
    codec::write_header(&mut buf, codec::SNAPSHOT_MAGIC)?;
    debug_assert_eq!(buf.len() as u64, STATUS_OFFSET);
    buf.push(STATUS_WRITING);
    clock.encode(&mut buf)?;
    buf.extend_from_slice(state);

    fs.create_dir_all(snapshots_dir)?;
    fs.write_atomic(&path, &buf)?;
    fs.write_at(&path, STATUS_OFFSET, &[STATUS_COMPLETE])?;
    Ok(path)
}
