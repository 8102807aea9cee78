//! Packed update files (C10 "Packing"): a batched rewrite of contiguous,
//! already-fsynced updates from one instance, reducing file counts in a
//! document's `packs/` directory.
//!
//! The on-disk layout is this crate's own invention (spec.md leaves pack
//! bytes unspecified, normatively fixing only the filename and the
//! write-then-delete replacement discipline) but follows the same framed-
//! header shape as logs and snapshots for consistency.

use std::io::Cursor;
use std::path::{Path, PathBuf};

use crate::codec;
use crate::error::{EngineError, Result};
use crate::fs::FileSystem;
use crate::id::EntityId;
use crate::log::{encode_record, LogRecord};

/// Magic bytes for `.yjson` pack files.
pub const PACK_MAGIC: [u8; 4] = *b"NCPK";

/// A parsed `{instanceId}_pack_{startSeq}-{endSeq}.yjson` filename.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackFileName {
    /// Instance whose updates this pack holds (packing only ever covers an
    /// instance's own files).
    pub instance_id: EntityId,
    /// First sequence covered (inclusive).
    pub start_seq: u64,
    /// Last sequence covered (inclusive).
    pub end_seq: u64,
}

impl PackFileName {
    /// Build the filename (without directory) for these parameters.
    pub fn format(&self) -> String {
        format!("{}_pack_{}-{}.yjson", self.instance_id, self.start_seq, self.end_seq)
    }

    /// Parse a bare filename (no directory components).
    pub fn parse(name: &str) -> Option<Self> {
        let stem = name.strip_suffix(".yjson")?;
        let (instance_part, range_part) = stem.split_once("_pack_")?;
        let (start, end) = range_part.split_once('-')?;
        Some(Self {
            instance_id: instance_part.parse().ok()?,
            start_seq: start.parse().ok()?,
            end_seq: end.parse().ok()?,
        })
    }

    /// Parse the filename component of a full path.
    pub fn parse_path(path: &Path) -> Option<Self> {
        Self::parse(path.file_name()?.to_str()?)
    }

    /// Join this filename onto a containing `packs/` directory.
    pub fn path_in(&self, packs_dir: &Path) -> PathBuf {
        packs_dir.join(self.format())
    }

    /// Whether this pack could contain a record with sequence `seq`.
    pub fn covers(&self, seq: u64) -> bool {
        seq >= self.start_seq && seq <= self.end_seq
    }
}

/// Atomically write a pack file for a contiguous, sequence-sorted run of
/// records. Callers delete the source log/records only after this returns
/// successfully (spec.md §4.10 "write-then-delete").
pub fn write_pack(fs: &dyn FileSystem, packs_dir: &Path, instance_id: EntityId, records: &[LogRecord]) -> Result<PathBuf> {
    let (start_seq, end_seq) = match (records.first(), records.last()) {
        (Some(first), Some(last)) => (first.sequence, last.sequence),
        _ => {
            return Err(EngineError::Validation {
                field: "records".to_string(),
                message: "cannot pack an empty run".to_string(),
            });
        }
    };
    let name = PackFileName { instance_id, start_seq, end_seq };

    let mut buf = Vec::new();
    codec::write_header(&mut buf, PACK_MAGIC)?;
    codec::write_varint(&mut buf, records.len() as u64)?;
    for record in records {
        encode_record(&mut buf, record)?;
    }

    fs.create_dir_all(packs_dir)?;
    let path = name.path_in(packs_dir);
    fs.write_atomic(&path, &buf)?;
    Ok(path)
}

/// Read every record out of a pack file, in file (sequence) order.
pub fn read_pack(fs: &dyn FileSystem, path: &Path) -> Result<Vec<LogRecord>> {
    let bytes = fs.read(path).map_err(|source| EngineError::IoAt {
        path: path.to_path_buf(),
        source,
    })?;
    let mut cursor = Cursor::new(bytes.as_slice());
    codec::read_header(&mut cursor, PACK_MAGIC, path)?;
    let count = codec::read_varint(&mut cursor)?.ok_or_else(|| EngineError::Corrupt {
        reason: "truncated pack entry count".to_string(),
        path: path.to_path_buf(),
    })?;

    let mut records = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let length = codec::read_varint(&mut cursor)?.ok_or_else(|| EngineError::Corrupt {
            reason: "pack ended before declared entry count".to_string(),
            path: path.to_path_buf(),
        })?;
        let start = cursor.position() as usize;
        let end = start + length as usize;
        let buf = *cursor.get_ref();
        if end > buf.len() {
            return Err(EngineError::Corrupt {
                reason: "pack record length exceeds file".to_string(),
                path: path.to_path_buf(),
            });
        }
        let mut body = Cursor::new(&buf[start..end]);
        let timestamp_millis = codec::read_u64_be(&mut body)?;
        let sequence = codec::read_varint(&mut body)?.ok_or_else(|| EngineError::Corrupt {
            reason: "pack record missing sequence".to_string(),
            path: path.to_path_buf(),
        })?;
        let data = buf[start + body.position() as usize..end].to_vec();
        cursor.set_position(end as u64);
        records.push(LogRecord { timestamp_millis, sequence, data });
    }
    Ok(records)
}
