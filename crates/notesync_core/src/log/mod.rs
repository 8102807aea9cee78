//! Append-only CRDT log: writer (C2) and reader (C3).
//!
//! File naming, record framing, and the crash-recovery rules below are
//! normative per spec.md §4.2/§4.3/§6.1 and must not change without a
//! format version bump (see [`crate::codec::FORMAT_VERSION`]).

mod filename;
mod reader;
mod writer;

pub use filename::LogFileName;
pub use reader::{LogReader, ReadOutcome};
pub use writer::LogWriter;

use crate::id::EntityId;

/// Maximum size of a single `.crdtlog` file before rotation (spec.md §6.4).
pub const DEFAULT_ROTATION_BYTES: u64 = 10 * 1024 * 1024;

/// A single decoded log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Milliseconds since epoch when this update was written.
    pub timestamp_millis: u64,
    /// Per-instance monotonic sequence number stamped by the sequence
    /// manager (C5).
    pub sequence: u64,
    /// Opaque CRDT update bytes, meaningless to this crate.
    pub data: Vec<u8>,
}

/// Record framing: `varint(length) ‖ u64_be(timestamp) ‖ varint(sequence) ‖ data`.
/// A record with `length == 0` is the termination sentinel.
pub(crate) fn encode_record(buf: &mut Vec<u8>, record: &LogRecord) -> crate::error::Result<()> {
    let mut body = Vec::new();
    crate::codec::write_u64_be(&mut body, record.timestamp_millis)?;
    crate::codec::write_varint(&mut body, record.sequence)?;
    body.extend_from_slice(&record.data);
    crate::codec::write_varint(buf, body.len() as u64)?;
    buf.extend_from_slice(&body);
    Ok(())
}

/// Encode the termination sentinel: a zero-length record.
pub(crate) fn encode_sentinel(buf: &mut Vec<u8>) -> crate::error::Result<()> {
    crate::codec::write_varint(buf, 0)
}

/// Identity of the document a log file belongs to, used to derive its
/// containing directory (`notes/{noteId}/logs/` or `folders/logs/`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentScope {
    /// A note's own document.
    Note(EntityId),
    /// The single per-SD folder tree document.
    FolderTree,
}
