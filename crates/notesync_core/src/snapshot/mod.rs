//! Two-phase-committed document snapshots (C4).
//!
//! File naming, layout, and the commit protocol below are normative per
//! spec.md §4.4/§6.1 and must not change without a format version bump.

mod filename;
mod reader;
mod writer;

pub use filename::SnapshotFileName;
pub use reader::{load_latest, read_file, ReadOutcome};
pub use writer::write_snapshot;

/// Status byte meaning "header and body written and fsynced, but not yet
/// marked complete". A reader must skip a file in this state.
pub const STATUS_WRITING: u8 = 0x00;
/// Status byte meaning the snapshot is safe to read.
pub const STATUS_COMPLETE: u8 = 0x01;

/// Byte offset of the status byte within the file: right after the 5-byte
/// framed header (4-byte magic + 1-byte version).
pub const STATUS_OFFSET: u64 = 5;
