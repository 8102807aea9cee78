//! Local-first CRDT storage and synchronization engine for a cross-device
//! note-taking application: append-only per-document logs, two-phase-
//! committed snapshots, packed update files, cross-instance discovery via
//! polling activity/deletion feeds, a SQLite cache database, and a
//! cross-storage-directory move state machine.
#![warn(missing_docs)]

/// Entity identifiers (notes, folders, instances, profiles, storage
/// directories).
pub mod id;

/// Unified error type and the boundary error taxonomy.
pub mod error;

/// Filesystem abstraction every component writes through.
pub mod fs;

/// Shared binary framing: headers, varints, and fixed-width integers.
pub mod codec;

/// Per-document vector clocks.
pub mod clock;

/// Pluggable CRDT capability interface.
pub mod crdt;

/// Append-only CRDT log: writer and reader.
pub mod log;

/// Two-phase-committed document snapshots.
pub mod snapshot;

/// Packed update files.
pub mod pack;

/// Per-(SD, document, instance) sequence allocation.
pub mod sequence;

/// Append-only change feeds (activity and deletion logs share this shape).
pub mod activity;

/// Cross-instance discovery by polling foreign feed files.
pub mod sync_poller;

/// Local SQLite cache database.
pub mod db;

/// Document load/unload, cold-load, and update application.
pub mod document;

/// Deletion feed writing and polling.
pub mod deletion;

/// Cross-storage-directory move state machine.
pub mod mv;

/// Pack/snapshot/GC background jobs.
pub mod gc;

/// Polling-based file change notification, with an optional native backend
/// extension point.
pub mod watcher;

/// Engine configuration.
pub mod config;

/// Backup and restore of a storage directory's on-disk tree.
pub mod backup;

/// Cancellable-ticket scheduler for periodic background work.
pub mod scheduler;

/// Aggregated orphan/stale/stuck-move diagnostics.
pub mod diagnostics;

/// Top-level per-profile orchestrator exposing the public API.
pub mod engine;

pub use error::{EngineError, Result};
pub use id::EntityId;
