//! Local SQLite cache database (C12).
//!
//! A relational index over the authoritative on-disk CRDT state: metadata
//! for fast listing/search, sync bookkeeping (sequence/activity watermarks,
//! cached vector clocks and document state), and durable cross-SD move
//! tracking. Never the source of truth for document content — on mismatch
//! with disk, disk wins and this cache is re-derived (spec.md §4.12).

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension, params};

use crate::clock::VectorClock;
use crate::error::{EngineError, Result};
use crate::id::EntityId;

/// Schema version this build creates and expects.
pub const SCHEMA_VERSION: u32 = 1;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);

CREATE TABLE IF NOT EXISTS storage_dirs (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    path TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS folders (
    id TEXT PRIMARY KEY,
    sd_id TEXT NOT NULL,
    parent_id TEXT,
    name TEXT NOT NULL,
    order_key TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS notes (
    id TEXT PRIMARY KEY,
    sd_id TEXT NOT NULL,
    folder_id TEXT,
    title TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    modified_at INTEGER NOT NULL,
    deleted_at INTEGER,
    pinned INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS tags (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS note_tags (
    note_id TEXT NOT NULL,
    tag_id TEXT NOT NULL,
    PRIMARY KEY (note_id, tag_id)
);

CREATE TABLE IF NOT EXISTS note_sync_state (
    note_id TEXT PRIMARY KEY,
    sd_id TEXT NOT NULL,
    vector_clock TEXT NOT NULL,
    document_state BLOB,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS folder_sync_state (
    sd_id TEXT PRIMARY KEY,
    vector_clock TEXT NOT NULL,
    document_state BLOB,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS activity_log_state (
    sd_id TEXT NOT NULL,
    foreign_log_key TEXT NOT NULL,
    last_offset INTEGER NOT NULL,
    log_file TEXT NOT NULL,
    PRIMARY KEY (sd_id, foreign_log_key)
);

CREATE TABLE IF NOT EXISTS sequence_state (
    sd_id TEXT NOT NULL,
    document_id TEXT NOT NULL,
    current_sequence INTEGER NOT NULL,
    current_file TEXT NOT NULL,
    current_offset INTEGER NOT NULL,
    PRIMARY KEY (sd_id, document_id)
);

CREATE TABLE IF NOT EXISTS note_moves (
    move_id TEXT PRIMARY KEY,
    note_id TEXT NOT NULL,
    src_sd_id TEXT NOT NULL,
    dst_sd_id TEXT NOT NULL,
    state TEXT NOT NULL,
    owner_instance_id TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE VIRTUAL TABLE IF NOT EXISTS notes_fts USING fts5(note_id UNINDEXED, title, body);
"#;

/// A row of `storage_dirs`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageDirRow {
    /// Identifier.
    pub id: EntityId,
    /// Display name.
    pub name: String,
    /// Filesystem root.
    pub path: String,
    /// Creation time, milliseconds since epoch.
    pub created_at: i64,
    /// Whether this SD is the default placement target.
    pub is_active: bool,
}

/// A row of `note_moves`, with `state` left as an opaque string: the move
/// state machine owns the `MoveState` encoding, this layer just persists it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveRow {
    /// Identifier of this move attempt.
    pub move_id: EntityId,
    /// Note being moved.
    pub note_id: EntityId,
    /// Source SD.
    pub src_sd_id: EntityId,
    /// Destination SD.
    pub dst_sd_id: EntityId,
    /// Current state, as rendered by `MoveState::to_string()`.
    pub state: String,
    /// Instance currently driving this move.
    pub owner_instance_id: EntityId,
    /// Last time this row was touched, milliseconds since epoch.
    pub updated_at: i64,
}

/// Result of the startup cleanup pass over the cache database.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DoctorReport {
    /// Notes removed because their `sd_id` no longer exists.
    pub orphaned_notes: u64,
    /// Folders removed because their `sd_id` no longer exists.
    pub orphaned_folders: u64,
    /// `note_tags` rows removed because their note no longer exists.
    pub orphaned_note_tags: u64,
    /// Tags removed because no note referenced them anymore.
    pub orphaned_tags: u64,
}

/// Thread-safe handle to the profile's local SQLite cache database.
pub struct CacheDb {
    conn: Mutex<Connection>,
}

impl CacheDb {
    /// Open (creating if absent) the cache database at `path`, running
    /// schema setup and the version check.
    pub fn open(path: &Path) -> Result<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    /// An ephemeral in-memory database, used by tests and by callers that
    /// want to rebuild the cache from disk rather than persist it.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA_SQL)?;
        let found: Option<u32> = conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
            .optional()?;
        match found {
            None => {
                conn.execute(
                    "INSERT INTO schema_version (version) VALUES (?1)",
                    params![SCHEMA_VERSION],
                )?;
            }
            Some(found) if found > SCHEMA_VERSION => {
                return Err(EngineError::SchemaTooNew {
                    found,
                    supported: SCHEMA_VERSION,
                });
            }
            Some(_) => {}
        }
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // ---- sequence_state (C5) ----

    /// Fetch the persisted `(sequence, file, offset)` for a document, if any.
    pub fn get_sequence_state(&self, sd_id: EntityId, document_id: EntityId) -> Result<Option<(u64, String, u64)>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT current_sequence, current_file, current_offset FROM sequence_state
             WHERE sd_id = ?1 AND document_id = ?2",
            params![sd_id.to_compact(), document_id.to_compact()],
            |row| {
                Ok((
                    row.get::<_, i64>(0)? as u64,
                    row.get(1)?,
                    row.get::<_, i64>(2)? as u64,
                ))
            },
        )
        .optional()
        .map_err(Into::into)
    }

    /// Persist `(sequence, file, offset)` for a document.
    pub fn set_sequence_state(
        &self,
        sd_id: EntityId,
        document_id: EntityId,
        sequence: u64,
        file: &str,
        offset: u64,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO sequence_state (sd_id, document_id, current_sequence, current_file, current_offset)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(sd_id, document_id) DO UPDATE SET
                current_sequence = excluded.current_sequence,
                current_file = excluded.current_file,
                current_offset = excluded.current_offset",
            params![
                sd_id.to_compact(),
                document_id.to_compact(),
                sequence as i64,
                file,
                offset as i64
            ],
        )?;
        Ok(())
    }

    // ---- activity_log_state (C8/C9) ----

    /// Last-read byte offset for a foreign activity/deletion log, if any.
    pub fn get_log_offset(&self, sd_id: EntityId, foreign_log_key: &str) -> Result<Option<(u64, String)>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT last_offset, log_file FROM activity_log_state WHERE sd_id = ?1 AND foreign_log_key = ?2",
            params![sd_id.to_compact(), foreign_log_key],
            |row| Ok((row.get::<_, i64>(0)? as u64, row.get(1)?)),
        )
        .optional()
        .map_err(Into::into)
    }

    /// Persist the last-read offset for a foreign activity/deletion log.
    pub fn set_log_offset(&self, sd_id: EntityId, foreign_log_key: &str, offset: u64, log_file: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO activity_log_state (sd_id, foreign_log_key, last_offset, log_file)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(sd_id, foreign_log_key) DO UPDATE SET
                last_offset = excluded.last_offset,
                log_file = excluded.log_file",
            params![sd_id.to_compact(), foreign_log_key, offset as i64, log_file],
        )?;
        Ok(())
    }

    /// Remove specific stale foreign-log keys by name (spec.md §4.8 "Orphan
    /// cleanup": callers determine staleness from file mtimes, since this
    /// table has no timestamp column of its own).
    pub fn remove_log_offset_keys(&self, sd_id: EntityId, keys: &[String]) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        let mut removed = 0u64;
        for key in keys {
            removed += conn.execute(
                "DELETE FROM activity_log_state WHERE sd_id = ?1 AND foreign_log_key = ?2",
                params![sd_id.to_compact(), key],
            )? as u64;
        }
        Ok(removed)
    }

    // ---- note_sync_state / folder_sync_state (C6) ----

    /// Cached vector clock and document state for a note, if present.
    pub fn get_note_sync_state(&self, note_id: EntityId) -> Result<Option<(EntityId, VectorClock, Option<Vec<u8>>)>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT sd_id, vector_clock, document_state FROM note_sync_state WHERE note_id = ?1",
            params![note_id.to_compact()],
            |row| {
                let sd_id: String = row.get(0)?;
                let clock_json: String = row.get(1)?;
                let state: Option<Vec<u8>> = row.get(2)?;
                Ok((sd_id, clock_json, state))
            },
        )
        .optional()?
        .map(|(sd_id, clock_json, state)| {
            let sd_id = sd_id.parse()?;
            let clock: VectorClock = serde_json::from_str(&clock_json)?;
            Ok((sd_id, clock, state))
        })
        .transpose()
    }

    /// Persist a note's vector clock and cached document state.
    pub fn set_note_sync_state(
        &self,
        note_id: EntityId,
        sd_id: EntityId,
        clock: &VectorClock,
        state: &[u8],
        updated_at: i64,
    ) -> Result<()> {
        let clock_json = serde_json::to_string(clock)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO note_sync_state (note_id, sd_id, vector_clock, document_state, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(note_id) DO UPDATE SET
                sd_id = excluded.sd_id,
                vector_clock = excluded.vector_clock,
                document_state = excluded.document_state,
                updated_at = excluded.updated_at",
            params![note_id.to_compact(), sd_id.to_compact(), clock_json, state, updated_at],
        )?;
        Ok(())
    }

    /// Cached vector clock and document state for an SD's folder tree.
    pub fn get_folder_sync_state(&self, sd_id: EntityId) -> Result<Option<(VectorClock, Option<Vec<u8>>)>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT vector_clock, document_state FROM folder_sync_state WHERE sd_id = ?1",
            params![sd_id.to_compact()],
            |row| {
                let clock_json: String = row.get(0)?;
                let state: Option<Vec<u8>> = row.get(1)?;
                Ok((clock_json, state))
            },
        )
        .optional()?
        .map(|(clock_json, state)| {
            let clock: VectorClock = serde_json::from_str(&clock_json)?;
            Ok((clock, state))
        })
        .transpose()
    }

    /// Persist an SD folder tree's vector clock and cached document state.
    pub fn set_folder_sync_state(&self, sd_id: EntityId, clock: &VectorClock, state: &[u8], updated_at: i64) -> Result<()> {
        let clock_json = serde_json::to_string(clock)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO folder_sync_state (sd_id, vector_clock, document_state, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(sd_id) DO UPDATE SET
                vector_clock = excluded.vector_clock,
                document_state = excluded.document_state,
                updated_at = excluded.updated_at",
            params![sd_id.to_compact(), clock_json, state, updated_at],
        )?;
        Ok(())
    }

    /// Mark a note tombstoned once its deletion feed entry is observed with
    /// the corresponding CRDT update already visible (spec.md §4.9).
    pub fn mark_note_deleted(&self, note_id: EntityId, deleted_at: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE notes SET deleted_at = ?1 WHERE id = ?2",
            params![deleted_at, note_id.to_compact()],
        )?;
        Ok(())
    }

    /// Repoint a note at a new storage directory and clear its folder
    /// binding (the destination SD has no matching folder tree entry yet).
    /// Used by the `db_updated` step of a cross-SD move.
    pub fn update_note_sd(&self, note_id: EntityId, new_sd_id: EntityId) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE notes SET sd_id = ?1, folder_id = NULL WHERE id = ?2",
            params![new_sd_id.to_compact(), note_id.to_compact()],
        )?;
        Ok(())
    }

    // ---- notes_fts (C12 full-text search) ----

    /// Replace one note's indexed text. Note content lives behind the opaque
    /// CRDT byte interface this crate deliberately doesn't peek into, so
    /// callers extract plain text from their loaded document and feed it
    /// here; this crate only owns the index, not the extraction.
    pub fn index_note_text(&self, note_id: EntityId, title: &str, body: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM notes_fts WHERE note_id = ?1", params![note_id.to_compact()])?;
        conn.execute(
            "INSERT INTO notes_fts (note_id, title, body) VALUES (?1, ?2, ?3)",
            params![note_id.to_compact(), title, body],
        )?;
        Ok(())
    }

    /// Drop a note's indexed text, e.g. once its deletion tombstone lands.
    pub fn remove_note_text(&self, note_id: EntityId) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM notes_fts WHERE note_id = ?1", params![note_id.to_compact()])?;
        Ok(())
    }

    /// Drop and refill the entire index from `entries`, used on reload when
    /// a caller has re-extracted text for every loaded note rather than
    /// indexing one at a time (spec.md §4.12 "FTS index... rebuilt... on
    /// reload").
    pub fn rebuild_fts(&self, entries: &[(EntityId, String, String)]) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;
        tx.execute("DELETE FROM notes_fts", [])?;
        for (note_id, title, body) in entries {
            tx.execute(
                "INSERT INTO notes_fts (note_id, title, body) VALUES (?1, ?2, ?3)",
                params![note_id.to_compact(), title, body],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Full-text search over indexed note titles/bodies, newest-ranked match
    /// first.
    pub fn search_notes(&self, query: &str) -> Result<Vec<EntityId>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT note_id FROM notes_fts WHERE notes_fts MATCH ?1 ORDER BY rank")?;
        let rows = stmt.query_map(params![query], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            let id: String = row?;
            if let Ok(parsed) = id.parse() {
                out.push(parsed);
            }
        }
        Ok(out)
    }

    // ---- note_moves (C11) ----

    /// Insert a new move row. Fails with `Conflict` if one already exists
    /// for this `move_id` (callers use `note_id` uniqueness at a higher
    /// layer per spec.md §4.11's "second initiator defers" rule).
    pub fn insert_move(&self, row: &MoveRow) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO note_moves (move_id, note_id, src_sd_id, dst_sd_id, state, owner_instance_id, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                row.move_id.to_compact(),
                row.note_id.to_compact(),
                row.src_sd_id.to_compact(),
                row.dst_sd_id.to_compact(),
                row.state,
                row.owner_instance_id.to_compact(),
                row.updated_at,
            ],
        )?;
        Ok(())
    }

    /// Find the in-flight move row for a note, if any.
    pub fn get_move_for_note(&self, note_id: EntityId) -> Result<Option<MoveRow>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT move_id, note_id, src_sd_id, dst_sd_id, state, owner_instance_id, updated_at
             FROM note_moves WHERE note_id = ?1",
            params![note_id.to_compact()],
            row_to_move,
        )
        .optional()
        .map_err(Into::into)
    }

    /// List every move row, for takeover/recovery scans on startup.
    pub fn list_moves(&self) -> Result<Vec<MoveRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT move_id, note_id, src_sd_id, dst_sd_id, state, owner_instance_id, updated_at FROM note_moves",
        )?;
        let rows = stmt.query_map([], row_to_move)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// Update a move's state and owner, conditional on the prior owner
    /// matching `expected_owner` (used by both self-progress and takeover).
    pub fn update_move(&self, move_id: EntityId, new_state: &str, new_owner: EntityId, expected_owner: EntityId, updated_at: i64) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE note_moves SET state = ?1, owner_instance_id = ?2, updated_at = ?3
             WHERE move_id = ?4 AND owner_instance_id = ?5",
            params![new_state, new_owner.to_compact(), updated_at, move_id.to_compact(), expected_owner.to_compact()],
        )?;
        Ok(changed > 0)
    }

    /// Remove a completed or rolled-back move row.
    pub fn delete_move(&self, move_id: EntityId) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM note_moves WHERE move_id = ?1", params![move_id.to_compact()])?;
        Ok(())
    }

    // ---- storage_dirs ----

    /// List all registered storage directories.
    pub fn list_storage_dirs(&self) -> Result<Vec<StorageDirRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT id, name, path, created_at, is_active FROM storage_dirs")?;
        let rows = stmt.query_map([], |row| {
            Ok(StorageDirRow {
                id: parse_id_col(row, 0)?,
                name: row.get(1)?,
                path: row.get(2)?,
                created_at: row.get(3)?,
                is_active: row.get::<_, i64>(4)? != 0,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// Insert or update a storage directory's metadata.
    pub fn upsert_storage_dir(&self, row: &StorageDirRow) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO storage_dirs (id, name, path, created_at, is_active) VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET name = excluded.name, path = excluded.path, is_active = excluded.is_active",
            params![row.id.to_compact(), row.name, row.path, row.created_at, row.is_active as i64],
        )?;
        Ok(())
    }

    /// Mark exactly one storage directory active, clearing the rest.
    pub fn set_active_storage_dir(&self, sd_id: EntityId) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("UPDATE storage_dirs SET is_active = 0", [])?;
        conn.execute(
            "UPDATE storage_dirs SET is_active = 1 WHERE id = ?1",
            params![sd_id.to_compact()],
        )?;
        Ok(())
    }

    /// Remove a storage directory's metadata row (its notes/folders are left
    /// for `doctor()` to sweep up next run).
    pub fn delete_storage_dir(&self, sd_id: EntityId) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM storage_dirs WHERE id = ?1", params![sd_id.to_compact()])?;
        Ok(())
    }

    // ---- maintenance ----

    /// Remove notes/folders/tag-links whose `sd_id` no longer has a
    /// `storage_dirs` row, and tags left with no remaining associations
    /// (spec.md §4.12 invariants).
    pub fn doctor(&self) -> Result<DoctorReport> {
        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;

        let orphaned_notes = tx.execute(
            "DELETE FROM notes WHERE sd_id NOT IN (SELECT id FROM storage_dirs)",
            [],
        )? as u64;
        let orphaned_folders = tx.execute(
            "DELETE FROM folders WHERE sd_id NOT IN (SELECT id FROM storage_dirs)",
            [],
        )? as u64;
        let orphaned_note_tags = tx.execute(
            "DELETE FROM note_tags WHERE note_id NOT IN (SELECT id FROM notes)",
            [],
        )? as u64;
        let orphaned_tags = tx.execute(
            "DELETE FROM tags WHERE id NOT IN (SELECT DISTINCT tag_id FROM note_tags)",
            [],
        )? as u64;

        tx.commit()?;
        Ok(DoctorReport {
            orphaned_notes,
            orphaned_folders,
            orphaned_note_tags,
            orphaned_tags,
        })
    }
}

fn row_to_move(row: &rusqlite::Row<'_>) -> rusqlite::Result<MoveRow> {
    Ok(MoveRow {
        move_id: parse_id_col(row, 0)?,
        note_id: parse_id_col(row, 1)?,
        src_sd_id: parse_id_col(row, 2)?,
        dst_sd_id: parse_id_col(row, 3)?,
        state: row.get(4)?,
        owner_instance_id: parse_id_col(row, 5)?,
        updated_at: row.get(6)?,
    })
}

fn parse_id_col(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<EntityId> {
    let s: String = row.get(idx)?;
    s.parse().map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, "invalid entity id".into())
    })
}
