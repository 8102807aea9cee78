//! Cross-SD move state machine (C11): a crash-safe, multi-step relocation
//! of a note from one storage directory to another, durably tracked in the
//! `note_moves` table (spec.md §4.11).

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::db::{CacheDb, MoveRow};
use crate::deletion::DeletionLogger;
use crate::error::{EngineError, Result};
use crate::fs::FileSystem;
use crate::id::EntityId;

/// Owner-absence threshold past which another instance may take over a
/// stalled move (spec.md §4.11 "Takeover protocol").
pub const OWNER_STALE_MILLIS: i64 = 5 * 60 * 1000;

/// One step of the move state machine. Stored in `note_moves.state` as its
/// [`fmt::Display`] rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveState {
    /// Row recorded; about to copy files.
    Initiated,
    /// Files copied; about to fsync the destination directory.
    Copying,
    /// Destination fsynced; about to repoint the cache DB.
    FilesCopied,
    /// Cache repointed; about to clean up the source.
    DbUpdated,
    /// Source deletion entry written and files removed; about to finish.
    Cleaning,
    /// Terminal: the row is removed rather than ever observed in this state.
    Completed,
}

impl fmt::Display for MoveState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MoveState::Initiated => "initiated",
            MoveState::Copying => "copying",
            MoveState::FilesCopied => "files_copied",
            MoveState::DbUpdated => "db_updated",
            MoveState::Cleaning => "cleaning",
            MoveState::Completed => "completed",
        };
        f.write_str(s)
    }
}

impl FromStr for MoveState {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "initiated" => Ok(MoveState::Initiated),
            "copying" => Ok(MoveState::Copying),
            "files_copied" => Ok(MoveState::FilesCopied),
            "db_updated" => Ok(MoveState::DbUpdated),
            "cleaning" => Ok(MoveState::Cleaning),
            "completed" => Ok(MoveState::Completed),
            other => Err(EngineError::Corrupt {
                reason: format!("unknown move state {other:?}"),
                path: std::path::PathBuf::new(),
            }),
        }
    }
}

/// Drives move rows through their state transitions against the cache DB
/// and the two storage directories' filesystems.
pub struct MoveManager<'a, F: FileSystem> {
    fs: &'a F,
    db: &'a CacheDb,
}

impl<'a, F: FileSystem> MoveManager<'a, F> {
    /// Bind a move manager to the filesystem and cache DB shared across both
    /// storage directories a move might span.
    pub fn new(fs: &'a F, db: &'a CacheDb) -> Self {
        Self { fs, db }
    }

    /// Begin a move, failing if one is already in flight for this note (the
    /// "second initiator defers" rule — spec.md §4.11 "Concurrent moves").
    pub fn begin_move(
        &self,
        note_id: EntityId,
        src_sd_id: EntityId,
        dst_sd_id: EntityId,
        owner_instance_id: EntityId,
        now: i64,
    ) -> Result<EntityId> {
        if self.db.get_move_for_note(note_id)?.is_some() {
            return Err(EngineError::Conflict(format!("a move is already in progress for note {note_id}")));
        }
        let move_id = EntityId::new_random();
        self.db.insert_move(&MoveRow {
            move_id,
            note_id,
            src_sd_id,
            dst_sd_id,
            state: MoveState::Initiated.to_string(),
            owner_instance_id,
            updated_at: now,
        })?;
        Ok(move_id)
    }

    /// Advance a note's in-flight move by exactly one transition, performing
    /// the next state's entry action. Returns `Ok(None)` if no move is in
    /// flight, or `Some(Completed)` once the row has been removed.
    pub fn advance(&self, note_id: EntityId, src_root: &Path, dst_root: &Path, profile_id: EntityId, now: i64) -> Result<Option<MoveState>> {
        let Some(row) = self.db.get_move_for_note(note_id)? else {
            return Ok(None);
        };
        let current: MoveState = row.state.parse()?;
        let owner = row.owner_instance_id;

        let next = match current {
            MoveState::Initiated => {
                copy_note_tree(self.fs, row.note_id, src_root, dst_root)?;
                MoveState::Copying
            }
            MoveState::Copying => {
                let dst_note_dir = dst_root.join("notes").join(row.note_id.to_compact());
                self.fs.fsync_dir(&dst_note_dir)?;
                MoveState::FilesCopied
            }
            MoveState::FilesCopied => {
                self.db.update_note_sd(row.note_id, row.dst_sd_id)?;
                MoveState::DbUpdated
            }
            MoveState::DbUpdated => {
                let logger = DeletionLogger::open(self.fs, src_root, profile_id, owner)?;
                logger.record_deletion(row.note_id, profile_id, 0)?;
                remove_note_tree(self.fs, row.note_id, src_root)?;
                MoveState::Cleaning
            }
            MoveState::Cleaning => MoveState::Completed,
            MoveState::Completed => return Ok(Some(MoveState::Completed)),
        };

        if next == MoveState::Completed {
            self.db.delete_move(row.move_id)?;
        } else {
            self.db.update_move(row.move_id, &next.to_string(), owner, owner, now)?;
        }
        Ok(Some(next))
    }

    /// Drive a move to completion, one `advance` at a time.
    pub fn drive_to_completion(&self, note_id: EntityId, src_root: &Path, dst_root: &Path, profile_id: EntityId, now: i64) -> Result<()> {
        while !matches!(self.advance(note_id, src_root, dst_root, profile_id, now)?, None | Some(MoveState::Completed)) {}
        Ok(())
    }

    /// List every in-flight move, for a startup recovery scan.
    pub fn list_pending(&self) -> Result<Vec<MoveRow>> {
        self.db.list_moves()
    }

    /// Take over a move whose owner has been silent for longer than
    /// `stale_after_millis`, so another instance can resume it.
    pub fn takeover_if_stale(&self, note_id: EntityId, new_owner: EntityId, now: i64, stale_after_millis: i64) -> Result<bool> {
        let Some(row) = self.db.get_move_for_note(note_id)? else {
            return Ok(false);
        };
        if now - row.updated_at < stale_after_millis {
            return Ok(false);
        }
        self.db.update_move(row.move_id, &row.state, new_owner, row.owner_instance_id, now)
    }

    /// Cancel a move, rolling back any partially-copied destination files.
    /// Only safe before `db_updated` (spec.md §4.11 "Cancellation / rollback").
    pub fn cancel_move(&self, note_id: EntityId, dst_root: &Path) -> Result<bool> {
        let Some(row) = self.db.get_move_for_note(note_id)? else {
            return Ok(false);
        };
        let state: MoveState = row.state.parse()?;
        if matches!(state, MoveState::DbUpdated | MoveState::Cleaning | MoveState::Completed) {
            return Err(EngineError::Conflict("cannot cancel a move past db_updated".to_string()));
        }
        remove_note_tree(self.fs, row.note_id, dst_root)?;
        self.db.delete_move(row.move_id)?;
        Ok(true)
    }
}

fn copy_dir_flat(fs: &dyn FileSystem, src: &Path, dst: &Path) -> Result<()> {
    if !fs.exists(src) {
        return Ok(());
    }
    fs.create_dir_all(dst)?;
    for path in fs.list_dir(src)? {
        if fs.is_dir(&path) {
            continue;
        }
        if let Some(name) = path.file_name() {
            fs.copy_file(&path, &dst.join(name))?;
        }
    }
    Ok(())
}

fn remove_dir_flat(fs: &dyn FileSystem, dir: &Path) -> Result<()> {
    if !fs.exists(dir) {
        return Ok(());
    }
    for path in fs.list_dir(dir)? {
        if !fs.is_dir(&path) {
            fs.remove_file(&path)?;
        }
    }
    Ok(())
}

/// Copy a note's `logs/`, `snapshots/`, and `packs/` directories from
/// `src_root` to `dst_root`. All three are required: packing deletes the
/// log files it fully covers, so packed sequences can live only in
/// `packs/` (spec.md §4.11 "copying").
fn copy_note_tree(fs: &dyn FileSystem, note_id: EntityId, src_root: &Path, dst_root: &Path) -> Result<()> {
    let src_note = src_root.join("notes").join(note_id.to_compact());
    let dst_note = dst_root.join("notes").join(note_id.to_compact());
    copy_dir_flat(fs, &src_note.join("logs"), &dst_note.join("logs"))?;
    copy_dir_flat(fs, &src_note.join("snapshots"), &dst_note.join("snapshots"))?;
    copy_dir_flat(fs, &src_note.join("packs"), &dst_note.join("packs"))?;
    Ok(())
}

/// Remove a note's on-disk tree under `root` (logs, snapshots, and any
/// packs), used both to clean up the source after a completed move and to
/// roll back a partially-copied destination.
fn remove_note_tree(fs: &dyn FileSystem, note_id: EntityId, root: &Path) -> Result<()> {
    let note_dir = root.join("notes").join(note_id.to_compact());
    remove_dir_flat(fs, &note_dir.join("logs"))?;
    remove_dir_flat(fs, &note_dir.join("snapshots"))?;
    remove_dir_flat(fs, &note_dir.join("packs"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::InMemoryFileSystem;
    use crate::log::LogWriter;

    fn seed_note(fs: &InMemoryFileSystem, root: &Path, note_id: EntityId, profile: EntityId, instance: EntityId) {
        let logs_dir = root.join("notes").join(note_id.to_compact()).join("logs");
        let writer = LogWriter::open(fs, &logs_dir, profile, instance).unwrap();
        writer.append(1, 1, b"hello".to_vec()).unwrap();
        writer.finalize().unwrap();
    }

    #[test]
    fn full_move_relocates_files_and_db_row() {
        let fs = InMemoryFileSystem::new();
        let db = CacheDb::open_in_memory().unwrap();
        let manager = MoveManager::new(&fs, &db);
        let note = EntityId::new_random();
        let profile = EntityId::new_random();
        let instance = EntityId::new_random();
        let src = Path::new("/src");
        let dst = Path::new("/dst");
        seed_note(&fs, src, note, profile, instance);

        let src_sd = EntityId::new_random();
        let dst_sd = EntityId::new_random();
        manager.begin_move(note, src_sd, dst_sd, instance, 0).unwrap();
        manager.drive_to_completion(note, src, dst, profile, 1000).unwrap();

        assert!(manager.list_pending().unwrap().is_empty());
        let dst_logs = dst.join("notes").join(note.to_compact()).join("logs");
        assert!(!fs.list_dir(&dst_logs).unwrap().is_empty());
        let src_logs = src.join("notes").join(note.to_compact()).join("logs");
        assert!(fs.list_dir(&src_logs).unwrap().is_empty());
    }

    #[test]
    fn full_move_carries_packed_updates_too() {
        let fs = InMemoryFileSystem::new();
        let db = CacheDb::open_in_memory().unwrap();
        let manager = MoveManager::new(&fs, &db);
        let note = EntityId::new_random();
        let profile = EntityId::new_random();
        let instance = EntityId::new_random();
        let src = Path::new("/src");
        let dst = Path::new("/dst");
        seed_note(&fs, src, note, profile, instance);
        let packs_dir = src.join("notes").join(note.to_compact()).join("packs");
        fs.write_atomic(&packs_dir.join("pack-1.yjson"), b"packed").unwrap();

        let src_sd = EntityId::new_random();
        let dst_sd = EntityId::new_random();
        manager.begin_move(note, src_sd, dst_sd, instance, 0).unwrap();
        manager.drive_to_completion(note, src, dst, profile, 1000).unwrap();

        let dst_packs = dst.join("notes").join(note.to_compact()).join("packs");
        assert!(fs.exists(&dst_packs.join("pack-1.yjson")));
    }

    #[test]
    fn second_initiator_defers() {
        let fs = InMemoryFileSystem::new();
        let db = CacheDb::open_in_memory().unwrap();
        let manager = MoveManager::new(&fs, &db);
        let note = EntityId::new_random();
        let instance = EntityId::new_random();
        manager.begin_move(note, EntityId::new_random(), EntityId::new_random(), instance, 0).unwrap();
        let err = manager.begin_move(note, EntityId::new_random(), EntityId::new_random(), instance, 0).unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));
    }

    #[test]
    fn cancel_before_db_updated_rolls_back_destination() {
        let fs = InMemoryFileSystem::new();
        let db = CacheDb::open_in_memory().unwrap();
        let manager = MoveManager::new(&fs, &db);
        let note = EntityId::new_random();
        let profile = EntityId::new_random();
        let instance = EntityId::new_random();
        let src = Path::new("/src");
        let dst = Path::new("/dst");
        seed_note(&fs, src, note, profile, instance);

        manager.begin_move(note, EntityId::new_random(), EntityId::new_random(), instance, 0).unwrap();
        manager.advance(note, src, dst, profile, 0).unwrap(); // initiated -> copying (copies files)

        assert!(manager.cancel_move(note, dst).unwrap());
        assert!(manager.list_pending().unwrap().is_empty());
        let dst_logs = dst.join("notes").join(note.to_compact()).join("logs");
        assert!(fs.list_dir(&dst_logs).unwrap().is_empty());
    }

    #[test]
    fn cancel_after_db_updated_is_rejected() {
        let fs = InMemoryFileSystem::new();
        let db = CacheDb::open_in_memory().unwrap();
        let manager = MoveManager::new(&fs, &db);
        let note = EntityId::new_random();
        let profile = EntityId::new_random();
        let instance = EntityId::new_random();
        let src = Path::new("/src");
        let dst = Path::new("/dst");
        seed_note(&fs, src, note, profile, instance);

        manager.begin_move(note, EntityId::new_random(), EntityId::new_random(), instance, 0).unwrap();
        manager.advance(note, src, dst, profile, 0).unwrap(); // copying
        manager.advance(note, src, dst, profile, 0).unwrap(); // files_copied
        manager.advance(note, src, dst, profile, 0).unwrap(); // db_updated

        let err = manager.cancel_move(note, dst).unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));
    }

    #[test]
    fn takeover_succeeds_only_once_stale() {
        let fs = InMemoryFileSystem::new();
        let db = CacheDb::open_in_memory().unwrap();
        let manager = MoveManager::new(&fs, &db);
        let note = EntityId::new_random();
        let owner = EntityId::new_random();
        let rescuer = EntityId::new_random();
        manager.begin_move(note, EntityId::new_random(), EntityId::new_random(), owner, 0).unwrap();

        assert!(!manager.takeover_if_stale(note, rescuer, OWNER_STALE_MILLIS - 1, OWNER_STALE_MILLIS).unwrap());
        assert!(manager.takeover_if_stale(note, rescuer, OWNER_STALE_MILLIS + 1, OWNER_STALE_MILLIS).unwrap());
        assert_eq!(manager.list_pending().unwrap()[0].owner_instance_id, rescuer);
    }
}
