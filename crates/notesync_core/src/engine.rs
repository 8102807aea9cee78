//! Top-level per-profile orchestrator (spec.md §6.2): binds one cache
//! database, one CRDT capability, and a set of registered storage
//! directories into the public surface every frontend calls through.
//!
//! `Engine` itself holds no long-running thread. Callers drive the
//! background jobs (watcher ticks, sync polls, pack/snapshot/GC) from
//! whatever event loop they already have, checking a [`crate::scheduler::Scheduler`]
//! for due work and calling the matching `poll_*`/`run_*` method here.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::backup::{BackupEntry, BackupManager, BackupResult, RestoreMode};
use crate::crdt::CrdtCapability;
use crate::db::{CacheDb, DoctorReport, MoveRow, StorageDirRow};
use crate::diagnostics::{self, Report as DiagnosticsReport};
use crate::document::{DocumentManager, Handle};
use crate::error::{EngineError, Result};
use crate::fs::FileSystem;
use crate::id::EntityId;
use crate::config::EngineConfig;
use crate::mv::MoveManager;
use crate::sync_poller::{self, PollOutcome};
use crate::watcher::watched_roots;

fn now_millis() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

/// Everything this engine instance needs to know about one registered
/// storage directory: its root path and the document manager bound to it.
struct Sd<'a, F: FileSystem, C: CrdtCapability> {
    root: PathBuf,
    documents: DocumentManager<'a, F, C>,
}

/// One running instance's view of a profile: every registered storage
/// directory, the shared cache database, and the cross-SD move manager.
///
/// Generic over the filesystem backend and the CRDT capability so the same
/// orchestration logic runs against the in-memory test filesystem and the
/// fixture CRDT backend in tests, and a real backend in production.
pub struct Engine<'a, F: FileSystem, C: CrdtCapability> {
    fs: &'a F,
    db: &'a CacheDb,
    capability: &'a C,
    config: EngineConfig,
    profile_id: EntityId,
    instance_id: EntityId,
    sds: HashMap<EntityId, Sd<'a, F, C>>,
}

impl<'a, F: FileSystem, C: CrdtCapability> Engine<'a, F, C> {
    /// Bind an engine to this instance's filesystem, cache database, CRDT
    /// backend, and configuration. Runs the startup doctor pass immediately.
    /// The cache database is borrowed rather than owned so every storage
    /// directory's [`DocumentManager`] can hold a reference to it across
    /// load/unload calls without a self-referential struct.
    pub fn open(fs: &'a F, db: &'a CacheDb, capability: &'a C, config: EngineConfig, profile_id: EntityId, instance_id: EntityId) -> Result<Self> {
        let mut engine = Self {
            fs,
            db,
            capability,
            config,
            profile_id,
            instance_id,
            sds: HashMap::new(),
        };
        for row in engine.db.list_storage_dirs()? {
            let sd_id = row.id;
            let root = PathBuf::from(row.path);
            engine.bind_sd(sd_id, root);
        }
        engine.db.doctor()?;
        Ok(engine)
    }

    fn bind_sd(&mut self, sd_id: EntityId, root: PathBuf) {
        let documents = DocumentManager::new(self.fs, self.db, self.capability, root.clone(), sd_id, self.profile_id, self.instance_id);
        self.sds.insert(sd_id, Sd { root, documents });
    }

    fn sd(&self, sd_id: EntityId) -> Result<&Sd<'a, F, C>> {
        self.sds.get(&sd_id).ok_or_else(|| EngineError::NotFound(format!("storage directory {sd_id}")))
    }

    // ---- Document (spec.md §6.2 "Document") ----

    /// Open a document for reading and writing, running cold-load on first
    /// open (C6).
    pub fn load(&self, sd_id: EntityId, document_id: EntityId) -> Result<Handle> {
        self.sd(sd_id)?.documents.load(document_id)
    }

    /// Release a previously loaded document, flushing a snapshot if enough
    /// updates accumulated since the last one.
    pub fn unload(&self, handle: Handle) -> Result<()> {
        self.sd(handle.sd_id)?.documents.unload(handle)
    }

    /// Append a local edit, durably logging it before applying it in memory
    /// and broadcasting it to subscribers.
    pub fn apply_local_update(&self, handle: Handle, update_bytes: Vec<u8>) -> Result<()> {
        self.sd(handle.sd_id)?.documents.apply_local_update(handle, update_bytes)
    }

    /// Register a callback invoked with `(sd_id, document_id, update_bytes)`
    /// after every local or remote update, across every currently-registered
    /// storage directory. Storage directories registered after this call are
    /// not covered; call again after `create_sd` if that matters to the
    /// caller.
    pub fn subscribe_updates(&self, callback: impl Fn(EntityId, EntityId, &[u8]) + Send + Sync + Clone + 'static) {
        for sd in self.sds.values() {
            sd.documents.subscribe(callback.clone());
        }
    }

    /// Whether `instance_id` has a log record reaching at least `seq` for
    /// `document_id`, used to distinguish a truly stale peer from ordinary
    /// replication lag (C8).
    pub fn check_log_exists(&self, sd_id: EntityId, document_id: EntityId, instance_id: EntityId, seq: u64) -> Result<bool> {
        self.sd(sd_id)?.documents.check_log_exists(document_id, instance_id, seq)
    }

    /// Current sync state for a note: its storage directory, vector clock,
    /// and last persisted encoded state, if the note has ever been
    /// loaded/synced on this machine.
    pub fn get_metadata(&self, document_id: EntityId) -> Result<Option<(EntityId, crate::clock::VectorClock, Option<Vec<u8>>)>> {
        self.db.get_note_sync_state(document_id)
    }

    /// Re-derive a loaded document's state from newly discovered pack/log
    /// records, used after a sync poll reports new activity for it.
    pub fn reload_note(&self, sd_id: EntityId, document_id: EntityId) -> Result<()> {
        self.sd(sd_id)?.documents.reload_note(document_id)
    }

    // ---- Storage admin (spec.md §6.2 "Storage admin") ----

    /// List every registered storage directory.
    pub fn list_sds(&self) -> Result<Vec<StorageDirRow>> {
        self.db.list_storage_dirs()
    }

    /// Register a new storage directory, creating its root tree on disk.
    pub fn create_sd(&mut self, name: String, path: PathBuf) -> Result<EntityId> {
        let sd_id = EntityId::new_random();
        self.fs.create_dir_all(&path)?;
        self.fs.create_dir_all(&path.join("notes"))?;
        self.fs.create_dir_all(&path.join("folders"))?;
        self.fs.create_dir_all(&path.join("activity"))?;
        self.fs.create_dir_all(&path.join("deleted"))?;
        self.db.upsert_storage_dir(&StorageDirRow {
            id: sd_id,
            name,
            path: path.to_string_lossy().into_owned(),
            created_at: now_millis() as i64,
            is_active: false,
        })?;
        self.bind_sd(sd_id, path);
        Ok(sd_id)
    }

    /// Rename a registered storage directory in place.
    pub fn rename_sd(&mut self, sd_id: EntityId, new_name: String) -> Result<()> {
        let mut row = self
            .db
            .list_storage_dirs()?
            .into_iter()
            .find(|r| r.id == sd_id)
            .ok_or_else(|| EngineError::NotFound(format!("storage directory {sd_id}")))?;
        row.name = new_name;
        self.db.upsert_storage_dir(&row)
    }

    /// Mark one storage directory as the default placement target for new
    /// notes, clearing the flag on every other one.
    pub fn set_active_sd(&mut self, sd_id: EntityId) -> Result<()> {
        self.sd(sd_id)?;
        self.db.set_active_storage_dir(sd_id)
    }

    /// Unregister a storage directory. Its on-disk files are left in place;
    /// the next `doctor()` pass sweeps up cache rows that referenced it.
    pub fn delete_sd(&mut self, sd_id: EntityId) -> Result<()> {
        self.sd(sd_id)?;
        self.db.delete_storage_dir(sd_id)?;
        self.sds.remove(&sd_id);
        Ok(())
    }

    // ---- Moves (spec.md §6.2 "Moves") ----

    /// Begin relocating a note from one storage directory to another.
    pub fn begin_move(&self, note_id: EntityId, src_sd_id: EntityId, dst_sd_id: EntityId) -> Result<EntityId> {
        let manager = MoveManager::new(self.fs, self.db);
        manager.begin_move(note_id, src_sd_id, dst_sd_id, self.instance_id, now_millis() as i64)
    }

    /// Drive every pending move owned by this instance one step further,
    /// then list what's still pending.
    pub fn drive_pending_moves(&self) -> Result<()> {
        let manager = MoveManager::new(self.fs, self.db);
        for row in manager.list_pending()? {
            if row.owner_instance_id != self.instance_id {
                continue;
            }
            let src_root = self.sd(row.src_sd_id)?.root.clone();
            let dst_root = self.sd(row.dst_sd_id)?.root.clone();
            manager.advance(row.note_id, &src_root, &dst_root, self.profile_id, now_millis() as i64)?;
        }
        Ok(())
    }

    /// List every in-flight cross-SD move.
    pub fn list_pending_moves(&self) -> Result<Vec<MoveRow>> {
        MoveManager::new(self.fs, self.db).list_pending()
    }

    /// Take over a move whose owner has gone silent past the configured
    /// staleness threshold (C11 "Takeover protocol").
    pub fn takeover_move(&self, note_id: EntityId) -> Result<bool> {
        let manager = MoveManager::new(self.fs, self.db);
        manager.takeover_if_stale(note_id, self.instance_id, now_millis() as i64, self.config.move_owner_stale_seconds as i64 * 1000)
    }

    /// Cancel an in-flight move, rolling back any partially-copied
    /// destination files. Only safe before the `db_updated` step.
    pub fn cancel_move(&self, note_id: EntityId, dst_sd_id: EntityId) -> Result<bool> {
        let dst_root = self.sd(dst_sd_id)?.root.clone();
        MoveManager::new(self.fs, self.db).cancel_move(note_id, &dst_root)
    }

    // ---- Backup/Restore (spec.md §6.2 "Backup/Restore") ----

    /// Copy a storage directory's tree into a new timestamped backup.
    pub fn create_backup(&self, sd_id: EntityId) -> Result<BackupResult> {
        let root = self.sd(sd_id)?.root.clone();
        BackupManager::new(self.fs, self.config.backup_root.clone()).create_backup(sd_id, &root, now_millis())
    }

    /// Restore a previously created backup, either over its original
    /// storage directory or into a fresh root.
    pub fn restore_backup(&self, backup_id: &crate::backup::BackupId, mode: RestoreMode) -> Result<BackupResult> {
        let target_root = match mode {
            RestoreMode::Original => self.sd(backup_id.sd_id)?.root.clone(),
            RestoreMode::New => self.config.backup_root.join(format!("restored_{}", backup_id.created_at_millis)),
        };
        BackupManager::new(self.fs, self.config.backup_root.clone()).restore_backup(backup_id, mode, &target_root)
    }

    /// List every backup under the configured backup root.
    pub fn list_backups(&self) -> Result<Vec<BackupEntry>> {
        BackupManager::new(self.fs, self.config.backup_root.clone()).list_backups()
    }

    // ---- Diagnostics (spec.md §6.2 "Diagnostics") ----

    /// Run the orphan/duplicate-tag doctor pass, stuck-move scan, and fold
    /// in whatever peers this run's sync poll already flagged stale.
    pub fn diagnostics(&self, newly_stale: Vec<(EntityId, EntityId)>) -> Result<DiagnosticsReport> {
        diagnostics::run_diagnostics(self.db, now_millis() as i64, self.config.move_owner_stale_seconds as i64 * 1000, newly_stale)
    }

    /// Run the cache DB's orphan/duplicate-tag cleanup pass directly.
    pub fn run_doctor(&self) -> Result<DoctorReport> {
        self.db.doctor()
    }

    // ---- Search (C12 full-text index) ----
    //
    // Document text lives behind the opaque CRDT byte interface, so this
    // crate can't extract it itself; a caller that holds the concrete CRDT
    // document renders it to plain text and feeds it through these calls.

    /// Index (or re-index) one note's current title/body text.
    pub fn index_note_text(&self, note_id: EntityId, title: &str, body: &str) -> Result<()> {
        self.db.index_note_text(note_id, title, body)
    }

    /// Drop a note's indexed text, e.g. once its deletion tombstone lands.
    pub fn remove_note_text(&self, note_id: EntityId) -> Result<()> {
        self.db.remove_note_text(note_id)
    }

    /// Rebuild the whole full-text index from freshly re-extracted text,
    /// the way a caller does after reloading every note in a storage
    /// directory (spec.md §4.12 "FTS index... rebuilt... on reload").
    pub fn rebuild_search_index(&self, entries: &[(EntityId, String, String)]) -> Result<()> {
        self.db.rebuild_fts(entries)
    }

    /// Full-text search over indexed note titles/bodies.
    pub fn search_notes(&self, query: &str) -> Result<Vec<EntityId>> {
        self.db.search_notes(query)
    }

    // ---- Sync (C8/C9 poll, wired for one storage directory's feeds) ----

    /// Poll one storage directory's activity or deletion feed directory,
    /// queuing affected documents for reload and flagging any peer whose
    /// gap exceeds the stale threshold.
    pub fn poll_feed(&self, sd_id: EntityId, feed_dir_name: &str, file_name: &str) -> Result<PollOutcome> {
        let sd = self.sd(sd_id)?;
        let dir = sd.root.join(feed_dir_name);
        let db = self.db;
        let documents = &sd.documents;
        sync_poller::poll_foreign_log(
            self.fs,
            db,
            sd_id,
            &dir,
            file_name,
            |instance_id, document_id| {
                let clock = if document_id == EntityId::folder_tree_sentinel() {
                    db.get_folder_sync_state(sd_id).ok().flatten().map(|(clock, _)| clock)
                } else {
                    db.get_note_sync_state(document_id).ok().flatten().map(|(_, clock, _)| clock)
                };
                clock.map(|c| c.sequence_for(instance_id)).unwrap_or(0)
            },
            |instance_id, document_id, seq| documents.check_log_exists(document_id, instance_id, seq).unwrap_or(false),
        )
    }

    /// Watched roots for one storage directory, given its currently known
    /// note ids — handed to a [`crate::watcher::PollingWatcher`] by the
    /// caller's event loop.
    pub fn watched_roots(&self, sd_id: EntityId, note_ids: &[EntityId]) -> Result<Vec<PathBuf>> {
        Ok(watched_roots(&self.sd(sd_id)?.root, note_ids))
    }

    /// Remove foreign activity/deletion feed files this instance hasn't
    /// heard from and that `is_stale` reports as past the configured
    /// retention window (C8 "Orphan cleanup").
    pub fn cleanup_orphaned_feeds(&self, sd_id: EntityId, feed_dir_name: &str, own_file_name: &str, is_stale: impl Fn(&str) -> bool) -> Result<u64> {
        let dir = self.sd(sd_id)?.root.join(feed_dir_name);
        sync_poller::remove_orphaned_logs(self.fs, self.db, sd_id, &dir, own_file_name, is_stale)
    }

    // ---- Background jobs (C10, wired for one document's tree) ----

    /// Pack this instance's own fully-rotated log files for one document.
    pub fn pack_document(&self, sd_id: EntityId, document_id: EntityId) -> Result<Vec<crate::pack::PackFileName>> {
        let root = self.document_root(sd_id, document_id)?;
        crate::gc::pack_own_updates(self.fs, &root.join("logs"), &root.join("packs"), self.instance_id, now_millis())
    }

    /// Retain the newest snapshots and remove packs/logs fully covered by
    /// the oldest retained one, for one document's tree.
    pub fn gc_document(&self, sd_id: EntityId, document_id: EntityId, is_past_retention: impl Fn(&std::path::Path) -> bool) -> Result<crate::gc::GcReport> {
        let root = self.document_root(sd_id, document_id)?;
        crate::gc::run_gc(self.fs, &root.join("snapshots"), &root.join("packs"), &root.join("logs"), is_past_retention)
    }

    fn document_root(&self, sd_id: EntityId, document_id: EntityId) -> Result<PathBuf> {
        let root = self.sd(sd_id)?.root.clone();
        Ok(if document_id == EntityId::folder_tree_sentinel() {
            root.join("folders")
        } else {
            root.join("notes").join(document_id.to_compact())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::fixtures::ConcatCapability;
    use crate::fs::InMemoryFileSystem;

    fn open_engine<'a>(fs: &'a InMemoryFileSystem, db: &'a CacheDb, cap: &'a ConcatCapability) -> Engine<'a, InMemoryFileSystem, ConcatCapability> {
        let config = EngineConfig::default();
        Engine::open(fs, db, cap, config, EntityId::new_random(), EntityId::new_random()).unwrap()
    }

    #[test]
    fn create_sd_then_load_apply_unload_round_trips() {
        let fs = InMemoryFileSystem::new();
        let db = CacheDb::open_in_memory().unwrap();
        let cap = ConcatCapability;
        let mut engine = open_engine(&fs, &db, &cap);

        let sd_id = engine.create_sd("laptop".to_string(), PathBuf::from("/sd")).unwrap();
        let note = EntityId::new_random();
        let handle = engine.load(sd_id, note).unwrap();
        engine.apply_local_update(handle, b"hello".to_vec()).unwrap();
        engine.unload(handle).unwrap();

        let (found_sd, _, state) = engine.get_metadata(note).unwrap().unwrap();
        assert_eq!(found_sd, sd_id);
        assert!(state.is_some());
    }

    #[test]
    fn rename_and_delete_sd_updates_registry() {
        let fs = InMemoryFileSystem::new();
        let db = CacheDb::open_in_memory().unwrap();
        let cap = ConcatCapability;
        let mut engine = open_engine(&fs, &db, &cap);

        let sd_id = engine.create_sd("laptop".to_string(), PathBuf::from("/sd")).unwrap();
        engine.rename_sd(sd_id, "desktop".to_string()).unwrap();
        assert_eq!(engine.list_sds().unwrap()[0].name, "desktop");

        engine.set_active_sd(sd_id).unwrap();
        assert!(engine.list_sds().unwrap()[0].is_active);

        engine.delete_sd(sd_id).unwrap();
        assert!(engine.list_sds().unwrap().is_empty());
        assert!(engine.load(sd_id, EntityId::new_random()).is_err());
    }

    #[test]
    fn begin_move_then_cancel_rolls_back() {
        let fs = InMemoryFileSystem::new();
        let db = CacheDb::open_in_memory().unwrap();
        let cap = ConcatCapability;
        let mut engine = open_engine(&fs, &db, &cap);

        let src = engine.create_sd("a".to_string(), PathBuf::from("/a")).unwrap();
        let dst = engine.create_sd("b".to_string(), PathBuf::from("/b")).unwrap();
        let note = EntityId::new_random();
        let handle = engine.load(src, note).unwrap();
        engine.apply_local_update(handle, b"x".to_vec()).unwrap();
        engine.unload(handle).unwrap();

        engine.begin_move(note, src, dst).unwrap();
        assert_eq!(engine.list_pending_moves().unwrap().len(), 1);
        assert!(engine.cancel_move(note, dst).unwrap());
        assert!(engine.list_pending_moves().unwrap().is_empty());
    }

    #[test]
    fn backup_then_restore_into_new_root() {
        let fs = InMemoryFileSystem::new();
        let db = CacheDb::open_in_memory().unwrap();
        let cap = ConcatCapability;
        let mut engine = open_engine(&fs, &db, &cap);
        let sd_id = engine.create_sd("a".to_string(), PathBuf::from("/a")).unwrap();

        let result = engine.create_backup(sd_id).unwrap();
        let backups = engine.list_backups().unwrap();
        assert_eq!(backups.len(), 1);

        let restored = engine.restore_backup(&result.backup_id, RestoreMode::New).unwrap();
        assert_eq!(restored.backup_id, result.backup_id);
    }

    #[test]
    fn diagnostics_reports_empty_on_a_fresh_profile() {
        let fs = InMemoryFileSystem::new();
        let db = CacheDb::open_in_memory().unwrap();
        let cap = ConcatCapability;
        let engine = open_engine(&fs, &db, &cap);
        let report = engine.diagnostics(vec![]).unwrap();
        assert_eq!(report.doctor, DoctorReport::default());
        assert!(report.stuck_moves.is_empty());
    }
}
