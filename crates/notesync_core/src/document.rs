//! Document Storage Manager (C6): owns the authoritative in-memory CRDT
//! document for each loaded note or folder tree, mediates reads and writes,
//! and drives cold-load (spec.md §4.6).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::activity::{FeedEntry, FeedWriter};
use crate::clock::VectorClock;
use crate::crdt::{CrdtCapability, CrdtDocument};
use crate::db::CacheDb;
use crate::error::Result;
use crate::fs::FileSystem;
use crate::id::EntityId;
use crate::log::{LogFileName, LogReader, LogWriter};
use crate::pack::{self, PackFileName};
use crate::sequence::SequenceManager;
use crate::snapshot;

/// Opaque reference to a loaded document, returned by [`DocumentManager::load`].
/// Holding one keeps the document resident; callers must pair every `load`
/// with an `unload`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handle {
    /// Storage directory the document belongs to.
    pub sd_id: EntityId,
    /// Note id, or [`EntityId::folder_tree_sentinel`] for the folder tree.
    pub document_id: EntityId,
}

struct DocumentPaths {
    logs: PathBuf,
    packs: PathBuf,
    snapshots: PathBuf,
}

fn paths_for(sd_root: &Path, document_id: EntityId) -> DocumentPaths {
    let root = if document_id == EntityId::folder_tree_sentinel() {
        sd_root.join("folders")
    } else {
        sd_root.join("notes").join(document_id.to_compact())
    };
    DocumentPaths {
        logs: root.join("logs"),
        packs: root.join("packs"),
        snapshots: root.join("snapshots"),
    }
}

struct Loaded<'a, F: FileSystem, D: CrdtDocument> {
    doc: D,
    clock: VectorClock,
    ref_count: u32,
    paths: DocumentPaths,
    log_writer: LogWriter<'a, F>,
    updates_since_snapshot: u64,
}

/// Owns every currently-loaded document for one running instance.
///
/// Every mutation this crate makes to a document's content flows through
/// `apply_local_update`/`apply_remote_update`, so subscriber notification is
/// driven from here rather than from the CRDT backend's own change hook
/// ([`CrdtDocument::subscribe_to_updates`] exists for backends that need a
/// local-edit entry point outside this API, but this manager does not rely
/// on it for its own bookkeeping).
pub struct DocumentManager<'a, F: FileSystem, C: CrdtCapability> {
    fs: &'a F,
    db: &'a CacheDb,
    capability: &'a C,
    sd_root: PathBuf,
    sd_id: EntityId,
    profile_id: EntityId,
    instance_id: EntityId,
    loaded: Mutex<HashMap<EntityId, Loaded<'a, F, C::Document>>>,
    #[allow(clippy::type_complexity)]
    observers: Mutex<Vec<Box<dyn Fn(EntityId, EntityId, &[u8]) + Send + Sync>>>,
}

/// Number of updates since the last snapshot at which a document is
/// snapshotted again on close (spec.md §4.4 "Snapshot trigger").
const SNAPSHOT_TRIGGER_ON_CLOSE: u64 = 100;

impl<'a, F: FileSystem, C: CrdtCapability> DocumentManager<'a, F, C> {
    /// Bind a manager to one storage directory's root path and this
    /// instance's identity.
    pub fn new(
        fs: &'a F,
        db: &'a CacheDb,
        capability: &'a C,
        sd_root: PathBuf,
        sd_id: EntityId,
        profile_id: EntityId,
        instance_id: EntityId,
    ) -> Self {
        Self {
            fs,
            db,
            capability,
            sd_root,
            sd_id,
            profile_id,
            instance_id,
            loaded: Mutex::new(HashMap::new()),
            observers: Mutex::new(Vec::new()),
        }
    }

    /// Register a callback invoked with `(sd_id, document_id, update_bytes)`
    /// after every local or remote update is applied.
    pub fn subscribe(&self, callback: impl Fn(EntityId, EntityId, &[u8]) + Send + Sync + 'static) {
        self.observers.lock().unwrap().push(Box::new(callback));
    }

    /// Open a document, incrementing its reference count. Runs cold-load on
    /// first open; subsequent calls while already loaded are a cheap
    /// refcount bump.
    pub fn load(&self, document_id: EntityId) -> Result<Handle> {
        let mut loaded = self.loaded.lock().unwrap();
        if let Some(entry) = loaded.get_mut(&document_id) {
            entry.ref_count += 1;
            return Ok(Handle { sd_id: self.sd_id, document_id });
        }

        let paths = paths_for(&self.sd_root, document_id);
        let (doc, clock) = self.cold_load(&paths)?;
        let log_writer = LogWriter::open(self.fs, &paths.logs, self.profile_id, self.instance_id)?;
        self.persist_sync_state(document_id, &clock, &doc)?;

        loaded.insert(
            document_id,
            Loaded {
                doc,
                clock,
                ref_count: 1,
                paths,
                log_writer,
                updates_since_snapshot: 0,
            },
        );
        Ok(Handle { sd_id: self.sd_id, document_id })
    }

    /// Decrement a document's reference count, destroying the in-memory
    /// document and, if it has accumulated updates since its last snapshot,
    /// flushing a fresh one first.
    pub fn unload(&self, handle: Handle) -> Result<()> {
        let mut loaded = self.loaded.lock().unwrap();
        let Some(entry) = loaded.get_mut(&handle.document_id) else {
            return Ok(());
        };
        entry.ref_count = entry.ref_count.saturating_sub(1);
        if entry.ref_count > 0 {
            return Ok(());
        }
        let mut entry = loaded.remove(&handle.document_id).unwrap();
        if entry.updates_since_snapshot >= SNAPSHOT_TRIGGER_ON_CLOSE {
            snapshot::write_snapshot(self.fs, &entry.paths.snapshots, self.instance_id, &entry.clock, &entry.doc.encode_state())?;
            entry.updates_since_snapshot = 0;
        }
        self.persist_sync_state(handle.document_id, &entry.clock, &entry.doc)
    }

    /// Stamp a sequence, append the update to this instance's log (fsynced),
    /// record it in the activity feed, apply it to the in-memory document,
    /// and broadcast it to observers. The activity-log line is written only
    /// after the log append returns, so remote readers never observe an
    /// activity entry for a record that isn't durable yet (spec.md §4.6
    /// "Local write path").
    pub fn apply_local_update(&self, handle: Handle, update_bytes: Vec<u8>) -> Result<()> {
        let sequence_manager = SequenceManager::new(self.db);
        let mut loaded = self.loaded.lock().unwrap();
        let entry = loaded.get_mut(&handle.document_id).expect("handle refers to a loaded document");

        let position = sequence_manager.load_or_rescan(self.fs, self.sd_id, handle.document_id, self.instance_id, &entry.paths.logs)?;
        let sequence = position.sequence + 1;
        let timestamp = now_millis();

        let rotated = entry.log_writer.append(timestamp, sequence, update_bytes.clone())?;
        sequence_manager.record(
            self.sd_id,
            handle.document_id,
            &crate::sequence::SequencePosition {
                sequence,
                file: entry.log_writer.active_file_name(),
                offset: entry.log_writer.active_len(),
            },
        )?;

        let activity_dir = self.sd_root.join("activity");
        let feed = FeedWriter::open(self.fs, &activity_dir, self.profile_id, self.instance_id)?;
        feed.record(FeedEntry { document_id: handle.document_id, profile_id: self.profile_id, sequence })?;

        entry.doc.apply_update(&update_bytes)?;
        entry.clock.advance(self.instance_id, sequence, entry.log_writer.active_len(), entry.log_writer.active_file_name());
        entry.updates_since_snapshot += 1;

        if rotated {
            snapshot::write_snapshot(self.fs, &entry.paths.snapshots, self.instance_id, &entry.clock, &entry.doc.encode_state())?;
            entry.updates_since_snapshot = 0;
        }

        self.broadcast(handle.sd_id, handle.document_id, &update_bytes);
        Ok(())
    }

    /// Apply an update discovered from a remote instance (a foreign log
    /// record or pack entry) without stamping a new sequence, then broadcast
    /// it. `sequence` advances this manager's in-memory vector clock for
    /// `origin_instance`; callers that don't yet know the sequence (e.g. an
    /// update arriving through some future direct-sync transport) may pass 0
    /// to skip the clock advance.
    pub fn apply_remote_update(&self, handle: Handle, update_bytes: Vec<u8>, origin_instance: EntityId, sequence: u64) -> Result<()> {
        let mut loaded = self.loaded.lock().unwrap();
        let entry = loaded.get_mut(&handle.document_id).expect("handle refers to a loaded document");
        entry.doc.apply_update(&update_bytes)?;
        if sequence > 0 {
            entry.clock.advance(origin_instance, sequence, 0, String::new());
        }
        drop(loaded);
        self.broadcast(handle.sd_id, handle.document_id, &update_bytes);
        Ok(())
    }

    /// Whether `instance_id` has a log record reaching at least `seq` for
    /// `document_id`, used by C8 to tell a true-stale peer from replication
    /// lag (spec.md §4.8).
    pub fn check_log_exists(&self, document_id: EntityId, instance_id: EntityId, seq: u64) -> Result<bool> {
        let paths = paths_for(&self.sd_root, document_id);
        let entries = self.fs.list_dir(&paths.logs)?;
        let mut own: Vec<LogFileName> = entries
            .iter()
            .filter_map(|p| LogFileName::parse_path(p))
            .filter(|n| n.instance_id == instance_id)
            .collect();
        own.sort_by_key(|n| n.creation_millis);
        for name in own {
            let outcome = LogReader::read_file(self.fs, &name.path_in(&paths.logs))?;
            if outcome.records.iter().any(|r| r.sequence >= seq) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Re-derive a loaded document's state from disk: apply any pack or log
    /// records newer than its current in-memory vector clock, then persist.
    /// Used after C8/C9 discover foreign activity this instance hasn't seen.
    pub fn reload_note(&self, document_id: EntityId) -> Result<()> {
        let mut loaded = self.loaded.lock().unwrap();
        let Some(entry) = loaded.get_mut(&document_id) else {
            return Ok(());
        };
        apply_packs(self.fs, &entry.paths.packs, &mut entry.doc, &mut entry.clock)?;
        apply_logs(self.fs, &entry.paths.logs, &mut entry.doc, &mut entry.clock)?;
        self.persist_sync_state(document_id, &entry.clock, &entry.doc)
    }

    fn cold_load(&self, paths: &DocumentPaths) -> Result<(C::Document, VectorClock)> {
        let (mut doc, mut clock) = match snapshot::load_latest(self.fs, &paths.snapshots)? {
            Some(outcome) => (self.capability.load_doc(&outcome.state)?, outcome.clock),
            None => (self.capability.new_doc(), VectorClock::new()),
        };
        apply_packs(self.fs, &paths.packs, &mut doc, &mut clock)?;
        apply_logs(self.fs, &paths.logs, &mut doc, &mut clock)?;
        Ok((doc, clock))
    }

    fn persist_sync_state(&self, document_id: EntityId, clock: &VectorClock, doc: &C::Document) -> Result<()> {
        let state = doc.encode_state();
        let updated_at = now_millis() as i64;
        if document_id == EntityId::folder_tree_sentinel() {
            self.db.set_folder_sync_state(self.sd_id, clock, &state, updated_at)
        } else {
            self.db.set_note_sync_state(document_id, self.sd_id, clock, &state, updated_at)
        }
    }

    fn broadcast(&self, sd_id: EntityId, document_id: EntityId, update_bytes: &[u8]) {
        for observer in self.observers.lock().unwrap().iter() {
            observer(sd_id, document_id, update_bytes);
        }
    }
}

/// Apply every pack entry newer than `clock`'s recorded sequence for its
/// owning instance (spec.md §4.6 step 2).
fn apply_packs<D: CrdtDocument>(fs: &dyn FileSystem, packs_dir: &Path, doc: &mut D, clock: &mut VectorClock) -> Result<()> {
    let entries = fs.list_dir(packs_dir)?;
    let mut names: Vec<PackFileName> = entries.iter().filter_map(|p| PackFileName::parse_path(p)).collect();
    names.sort_by_key(|n| n.start_seq);

    for name in names {
        if name.end_seq <= clock.sequence_for(name.instance_id) {
            continue;
        }
        let records = pack::read_pack(fs, &name.path_in(packs_dir))?;
        for record in records {
            if record.sequence <= clock.sequence_for(name.instance_id) {
                continue;
            }
            doc.apply_update(&record.data)?;
            clock.advance(name.instance_id, record.sequence, 0, name.format());
        }
    }
    Ok(())
}

/// Apply every log record newer than `clock`'s recorded sequence for its
/// owning instance, one instance's files in creation order (spec.md §4.6
/// step 3).
fn apply_logs<D: CrdtDocument>(fs: &dyn FileSystem, logs_dir: &Path, doc: &mut D, clock: &mut VectorClock) -> Result<()> {
    let entries = fs.list_dir(logs_dir)?;
    let mut names: Vec<LogFileName> = entries.iter().filter_map(|p| LogFileName::parse_path(p)).collect();
    names.sort_by_key(|n| (n.instance_id, n.creation_millis));

    let mut by_instance: HashMap<EntityId, Vec<LogFileName>> = HashMap::new();
    for name in names {
        by_instance.entry(name.instance_id).or_default().push(name);
    }

    for (instance_id, files) in by_instance {
        for name in files {
            let path = name.path_in(logs_dir);
            let outcome = LogReader::read_file(fs, &path)?;
            for record in &outcome.records {
                if record.sequence <= clock.sequence_for(instance_id) {
                    continue;
                }
                doc.apply_update(&record.data)?;
                clock.advance(instance_id, record.sequence, fs.file_len(&path).unwrap_or(0), name.format());
            }
        }
    }
    Ok(())
}

fn now_millis() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::fixtures::ConcatCapability;
    use crate::fs::InMemoryFileSystem;

    fn manager<'a>(fs: &'a InMemoryFileSystem, db: &'a CacheDb, cap: &'a ConcatCapability, instance: EntityId) -> DocumentManager<'a, InMemoryFileSystem, ConcatCapability> {
        DocumentManager::new(fs, db, cap, PathBuf::from("/sd"), EntityId::new_random(), EntityId::new_random(), instance)
    }

    #[test]
    fn load_apply_unload_persists_state() {
        let fs = InMemoryFileSystem::new();
        let db = CacheDb::open_in_memory().unwrap();
        let cap = ConcatCapability;
        let instance = EntityId::new_random();
        let manager = manager(&fs, &db, &cap, instance);

        let note = EntityId::new_random();
        let handle = manager.load(note).unwrap();
        manager.apply_local_update(handle, b"hello".to_vec()).unwrap();
        manager.apply_local_update(handle, b"world".to_vec()).unwrap();
        manager.unload(handle).unwrap();

        let (sd_id, clock, state) = db.get_note_sync_state(note).unwrap().unwrap();
        assert_eq!(sd_id, manager.sd_id);
        assert_eq!(clock.sequence_for(instance), 2);
        assert!(state.is_some());
    }

    #[test]
    fn reload_after_second_instance_appends_picks_up_new_records() {
        let fs = InMemoryFileSystem::new();
        let db = CacheDb::open_in_memory().unwrap();
        let cap = ConcatCapability;
        let instance_a = EntityId::new_random();
        let manager = manager(&fs, &db, &cap, instance_a);

        let note = EntityId::new_random();
        let handle = manager.load(note).unwrap();
        manager.apply_local_update(handle, b"from-a".to_vec()).unwrap();

        // A second instance writes directly to the same logs directory.
        let profile = EntityId::new_random();
        let instance_b = EntityId::new_random();
        let paths = paths_for(&PathBuf::from("/sd"), note);
        let foreign_writer = LogWriter::open(&fs, &paths.logs, profile, instance_b).unwrap();
        foreign_writer.append(1, 1, b"from-b".to_vec()).unwrap();
        foreign_writer.finalize().unwrap();

        manager.reload_note(note).unwrap();
        manager.unload(handle).unwrap();

        let (_, clock, _) = db.get_note_sync_state(note).unwrap().unwrap();
        assert_eq!(clock.sequence_for(instance_b), 1);
    }

    #[test]
    fn check_log_exists_reports_presence_by_sequence() {
        let fs = InMemoryFileSystem::new();
        let db = CacheDb::open_in_memory().unwrap();
        let cap = ConcatCapability;
        let instance = EntityId::new_random();
        let manager = manager(&fs, &db, &cap, instance);

        let note = EntityId::new_random();
        let handle = manager.load(note).unwrap();
        manager.apply_local_update(handle, b"a".to_vec()).unwrap();
        manager.apply_local_update(handle, b"b".to_vec()).unwrap();

        assert!(manager.check_log_exists(note, instance, 2).unwrap());
        assert!(!manager.check_log_exists(note, instance, 99).unwrap());
    }

    #[test]
    fn subscribers_receive_local_and_remote_updates() {
        let fs = InMemoryFileSystem::new();
        let db = CacheDb::open_in_memory().unwrap();
        let cap = ConcatCapability;
        let instance = EntityId::new_random();
        let manager = manager(&fs, &db, &cap, instance);
        let seen = std::sync::Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        manager.subscribe(move |_, _, bytes| seen_clone.lock().unwrap().push(bytes.to_vec()));

        let note = EntityId::new_random();
        let handle = manager.load(note).unwrap();
        manager.apply_local_update(handle, b"local".to_vec()).unwrap();
        manager.apply_remote_update(handle, b"remote".to_vec(), EntityId::new_random(), 5).unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![b"local".to_vec(), b"remote".to_vec()]);
    }
}
