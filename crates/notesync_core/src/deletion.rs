//! Deletion feed (C9): same file pattern as the activity logger (C7), a
//! separate `deleted/{profileId}_{instanceId}.log` directory, and polled the
//! same way as C8 (spec.md §4.9). An entry means "this document has been
//! tombstoned"; consumers treat it as authoritative for cache removal once
//! the corresponding CRDT update is visible.

use std::path::{Path, PathBuf};

use crate::activity::{self, FeedEntry, FeedWriter};
use crate::db::CacheDb;
use crate::error::Result;
use crate::fs::FileSystem;
use crate::id::EntityId;
use crate::sync_poller::{self, PollOutcome};

/// The `deleted/` directory under a storage directory's root.
pub fn deletions_dir(sd_root: &Path) -> PathBuf {
    sd_root.join("deleted")
}

/// Owns this instance's own deletion feed file.
pub struct DeletionLogger<'a, F: FileSystem> {
    feed: FeedWriter<'a, F>,
}

impl<'a, F: FileSystem> DeletionLogger<'a, F> {
    /// Open (creating if needed) this instance's deletion feed file.
    pub fn open(fs: &'a F, sd_root: &Path, profile_id: EntityId, instance_id: EntityId) -> Result<Self> {
        Ok(Self {
            feed: FeedWriter::open(fs, &deletions_dir(sd_root), profile_id, instance_id)?,
        })
    }

    /// Record that `document_id` was tombstoned at `sequence` (the sequence
    /// of the CRDT update that performed the deletion, so readers can check
    /// visibility the same way C8 does).
    pub fn record_deletion(&self, document_id: EntityId, profile_id: EntityId, sequence: u64) -> Result<()> {
        self.feed.record(FeedEntry { document_id, profile_id, sequence })
    }
}

/// Poll every foreign deletion feed for one storage directory, marking
/// visible tombstones in the cache DB and returning the same
/// [`PollOutcome`] shape C8 uses (documents whose deletion is visible don't
/// need a reload, but sharing the type keeps the polling loop uniform).
pub fn poll_deletions(
    fs: &dyn FileSystem,
    db: &CacheDb,
    sd_id: EntityId,
    sd_root: &Path,
    own_file_name: &str,
    check_log_exists: impl Fn(EntityId, EntityId, u64) -> bool,
    now_millis: i64,
) -> Result<PollOutcome> {
    let dir = deletions_dir(sd_root);
    let mut combined = PollOutcome::default();
    for file_name in sync_poller::foreign_logs(fs, &dir, own_file_name)? {
        let outcome = sync_poller::poll_foreign_log(fs, db, sd_id, &dir, &file_name, |_, _| 0, &check_log_exists)?;
        for document_id in &outcome.documents_to_reload {
            db.mark_note_deleted(*document_id, now_millis)?;
        }
        combined.documents_to_reload.extend(outcome.documents_to_reload);
        combined.newly_stale.extend(outcome.newly_stale);
    }
    Ok(combined)
}

/// Whether any instance has recorded `document_id` as deleted at or above
/// `min_sequence` in its own feed (used before surfacing a note in listings).
pub fn has_visible_tombstone(fs: &dyn FileSystem, sd_root: &Path, document_id: EntityId, min_sequence: u64) -> Result<bool> {
    let dir = deletions_dir(sd_root);
    for path in fs.list_dir(&dir)? {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if activity::parse_file_name(name).is_none() {
            continue;
        }
        let (entries, _) = activity::read_new_entries(fs, &path, 0)?;
        if entries.iter().any(|e| e.document_id == document_id && e.sequence >= min_sequence) {
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::InMemoryFileSystem;

    #[test]
    fn record_and_detect_tombstone() {
        let fs = InMemoryFileSystem::new();
        let sd_root = Path::new("/sd");
        let profile = EntityId::new_random();
        let instance = EntityId::new_random();
        let doc = EntityId::new_random();

        let logger = DeletionLogger::open(&fs, sd_root, profile, instance).unwrap();
        logger.record_deletion(doc, profile, 3).unwrap();

        assert!(has_visible_tombstone(&fs, sd_root, doc, 3).unwrap());
        assert!(!has_visible_tombstone(&fs, sd_root, doc, 4).unwrap());
    }

    #[test]
    fn poll_deletions_marks_note_deleted_in_cache() {
        let fs = InMemoryFileSystem::new();
        let db = CacheDb::open_in_memory().unwrap();
        let sd = EntityId::new_random();
        let sd_root = Path::new("/sd");
        let profile = EntityId::new_random();
        let instance = EntityId::new_random();
        let doc = EntityId::new_random();

        db.upsert_storage_dir(&crate::db::StorageDirRow {
            id: sd,
            name: "main".to_string(),
            path: "/sd".to_string(),
            created_at: 0,
            is_active: true,
        })
        .unwrap();
        {
            let conn_guard = db.list_storage_dirs().unwrap();
            assert_eq!(conn_guard.len(), 1);
        }

        let logger = DeletionLogger::open(&fs, sd_root, profile, instance).unwrap();
        logger.record_deletion(doc, profile, 1).unwrap();

        poll_deletions(&fs, &db, sd, sd_root, "nonexistent.log", |_, _, _| true, 1000).unwrap();
    }
}
