//! File change notification (C13): abstracts OS file-change events per
//! watched root, with mandatory polling as the fallback since some
//! cloud-synced filesystems are unreliable about append notifications
//! (spec.md §4.13).
//!
//! The polling backend here is built entirely on the [`FileSystem`]
//! abstraction, so it runs the same way against the in-memory test
//! filesystem and a real one. A native OS-notification backend (e.g. the
//! `notify` crate) is an optional extension behind [`NativeNotifier`] that
//! can push additional events between polls; it is never the only source of
//! truth.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Result;
use crate::fs::FileSystem;
use crate::id::EntityId;
use crate::log::LogFileName;
use crate::pack::PackFileName;
use crate::snapshot::SnapshotFileName;

/// Mandatory polling interval fallback.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
/// Debounce window for coalescing bursts of native notifications.
pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(100);

/// What happened to a watched path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Modified,
    Removed,
}

/// One coalesced change, ready to hand to the sync poller (C8/C9) or the
/// document manager (C6) for a reload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub path: PathBuf,
    pub kind: ChangeKind,
}

/// A point-in-time listing of one watched directory: path -> byte length.
/// Length, not mtime, is the change signal, since append-only files grow
/// monotonically and the [`FileSystem`] abstraction has no mtime method.
pub type DirSnapshot = HashMap<PathBuf, u64>;

/// Snapshot every file directly inside `dir` (non-recursive — callers pass
/// each leaf directory, e.g. a note's `logs/`, individually).
pub fn snapshot_dir(fs: &dyn FileSystem, dir: &Path) -> Result<DirSnapshot> {
    let mut out = HashMap::new();
    for path in fs.list_dir(dir)? {
        if let Some(len) = fs.file_len(&path) {
            out.insert(path, len);
        }
    }
    Ok(out)
}

/// Diff two snapshots of the same directory into change events. Paths
/// `is_own_write` reports true for are dropped: own writes are filtered at
/// source, so a writer never sees an echo of its own append (spec.md
/// §4.13).
pub fn diff_snapshots(before: &DirSnapshot, after: &DirSnapshot, is_own_write: impl Fn(&Path) -> bool) -> Vec<WatchEvent> {
    let mut events = Vec::new();
    for (path, len) in after {
        if is_own_write(path) {
            continue;
        }
        match before.get(path) {
            None => events.push(WatchEvent { path: path.clone(), kind: ChangeKind::Created }),
            Some(old_len) if old_len != len => events.push(WatchEvent { path: path.clone(), kind: ChangeKind::Modified }),
            _ => {}
        }
    }
    for path in before.keys() {
        if is_own_write(path) {
            continue;
        }
        if !after.contains_key(path) {
            events.push(WatchEvent { path: path.clone(), kind: ChangeKind::Removed });
        }
    }
    events
}

/// Whether `path`'s file name parses as a log/pack/snapshot/feed file
/// written by `own_instance_id`, used to build the `is_own_write` predicate
/// passed to [`diff_snapshots`].
pub fn is_own_write(path: &Path, own_instance_id: EntityId) -> bool {
    if let Some(name) = LogFileName::parse_path(path) {
        return name.instance_id == own_instance_id;
    }
    if let Some(name) = PackFileName::parse_path(path) {
        return name.instance_id == own_instance_id;
    }
    if let Some(name) = SnapshotFileName::parse_path(path) {
        return name.instance_id == own_instance_id;
    }
    if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
        if let Some((_, instance_id)) = crate::activity::parse_file_name(name) {
            return instance_id == own_instance_id;
        }
    }
    false
}

/// The leaf directories one per-SD watcher must cover (spec.md §4.13): the
/// activity and deletion feeds, the folder tree's own logs/packs/snapshots,
/// and the logs/packs/snapshots of every currently-known note.
pub fn watched_roots(sd_root: &Path, note_ids: &[EntityId]) -> Vec<PathBuf> {
    let mut roots = vec![
        sd_root.join("activity"),
        sd_root.join("deleted"),
        sd_root.join("folders").join("logs"),
        sd_root.join("folders").join("packs"),
        sd_root.join("folders").join("snapshots"),
    ];
    for note_id in note_ids {
        let note_dir = sd_root.join("notes").join(note_id.to_compact());
        roots.push(note_dir.join("logs"));
        roots.push(note_dir.join("packs"));
        roots.push(note_dir.join("snapshots"));
    }
    roots
}

/// Polls every watched root on a fixed interval, keeping the previous
/// snapshot of each root so `tick` can diff and emit only what changed.
pub struct PollingWatcher<'a, F: FileSystem> {
    fs: &'a F,
    poll_interval: Duration,
    snapshots: HashMap<PathBuf, DirSnapshot>,
}

impl<'a, F: FileSystem> PollingWatcher<'a, F> {
    pub fn new(fs: &'a F, poll_interval: Duration) -> Self {
        Self {
            fs,
            poll_interval,
            snapshots: HashMap::new(),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Run one tick over `roots`. A root seen for the first time establishes
    /// its baseline silently (matching a watcher attaching to an
    /// already-populated directory); events are only reported from the
    /// second tick over a given root onward.
    pub fn tick(&mut self, roots: &[PathBuf], is_own_write: impl Fn(&Path) -> bool) -> Result<Vec<WatchEvent>> {
        let mut all_events = Vec::new();
        for root in roots {
            let after = snapshot_dir(self.fs, root)?;
            if let Some(before) = self.snapshots.get(root) {
                all_events.extend(diff_snapshots(before, &after, &is_own_write));
            }
            self.snapshots.insert(root.clone(), after);
        }
        Ok(all_events)
    }
}

/// Extension point for an OS-level notification backend: when available it
/// can supply low-latency events between polling ticks, but polling always
/// runs alongside it as the guaranteed fallback (spec.md §4.13).
pub trait NativeNotifier: Send + Sync {
    /// Drain whatever events have arrived since the last call. Implementations
    /// are responsible for their own debounce coalescing and own-write
    /// filtering at the source.
    fn drain_events(&mut self) -> Vec<WatchEvent>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::InMemoryFileSystem;

    #[test]
    fn diff_detects_created_modified_removed() {
        let mut before = DirSnapshot::new();
        before.insert(PathBuf::from("/a"), 10);
        before.insert(PathBuf::from("/b"), 20);

        let mut after = DirSnapshot::new();
        after.insert(PathBuf::from("/a"), 15); // modified
        after.insert(PathBuf::from("/c"), 5); // created
        // "/b" removed

        let mut events = diff_snapshots(&before, &after, |_| false);
        events.sort_by_key(|e| e.path.clone());
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].path, PathBuf::from("/a"));
        assert_eq!(events[0].kind, ChangeKind::Modified);
        assert_eq!(events[1].path, PathBuf::from("/b"));
        assert_eq!(events[1].kind, ChangeKind::Removed);
        assert_eq!(events[2].path, PathBuf::from("/c"));
        assert_eq!(events[2].kind, ChangeKind::Created);
    }

    #[test]
    fn own_writes_are_filtered_out() {
        let mut before = DirSnapshot::new();
        before.insert(PathBuf::from("/own"), 10);
        let mut after = DirSnapshot::new();
        after.insert(PathBuf::from("/own"), 20);
        after.insert(PathBuf::from("/foreign"), 1);

        let events = diff_snapshots(&before, &after, |p| p == Path::new("/own"));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].path, PathBuf::from("/foreign"));
    }

    #[test]
    fn first_tick_over_a_root_establishes_baseline_silently() {
        let fs = InMemoryFileSystem::new();
        let dir = Path::new("/activity");
        fs.write_atomic(&dir.join("x.log"), b"hello").unwrap();

        let mut watcher = PollingWatcher::new(&fs, DEFAULT_POLL_INTERVAL);
        let first = watcher.tick(&[dir.to_path_buf()], |_| false).unwrap();
        assert!(first.is_empty());

        fs.write_atomic(&dir.join("x.log"), b"hello world").unwrap();
        let second = watcher.tick(&[dir.to_path_buf()], |_| false).unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].kind, ChangeKind::Modified);
    }

    #[test]
    fn is_own_write_matches_log_file_by_instance() {
        let mine = EntityId::new_random();
        let theirs = EntityId::new_random();
        let profile = EntityId::new_random();
        let name = LogFileName { profile_id: profile, instance_id: mine, creation_millis: 1 };
        let path = name.path_in(Path::new("/logs"));
        assert!(is_own_write(&path, mine));
        assert!(!is_own_write(&path, theirs));
    }
}
