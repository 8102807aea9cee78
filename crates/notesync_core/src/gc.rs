//! Pack/Snapshot/GC background jobs (C10): operate only on files written by
//! this instance, since remote files exhibit replication lag and may show
//! sequence gaps that aren't real (spec.md §4.10).

use std::collections::{HashMap, HashSet};
use std::path::Path;

use crate::clock::VectorClock;
use crate::error::Result;
use crate::fs::FileSystem;
use crate::id::EntityId;
use crate::log::{LogFileName, LogReader, LogRecord};
use crate::pack::{self, PackFileName};
use crate::snapshot::{self, filename::selection_order};

/// Minimum contiguous run length before packing (spec.md §4.10 "Packing").
pub const PACK_MIN_ENTRIES: usize = 100;
/// Minimum age, in milliseconds, of a run's newest record before packing.
pub const PACK_MIN_AGE_MILLIS: u64 = 5 * 60 * 1000;
/// Sequences at the tail of each instance's stream left unpacked, for fast
/// incremental sync.
pub const UNPACKED_TAIL: u64 = 50;
/// Accumulated-update threshold that triggers a periodic re-snapshot.
pub const RESNAPSHOT_TRIGGER: u64 = 1000;
/// Number of newest snapshots kept during GC.
pub const RETAIN_SNAPSHOTS: usize = 3;
/// Default age, in seconds, before a fully-covered pack/log file is eligible
/// for GC.
pub const DEFAULT_RETENTION_SECONDS: u64 = 24 * 60 * 60;

/// Pack this instance's own fully-rotated (non-active) log files: contiguous
/// sequence runs of at least [`PACK_MIN_ENTRIES`], whose newest record is at
/// least [`PACK_MIN_AGE_MILLIS`] old, excluding the newest [`UNPACKED_TAIL`]
/// sequences. Source files fully covered by a written pack are deleted
/// afterward (write-then-delete). Returns the packs written.
pub fn pack_own_updates(fs: &dyn FileSystem, logs_dir: &Path, packs_dir: &Path, instance_id: EntityId, now_millis: u64) -> Result<Vec<PackFileName>> {
    let mut files = own_log_files(fs, logs_dir, instance_id)?;
    files.sort_by_key(|n| n.creation_millis);
    // The newest file is presumed active (still being appended to); packing
    // only ever touches already-rotated files.
    if files.len() < 2 {
        return Ok(Vec::new());
    }
    let finalized = &files[..files.len() - 1];

    let mut per_file_total: HashMap<String, usize> = HashMap::new();
    let mut records: Vec<(String, LogRecord)> = Vec::new();
    for name in finalized {
        let outcome = LogReader::read_file(fs, &name.path_in(logs_dir))?;
        per_file_total.insert(name.format(), outcome.records.len());
        for record in outcome.records {
            records.push((name.format(), record));
        }
    }
    records.sort_by_key(|(_, r)| r.sequence);

    let mut runs: Vec<Vec<(String, LogRecord)>> = Vec::new();
    for item in records {
        match runs.last_mut() {
            Some(run) if run.last().unwrap().1.sequence + 1 == item.1.sequence => run.push(item),
            _ => runs.push(vec![item]),
        }
    }

    let max_seq = runs.last().and_then(|r| r.last()).map(|(_, rec)| rec.sequence).unwrap_or(0);
    let cutoff = max_seq.saturating_sub(UNPACKED_TAIL);

    let mut written = Vec::new();
    for run in runs {
        let eligible: Vec<(String, LogRecord)> = run.into_iter().filter(|(_, r)| r.sequence <= cutoff).collect();
        if eligible.len() < PACK_MIN_ENTRIES {
            continue;
        }
        let newest_ts = eligible.iter().map(|(_, r)| r.timestamp_millis).max().unwrap_or(0);
        if now_millis.saturating_sub(newest_ts) < PACK_MIN_AGE_MILLIS {
            continue;
        }

        let mut covered_count: HashMap<String, usize> = HashMap::new();
        let records: Vec<LogRecord> = eligible
            .iter()
            .map(|(file, r)| {
                *covered_count.entry(file.clone()).or_insert(0) += 1;
                r.clone()
            })
            .collect();

        let pack_path = pack::write_pack(fs, packs_dir, instance_id, &records)?;
        let Some(name) = PackFileName::parse_path(&pack_path) else {
            continue;
        };

        let fully_covered: HashSet<String> = covered_count
            .into_iter()
            .filter(|(file, count)| per_file_total.get(file) == Some(count))
            .map(|(file, _)| file)
            .collect();
        for file_name in fully_covered {
            fs.remove_file(&logs_dir.join(&file_name))?;
        }
        written.push(name);
    }
    Ok(written)
}

fn own_log_files(fs: &dyn FileSystem, logs_dir: &Path, instance_id: EntityId) -> Result<Vec<LogFileName>> {
    let entries = fs.list_dir(logs_dir)?;
    Ok(entries
        .iter()
        .filter_map(|p| LogFileName::parse_path(p))
        .filter(|n| n.instance_id == instance_id)
        .collect())
}

/// Write a fresh snapshot if at least [`RESNAPSHOT_TRIGGER`] updates have
/// accumulated since the last one. Returns whether a snapshot was written.
pub fn resnapshot_if_due(fs: &dyn FileSystem, snapshots_dir: &Path, instance_id: EntityId, clock: &VectorClock, state: &[u8], updates_since_last_snapshot: u64) -> Result<bool> {
    if updates_since_last_snapshot < RESNAPSHOT_TRIGGER {
        return Ok(false);
    }
    snapshot::write_snapshot(fs, snapshots_dir, instance_id, clock, state)?;
    Ok(true)
}

/// Result of one GC pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcReport {
    /// Snapshots removed beyond the retained newest set.
    pub snapshots_removed: u64,
    /// Packs removed because fully covered and past retention age.
    pub packs_removed: u64,
    /// Log files removed because fully covered and past retention age.
    pub logs_removed: u64,
}

/// Retain the newest [`RETAIN_SNAPSHOTS`] snapshots; delete packs and log
/// files fully covered by the oldest retained snapshot's vector clock *and*
/// reported old enough by `is_past_retention` (file age has no place in the
/// [`FileSystem`] abstraction, so callers supply it from whatever clock
/// source they have — see [`crate::sync_poller::remove_orphaned_logs`] for
/// the same pattern).
pub fn run_gc(fs: &dyn FileSystem, snapshots_dir: &Path, packs_dir: &Path, logs_dir: &Path, is_past_retention: impl Fn(&Path) -> bool) -> Result<GcReport> {
    let entries = fs.list_dir(snapshots_dir)?;
    let mut candidates: Vec<crate::snapshot::SnapshotFileName> = entries.iter().filter_map(|p| crate::snapshot::SnapshotFileName::parse_path(p)).collect();
    selection_order(&mut candidates);

    let mut report = GcReport::default();
    let mut oldest_retained_clock = None;
    for (i, candidate) in candidates.iter().enumerate() {
        let path = candidate.path_in(snapshots_dir);
        if i < RETAIN_SNAPSHOTS {
            if let Ok(Some(outcome)) = snapshot::read_file(fs, &path) {
                oldest_retained_clock = Some(outcome.clock);
            }
        } else {
            fs.remove_file(&path)?;
            report.snapshots_removed += 1;
        }
    }

    let Some(clock) = oldest_retained_clock else {
        return Ok(report);
    };

    for entry in fs.list_dir(packs_dir)? {
        let Some(name) = PackFileName::parse_path(&entry) else { continue };
        if name.end_seq <= clock.sequence_for(name.instance_id) && is_past_retention(&entry) {
            fs.remove_file(&entry)?;
            report.packs_removed += 1;
        }
    }

    for entry in fs.list_dir(logs_dir)? {
        let Some(name) = LogFileName::parse_path(&entry) else { continue };
        if !is_past_retention(&entry) {
            continue;
        }
        let outcome = LogReader::read_file(fs, &entry)?;
        let fully_covered = outcome.records.iter().all(|r| r.sequence <= clock.sequence_for(name.instance_id));
        if fully_covered && !outcome.unfinalized {
            fs.remove_file(&entry)?;
            report.logs_removed += 1;
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::InMemoryFileSystem;
    use crate::log::LogWriter;

    fn make_finalized_run(fs: &InMemoryFileSystem, logs_dir: &Path, profile: EntityId, instance: EntityId, count: u64, timestamp: u64) {
        let writer = LogWriter::open(fs, logs_dir, profile, instance).unwrap();
        for i in 1..=count {
            writer.append(timestamp, i, vec![i as u8]).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn packs_old_contiguous_run_and_deletes_covered_file() {
        let fs = InMemoryFileSystem::new();
        let logs_dir = Path::new("/logs");
        let packs_dir = Path::new("/packs");
        let profile = EntityId::new_random();
        let instance = EntityId::new_random();

        // An old, fully-rotated file with 200 records (well past tail + min entries).
        make_finalized_run(&fs, logs_dir, profile, instance, 200, 1_000);
        // The active (newest) file, left alone by packing.
        let active = LogWriter::open(&fs, logs_dir, profile, instance).unwrap();
        active.append(500_000, 201, b"still active".to_vec()).unwrap();

        let written = pack_own_updates(&fs, logs_dir, packs_dir, instance, 1_000 + PACK_MIN_AGE_MILLIS + 1).unwrap();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].start_seq, 1);

        let remaining_logs: Vec<_> = fs
            .list_dir(logs_dir)
            .unwrap()
            .iter()
            .filter_map(|p| LogFileName::parse_path(p))
            .collect();
        assert_eq!(remaining_logs.len(), 1);
        assert_eq!(remaining_logs[0].creation_millis, LogFileName::parse_path(&active.active_path()).unwrap().creation_millis);
    }

    #[test]
    fn skips_young_run() {
        let fs = InMemoryFileSystem::new();
        let logs_dir = Path::new("/logs");
        let packs_dir = Path::new("/packs");
        let profile = EntityId::new_random();
        let instance = EntityId::new_random();

        make_finalized_run(&fs, logs_dir, profile, instance, 200, 1_000);
        let active = LogWriter::open(&fs, logs_dir, profile, instance).unwrap();
        active.append(1_000, 201, b"x".to_vec()).unwrap();

        // "Now" is right at the run's own timestamp: not old enough yet.
        let written = pack_own_updates(&fs, logs_dir, packs_dir, instance, 1_000).unwrap();
        assert!(written.is_empty());
    }

    #[test]
    fn gc_retains_newest_snapshots_and_removes_covered_packs() {
        let fs = InMemoryFileSystem::new();
        let snapshots_dir = Path::new("/snapshots");
        let packs_dir = Path::new("/packs");
        let logs_dir = Path::new("/logs");
        let instance = EntityId::new_random();

        let mut low = VectorClock::new();
        low.advance(instance, 50, 0, "a.crdtlog");
        snapshot::write_snapshot(&fs, snapshots_dir, instance, &low, b"s1").unwrap();

        let mut high = VectorClock::new();
        high.advance(instance, 500, 0, "b.crdtlog");
        snapshot::write_snapshot(&fs, snapshots_dir, instance, &high, b"s2").unwrap();

        pack::write_pack(&fs, packs_dir, instance, &[LogRecord { timestamp_millis: 0, sequence: 1, data: vec![] }, LogRecord { timestamp_millis: 0, sequence: 2, data: vec![] }]).unwrap();

        let report = run_gc(&fs, snapshots_dir, packs_dir, logs_dir, |_| true).unwrap();
        assert_eq!(report.snapshots_removed, 0); // only 2 snapshots exist, under the retain-3 cap
        assert!(report.packs_removed >= 1);
    }
}
