//! Cross-instance discovery by polling activity/deletion feed files (C8/C9).
//!
//! Both feeds share one polling shape: read new bytes from every foreign
//! file, decide per-document whether a gap means ordinary replication lag
//! or a genuinely stale peer, and queue affected documents for reload.

use std::collections::HashMap;
use std::path::Path;

use crate::activity;
use crate::db::CacheDb;
use crate::error::Result;
use crate::fs::FileSystem;
use crate::id::EntityId;

/// Sequence-gap threshold beyond which a missing-on-disk record is treated
/// as a stale peer rather than ordinary file-replication lag (spec.md §4.8).
pub const STALE_SEQUENCE_GAP_THRESHOLD: u64 = 50;

/// Outcome of one poll pass over a single foreign feed file.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PollOutcome {
    /// Documents with new visible updates, queued for reload via C6.
    pub documents_to_reload: Vec<EntityId>,
    /// `(instance_id, document_id)` pairs newly marked stale this poll.
    pub newly_stale: Vec<(EntityId, EntityId)>,
}

/// Poll one foreign feed file, applying the gap/stale rule: the check must
/// use the *highest* sequence seen for a document in this batch, not the
/// entry being examined, so one presence check per document per poll
/// suffices (spec.md §4.8 "Gap semantics").
pub fn poll_foreign_log(
    fs: &dyn FileSystem,
    db: &CacheDb,
    sd_id: EntityId,
    dir: &Path,
    file_name: &str,
    local_sequence_for: impl Fn(EntityId, EntityId) -> u64,
    check_log_exists: impl Fn(EntityId, EntityId, u64) -> bool,
) -> Result<PollOutcome> {
    let Some((_, instance_id)) = activity::parse_file_name(file_name) else {
        return Ok(PollOutcome::default());
    };
    let path = dir.join(file_name);
    let since_offset = db
        .get_log_offset(sd_id, file_name)?
        .map(|(offset, _)| offset)
        .unwrap_or(0);
    let (entries, new_offset) = activity::read_new_entries(fs, &path, since_offset)?;

    let mut highest_seq_for_doc: HashMap<EntityId, u64> = HashMap::new();
    for entry in &entries {
        let slot = highest_seq_for_doc.entry(entry.document_id).or_insert(0);
        if entry.sequence > *slot {
            *slot = entry.sequence;
        }
    }

    let mut outcome = PollOutcome::default();
    for entry in &entries {
        let local_seq = local_sequence_for(instance_id, entry.document_id);
        if entry.sequence <= local_seq {
            continue;
        }
        let highest = highest_seq_for_doc[&entry.document_id];
        let gap = highest.saturating_sub(local_seq);
        if gap > STALE_SEQUENCE_GAP_THRESHOLD && !check_log_exists(instance_id, entry.document_id, highest) {
            if !outcome.newly_stale.contains(&(instance_id, entry.document_id)) {
                outcome.newly_stale.push((instance_id, entry.document_id));
            }
        } else if !outcome.documents_to_reload.contains(&entry.document_id) {
            outcome.documents_to_reload.push(entry.document_id);
        }
    }

    db.set_log_offset(sd_id, file_name, new_offset, file_name)?;
    Ok(outcome)
}

/// List feed files in `dir` other than this instance's own.
pub fn foreign_logs(fs: &dyn FileSystem, dir: &Path, own_file_name: &str) -> Result<Vec<String>> {
    let entries = fs.list_dir(dir)?;
    Ok(entries
        .iter()
        .filter_map(|p| p.file_name()?.to_str().map(str::to_string))
        .filter(|name| name != own_file_name && activity::parse_file_name(name).is_some())
        .collect())
}

/// Remove foreign feed files whose staleness (by age) is reported true by
/// `is_stale`, along with their offset bookkeeping (spec.md §4.8 "Orphan
/// cleanup"). Age itself is a caller concern: the [`FileSystem`] abstraction
/// intentionally has no mtime method, so callers derive staleness from
/// whatever clock/metadata source they have (the native backend can use
/// filesystem mtimes; the in-memory test backend, a virtual clock).
pub fn remove_orphaned_logs(
    fs: &dyn FileSystem,
    db: &CacheDb,
    sd_id: EntityId,
    dir: &Path,
    own_file_name: &str,
    is_stale: impl Fn(&str) -> bool,
) -> Result<u64> {
    let mut removed = 0u64;
    let mut stale_keys = Vec::new();
    for name in foreign_logs(fs, dir, own_file_name)? {
        if is_stale(&name) {
            fs.remove_file(&dir.join(&name))?;
            stale_keys.push(name);
            removed += 1;
        }
    }
    db.remove_log_offset_keys(sd_id, &stale_keys)?;
    Ok(removed)
}
