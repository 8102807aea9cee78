//! Aggregated diagnostics (spec.md §6.2 "orphaned/duplicate/missing/stale
//! reports; stale-migration-lock cleanup; orphaned-activity-log cleanup"):
//! one [`Report`] combining the cache DB's doctor pass (C12), the peers the
//! sync poller has flagged stale this round (C8), and cross-SD moves whose
//! owner has gone quiet (C11). No new storage format — this just reads
//! three existing subsystems.

use crate::db::{CacheDb, DoctorReport, MoveRow};
use crate::error::Result;
use crate::id::EntityId;

/// A combined snapshot of everything worth surfacing to a user or an
/// operator dashboard.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Report {
    /// Orphan/duplicate-tag cleanup performed by the cache DB doctor pass.
    pub doctor: DoctorReport,
    /// `(instance_id, document_id)` pairs the most recent sync poll marked
    /// stale (gapped and confirmed missing on disk).
    pub stale_peers: Vec<(EntityId, EntityId)>,
    /// Cross-SD moves whose owner instance has been silent past the stale
    /// threshold, eligible for takeover.
    pub stuck_moves: Vec<MoveRow>,
}

/// Build a diagnostics report: runs the doctor pass fresh, folds in
/// `newly_stale` pairs surfaced by this round's activity/deletion poll, and
/// scans pending moves for staleness against `stale_after_millis`.
pub fn run_diagnostics(db: &CacheDb, now_millis: i64, stale_after_millis: i64, newly_stale: Vec<(EntityId, EntityId)>) -> Result<Report> {
    let doctor = db.doctor()?;
    let stuck_moves = db
        .list_moves()?
        .into_iter()
        .filter(|row| now_millis - row.updated_at >= stale_after_millis)
        .collect();
    Ok(Report { doctor, stale_peers: newly_stale, stuck_moves })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MoveRow;

    #[test]
    fn stuck_moves_filtered_by_staleness() {
        let db = CacheDb::open_in_memory().unwrap();
        let fresh = MoveRow {
            move_id: EntityId::new_random(),
            note_id: EntityId::new_random(),
            src_sd_id: EntityId::new_random(),
            dst_sd_id: EntityId::new_random(),
            state: "copying".to_string(),
            owner_instance_id: EntityId::new_random(),
            updated_at: 900,
        };
        let stuck = MoveRow {
            move_id: EntityId::new_random(),
            note_id: EntityId::new_random(),
            src_sd_id: EntityId::new_random(),
            dst_sd_id: EntityId::new_random(),
            state: "copying".to_string(),
            owner_instance_id: EntityId::new_random(),
            updated_at: 0,
        };
        db.insert_move(&fresh).unwrap();
        db.insert_move(&stuck).unwrap();

        let report = run_diagnostics(&db, 1_000, 300, vec![]).unwrap();
        assert_eq!(report.stuck_moves.len(), 1);
        assert_eq!(report.stuck_moves[0].move_id, stuck.move_id);
    }

    #[test]
    fn stale_peers_pass_through_unchanged() {
        let db = CacheDb::open_in_memory().unwrap();
        let instance = EntityId::new_random();
        let doc = EntityId::new_random();
        let report = run_diagnostics(&db, 0, 300, vec![(instance, doc)]).unwrap();
        assert_eq!(report.stale_peers, vec![(instance, doc)]);
    }
}
