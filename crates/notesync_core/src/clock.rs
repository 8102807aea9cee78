//! Per-document vector clocks (spec.md §3, §4.4, §4.6).

use std::collections::BTreeMap;
use std::io::Read;

use serde::{Deserialize, Serialize};

use crate::codec;
use crate::error::{EngineError, Result};
use crate::id::EntityId;

/// Identifies the instance (process, machine, and profile) that wrote a
/// record. An alias rather than a distinct type: instances, notes, and SDs
/// all share the same [`EntityId`] representation.
pub type InstanceId = EntityId;

/// How much of one instance's update stream has been incorporated into a
/// document: the highest contiguous sequence applied, and where to resume
/// reading its log file from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockEntry {
    /// Highest contiguous sequence number applied from this instance.
    pub sequence: u64,
    /// Byte offset within `filename` immediately after the last applied
    /// record, used to resume a partial tail read.
    pub offset: u64,
    /// Log file the offset is relative to.
    pub filename: String,
}

/// `{instance_id -> (sequence, offset, filename)}`: tracks how much of each
/// instance's update stream a document's in-memory (or snapshotted) state
/// has incorporated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorClock {
    entries: BTreeMap<InstanceId, ClockEntry>,
}

impl VectorClock {
    /// An empty clock, as held by a freshly created document.
    pub fn new() -> Self {
        Self::default()
    }

    /// The recorded entry for `instance`, if any.
    pub fn get(&self, instance: InstanceId) -> Option<&ClockEntry> {
        self.entries.get(&instance)
    }

    /// The highest contiguous sequence applied from `instance`, or 0 if none.
    pub fn sequence_for(&self, instance: InstanceId) -> u64 {
        self.entries.get(&instance).map(|e| e.sequence).unwrap_or(0)
    }

    /// Advance `instance`'s entry, as invariant 1 (spec.md §3) requires: a
    /// sequence only ever moves forward, never backward or sideways.
    pub fn advance(&mut self, instance: InstanceId, sequence: u64, offset: u64, filename: impl Into<String>) {
        let entry = self.entries.entry(instance).or_insert_with(|| ClockEntry {
            sequence: 0,
            offset: 0,
            filename: String::new(),
        });
        if sequence > entry.sequence {
            entry.sequence = sequence;
            entry.offset = offset;
            entry.filename = filename.into();
        }
    }

    /// Sum of sequences across all instances: a snapshot's `totalChanges`.
    pub fn total_changes(&self) -> u64 {
        self.entries.values().map(|e| e.sequence).sum()
    }

    /// Iterate entries in instance-id order (deterministic encoding order).
    pub fn iter(&self) -> impl Iterator<Item = (&InstanceId, &ClockEntry)> {
        self.entries.iter()
    }

    /// Merge `other` in, keeping the higher sequence per instance. Used when
    /// folding a pack's or snapshot's clock into the in-memory one.
    pub fn merge_from(&mut self, other: &VectorClock) {
        for (id, entry) in &other.entries {
            if entry.sequence > self.sequence_for(*id) {
                self.entries.insert(*id, entry.clone());
            }
        }
    }

    /// Encode as `varint(count) ‖ count × {instance_id, sequence, offset,
    /// filename}`, the layout embedded in snapshot files (spec.md §4.4).
    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<()> {
        codec::write_varint(buf, self.entries.len() as u64)?;
        for (id, entry) in &self.entries {
            codec::write_string(buf, &id.to_compact())?;
            codec::write_varint(buf, entry.sequence)?;
            codec::write_varint(buf, entry.offset)?;
            codec::write_string(buf, &entry.filename)?;
        }
        Ok(())
    }

    /// Decode the layout written by [`Self::encode`].
    pub fn decode<R: Read>(r: &mut R) -> Result<Self> {
        let count = codec::read_varint(r)?.ok_or_else(|| EngineError::Corrupt {
            reason: "truncated vector clock entry count".to_string(),
            path: std::path::PathBuf::new(),
        })?;
        let mut entries = BTreeMap::new();
        for _ in 0..count {
            let id_str = codec::read_string(r)?;
            let instance_id: InstanceId = id_str.parse()?;
            let sequence = codec::read_varint(r)?.ok_or_else(|| EngineError::Corrupt {
                reason: "truncated vector clock sequence".to_string(),
                path: std::path::PathBuf::new(),
            })?;
            let offset = codec::read_varint(r)?.ok_or_else(|| EngineError::Corrupt {
                reason: "truncated vector clock offset".to_string(),
                path: std::path::PathBuf::new(),
            })?;
            let filename = codec::read_string(r)?;
            entries.insert(
                instance_id,
                ClockEntry {
                    sequence,
                    offset,
                    filename,
                },
            );
        }
        Ok(Self { entries })
    }
}
