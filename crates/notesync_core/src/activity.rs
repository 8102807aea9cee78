//! Append-only change feeds: the activity log (C7) and, by the same file
//! pattern under a different directory, the deletion log (C9).
//!
//! Line format: `{documentId}|{profileId}_{sequence}\n`. Filename:
//! `{profileId}_{instanceId}.log` under the feed's directory.

use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::fs::FileSystem;
use crate::id::EntityId;

/// Size at which an instance's own feed file is rewritten down to its
/// newest entries (spec.md §4.7 "Rotation").
pub const ROTATION_BYTES: u64 = 1024 * 1024;
/// Entry count at which rotation triggers even under the byte threshold.
pub const ROTATION_ENTRIES: usize = 1000;
/// Entries kept after a rotation rewrite.
const ROTATION_KEEP: usize = 1000;

/// One parsed feed line: a document changed, by whom, to what sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedEntry {
    /// Document the entry refers to.
    pub document_id: EntityId,
    /// Profile of the writing instance.
    pub profile_id: EntityId,
    /// Sequence number reached for this document by this instance.
    pub sequence: u64,
}

impl FeedEntry {
    fn format_line(&self) -> String {
        format!("{}|{}_{}\n", self.document_id, self.profile_id, self.sequence)
    }

    fn parse_line(line: &str) -> Option<Self> {
        let line = line.strip_suffix('\n').unwrap_or(line);
        let (doc_part, rest) = line.split_once('|')?;
        let (profile_part, seq_part) = rest.rsplit_once('_')?;
        Some(Self {
            document_id: doc_part.parse().ok()?,
            profile_id: profile_part.parse().ok()?,
            sequence: seq_part.parse().ok()?,
        })
    }
}

/// Build the filename for an instance's own feed file.
pub fn own_file_name(profile_id: EntityId, instance_id: EntityId) -> String {
    format!("{profile_id}_{instance_id}.log")
}

/// Parse `{profileId}_{instanceId}.log` into its parts, if well-formed.
pub fn parse_file_name(name: &str) -> Option<(EntityId, EntityId)> {
    let stem = name.strip_suffix(".log")?;
    let (profile, instance) = stem.split_once('_')?;
    Some((profile.parse().ok()?, instance.parse().ok()?))
}

/// Owns one instance's own feed file: appends are always safe because only
/// this instance ever writes it, so last-line-replace and rotation can use
/// a plain read-modify-write rather than the append-fsync discipline C2
/// requires.
pub struct FeedWriter<'a, F: FileSystem> {
    fs: &'a F,
    path: PathBuf,
}

impl<'a, F: FileSystem> FeedWriter<'a, F> {
    /// Open (creating the containing directory if needed) the feed file for
    /// this instance under `dir` (`activity/` or `deleted/`).
    pub fn open(fs: &'a F, dir: &Path, profile_id: EntityId, instance_id: EntityId) -> Result<Self> {
        fs.create_dir_all(dir)?;
        Ok(Self {
            fs,
            path: dir.join(own_file_name(profile_id, instance_id)),
        })
    }

    /// Record a change: collapse into the last line if it already refers to
    /// the same document, otherwise append a new line. Rotates first if the
    /// file has grown past the configured thresholds.
    pub fn record(&self, entry: FeedEntry) -> Result<()> {
        let mut lines = self.read_lines()?;
        if lines.len() >= ROTATION_ENTRIES || self.fs.file_len(&self.path).unwrap_or(0) >= ROTATION_BYTES {
            let keep_from = lines.len().saturating_sub(ROTATION_KEEP);
            lines.drain(0..keep_from);
        }

        let replaced = lines
            .last()
            .and_then(|l| FeedEntry::parse_line(l))
            .map(|last| last.document_id == entry.document_id)
            .unwrap_or(false);
        if replaced {
            *lines.last_mut().unwrap() = entry.format_line();
        } else {
            lines.push(entry.format_line());
        }

        let content: String = lines.concat();
        self.fs.write_file(&self.path, content.as_bytes())
            .map_err(|source| crate::error::EngineError::IoAt { path: self.path.clone(), source })
    }

    fn read_lines(&self) -> Result<Vec<String>> {
        if !self.fs.exists(&self.path) {
            return Ok(Vec::new());
        }
        let bytes = self.fs.read(&self.path).map_err(|source| crate::error::EngineError::IoAt {
            path: self.path.clone(),
            source,
        })?;
        let text = String::from_utf8_lossy(&bytes);
        Ok(text.lines().map(|l| format!("{l}\n")).collect())
    }
}

/// Read entries appended to a foreign feed file since `since_offset`,
/// tolerant of a trailing partial line (file replication lag): that partial
/// tail is left unconsumed, to be completed by a later poll.
///
/// Returns the parsed entries and the new offset to persist.
pub fn read_new_entries(fs: &dyn FileSystem, path: &Path, since_offset: u64) -> Result<(Vec<FeedEntry>, u64)> {
    let bytes = fs.read(path).map_err(|source| crate::error::EngineError::IoAt {
        path: path.to_path_buf(),
        source,
    })?;
    let start = (since_offset as usize).min(bytes.len());
    let tail = &bytes[start..];

    let mut entries = Vec::new();
    let mut consumed = 0usize;
    for segment in split_inclusive_newline(tail) {
        if !segment.ends_with(b"\n") {
            break; // partial trailing line; leave it for next poll
        }
        consumed += segment.len();
        if let Ok(text) = std::str::from_utf8(segment)
            && let Some(entry) = FeedEntry::parse_line(text)
        {
            entries.push(entry);
        }
    }
    Ok((entries, start as u64 + consumed as u64))
}

fn split_inclusive_newline(data: &[u8]) -> Vec<&[u8]> {
    let mut out = Vec::new();
    let mut start = 0;
    for (i, b) in data.iter().enumerate() {
        if *b == b'\n' {
            out.push(&data[start..=i]);
            start = i + 1;
        }
    }
    if start < data.len() {
        out.push(&data[start..]);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::InMemoryFileSystem;

    #[test]
    fn line_format_round_trips() {
        let entry = FeedEntry {
            document_id: EntityId::new_random(),
            profile_id: EntityId::new_random(),
            sequence: 42,
        };
        let line = entry.format_line();
        assert_eq!(FeedEntry::parse_line(&line), Some(entry));
    }

    #[test]
    fn last_line_replace_collapses_same_document() {
        let fs = InMemoryFileSystem::new();
        let profile = EntityId::new_random();
        let instance = EntityId::new_random();
        let doc = EntityId::new_random();
        let writer = FeedWriter::open(&fs, Path::new("/activity"), profile, instance).unwrap();

        writer.record(FeedEntry { document_id: doc, profile_id: profile, sequence: 1 }).unwrap();
        writer.record(FeedEntry { document_id: doc, profile_id: profile, sequence: 2 }).unwrap();
        writer.record(FeedEntry { document_id: doc, profile_id: profile, sequence: 3 }).unwrap();

        let lines = writer.read_lines().unwrap();
        assert_eq!(lines.len(), 1);
        assert_eq!(FeedEntry::parse_line(&lines[0]).unwrap().sequence, 3);
    }

    #[test]
    fn different_document_appends_new_line() {
        let fs = InMemoryFileSystem::new();
        let profile = EntityId::new_random();
        let instance = EntityId::new_random();
        let writer = FeedWriter::open(&fs, Path::new("/activity"), profile, instance).unwrap();

        writer.record(FeedEntry { document_id: EntityId::new_random(), profile_id: profile, sequence: 1 }).unwrap();
        writer.record(FeedEntry { document_id: EntityId::new_random(), profile_id: profile, sequence: 1 }).unwrap();

        assert_eq!(writer.read_lines().unwrap().len(), 2);
    }

    #[test]
    fn read_new_entries_stops_at_partial_trailing_line() {
        let fs = InMemoryFileSystem::new();
        let doc = EntityId::new_random();
        let profile = EntityId::new_random();
        let complete = FeedEntry { document_id: doc, profile_id: profile, sequence: 1 }.format_line();
        let mut bytes = complete.clone().into_bytes();
        bytes.extend_from_slice(format!("{doc}|").as_bytes()); // partial second line

        fs.write_atomic(Path::new("/activity/p_i.log"), &bytes).unwrap();
        let (entries, offset) = read_new_entries(&fs, Path::new("/activity/p_i.log"), 0).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(offset as usize, complete.len());
    }

    #[test]
    fn parse_and_format_file_names_round_trip() {
        let profile = EntityId::new_random();
        let instance = EntityId::new_random();
        let name = own_file_name(profile, instance);
        assert_eq!(parse_file_name(&name), Some((profile, instance)));
    }
}
