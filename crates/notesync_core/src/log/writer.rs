//! Append-only log writer (C2).

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::codec;
use crate::error::Result;
use crate::fs::FileSystem;
use crate::id::EntityId;

use super::reader::LogReader;
use super::{DEFAULT_ROTATION_BYTES, LogFileName, LogRecord, encode_record, encode_sentinel};

/// Header size in bytes (4-byte magic + 1-byte version).
const HEADER_LEN: u64 = 5;

struct State {
    current: LogFileName,
    size: u64,
}

/// Owns the single active `.crdtlog` file for one instance writing into one
/// document's `logs/` directory, appending records and rotating once the
/// file grows past its configured rotation threshold.
///
/// Only the owning instance ever writes to its own files, so no
/// cross-process locking is needed beyond the in-process [`Mutex`] guarding
/// concurrent callers within this engine.
pub struct LogWriter<'a, F: FileSystem> {
    fs: &'a F,
    logs_dir: PathBuf,
    profile_id: EntityId,
    instance_id: EntityId,
    rotation_bytes: u64,
    state: Mutex<State>,
}

impl<'a, F: FileSystem> LogWriter<'a, F> {
    /// Open (or create) the active log file for this instance, running the
    /// validate-on-open recovery pass: locate the latest file this instance
    /// owns, and either resume appending to it (truncating a partial
    /// trailing record first) or start a fresh file if it was already
    /// finalized or is unrecoverable.
    pub fn open(
        fs: &'a F,
        logs_dir: &Path,
        profile_id: EntityId,
        instance_id: EntityId,
    ) -> Result<Self> {
        Self::open_with_rotation(fs, logs_dir, profile_id, instance_id, DEFAULT_ROTATION_BYTES)
    }

    /// As [`Self::open`], with an explicit rotation threshold (tests use a
    /// small one to exercise rotation without writing megabytes of data).
    pub fn open_with_rotation(
        fs: &'a F,
        logs_dir: &Path,
        profile_id: EntityId,
        instance_id: EntityId,
        rotation_bytes: u64,
    ) -> Result<Self> {
        fs.create_dir_all(logs_dir)?;
        let existing = own_files(fs, logs_dir, instance_id)?;
        let state = match existing.into_iter().max_by_key(|f| f.creation_millis) {
            None => fresh_state(fs, logs_dir, profile_id, instance_id, now_millis())?,
            Some(latest) => recover(fs, logs_dir, latest)?,
        };

        Ok(Self {
            fs,
            logs_dir: logs_dir.to_path_buf(),
            profile_id,
            instance_id,
            rotation_bytes,
            state: Mutex::new(state),
        })
    }

    /// Path of the currently active log file.
    pub fn active_path(&self) -> PathBuf {
        let state = self.state.lock().unwrap();
        state.current.path_in(&self.logs_dir)
    }

    /// Bare filename of the currently active log file.
    pub fn active_file_name(&self) -> String {
        let state = self.state.lock().unwrap();
        state.current.format()
    }

    /// Byte length of the currently active log file, including its header.
    pub fn active_len(&self) -> u64 {
        self.state.lock().unwrap().size
    }

    /// Append one record: write then fsync before returning, rotating to a
    /// fresh file first if the active one has grown past the rotation
    /// threshold. Returns whether this call rotated, so a caller can fire
    /// the mandatory on-rotation snapshot (spec.md §4.1 "Snapshot triggers").
    pub fn append(&self, timestamp_millis: u64, sequence: u64, data: Vec<u8>) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        let rotated = if state.size >= self.rotation_bytes {
            self.rotate(&mut state)?;
            true
        } else {
            false
        };

        let record = LogRecord {
            timestamp_millis,
            sequence,
            data,
        };
        let mut buf = Vec::new();
        encode_record(&mut buf, &record)?;
        let path = state.current.path_in(&self.logs_dir);
        self.fs.append_fsync(&path, &buf)?;
        state.size += buf.len() as u64;
        Ok(rotated)
    }

    /// Write the termination sentinel and fsync. Call on clean shutdown so
    /// the next `open` treats this file as finalized rather than resuming
    /// it.
    pub fn finalize(&self) -> Result<()> {
        let state = self.state.lock().unwrap();
        let mut buf = Vec::new();
        encode_sentinel(&mut buf)?;
        let path = state.current.path_in(&self.logs_dir);
        self.fs.append_fsync(&path, &buf)?;
        Ok(())
    }

    fn rotate(&self, state: &mut State) -> Result<()> {
        let mut buf = Vec::new();
        encode_sentinel(&mut buf)?;
        let old_path = state.current.path_in(&self.logs_dir);
        self.fs.append_fsync(&old_path, &buf)?;

        let next = fresh_state(
            self.fs,
            &self.logs_dir,
            self.profile_id,
            self.instance_id,
            now_millis().max(state.current.creation_millis + 1),
        )?;
        *state = next;
        Ok(())
    }
}

fn own_files<F: FileSystem>(
    fs: &F,
    logs_dir: &Path,
    instance_id: EntityId,
) -> Result<Vec<LogFileName>> {
    let entries = fs.list_dir(logs_dir)?;
    Ok(entries
        .iter()
        .filter_map(|p| LogFileName::parse_path(p))
        .filter(|n| n.instance_id == instance_id)
        .collect())
}

fn fresh_state<F: FileSystem>(
    fs: &F,
    logs_dir: &Path,
    profile_id: EntityId,
    instance_id: EntityId,
    creation_millis: u64,
) -> Result<State> {
    let current = LogFileName {
        profile_id,
        instance_id,
        creation_millis,
    };
    let mut buf = Vec::new();
    codec::write_header(&mut buf, codec::LOG_MAGIC)?;
    let path = current.path_in(logs_dir);
    fs.write_atomic(&path, &buf)?;
    Ok(State {
        current,
        size: HEADER_LEN,
    })
}

fn recover<F: FileSystem>(fs: &F, logs_dir: &Path, latest: LogFileName) -> Result<State> {
    let path = latest.path_in(logs_dir);

    let outcome = match LogReader::read_file(fs, &path) {
        Ok(outcome) => outcome,
        Err(_) => {
            // Header itself didn't validate; nothing in this file is worth
            // keeping, so start over at a bumped timestamp.
            return fresh_state(
                fs,
                logs_dir,
                latest.profile_id,
                latest.instance_id,
                now_millis().max(latest.creation_millis + 1),
            );
        }
    };

    if !outcome.unfinalized {
        return fresh_state(
            fs,
            logs_dir,
            latest.profile_id,
            latest.instance_id,
            now_millis().max(latest.creation_millis + 1),
        );
    }

    if let Some(offset) = outcome.truncated_at_offset {
        fs.truncate(&path, offset)?;
        return Ok(State {
            current: latest,
            size: offset,
        });
    }

    let size = fs.file_len(&path).unwrap_or(HEADER_LEN);
    Ok(State {
        current: latest,
        size,
    })
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::InMemoryFileSystem;

    #[test]
    fn append_then_read_back() {
        let fs = InMemoryFileSystem::new();
        let profile = EntityId::new_random();
        let instance = EntityId::new_random();
        let dir = Path::new("/logs");
        let writer = LogWriter::open(&fs, dir, profile, instance).unwrap();
        writer.append(1, 1, b"a".to_vec()).unwrap();
        writer.append(2, 2, b"bb".to_vec()).unwrap();
        writer.finalize().unwrap();

        let outcome = LogReader::read_file(&fs, &writer.active_path()).unwrap();
        assert_eq!(outcome.records.len(), 2);
        assert!(!outcome.unfinalized);
    }

    #[test]
    fn reopen_resumes_unfinalized_file() {
        let fs = InMemoryFileSystem::new();
        let profile = EntityId::new_random();
        let instance = EntityId::new_random();
        let dir = Path::new("/logs");
        {
            let writer = LogWriter::open(&fs, dir, profile, instance).unwrap();
            writer.append(1, 1, b"a".to_vec()).unwrap();
            // No finalize: simulates a crash.
        }
        let writer = LogWriter::open(&fs, dir, profile, instance).unwrap();
        writer.append(2, 2, b"bb".to_vec()).unwrap();
        writer.finalize().unwrap();

        let outcome = LogReader::read_file(&fs, &writer.active_path()).unwrap();
        assert_eq!(outcome.records.len(), 2);
    }

    #[test]
    fn reopen_truncates_partial_trailing_record() {
        let fs = InMemoryFileSystem::new();
        let profile = EntityId::new_random();
        let instance = EntityId::new_random();
        let dir = Path::new("/logs");
        let path;
        {
            let writer = LogWriter::open(&fs, dir, profile, instance).unwrap();
            writer.append(1, 1, b"good".to_vec()).unwrap();
            path = writer.active_path();
        }
        // Corrupt the tail to simulate a crash mid-append.
        let mut bytes = fs.read(&path).unwrap();
        bytes.extend_from_slice(&[0x80, 0x01]);
        fs.write_atomic(&path, &bytes).unwrap();

        let writer = LogWriter::open(&fs, dir, profile, instance).unwrap();
        assert_eq!(writer.active_path(), path);
        let outcome = LogReader::read_file(&fs, &path).unwrap();
        assert_eq!(outcome.records.len(), 1);

        writer.append(2, 2, b"more".to_vec()).unwrap();
        writer.finalize().unwrap();
        let outcome = LogReader::read_file(&fs, &path).unwrap();
        assert_eq!(outcome.records.len(), 2);
    }

    #[test]
    fn rotation_starts_a_new_file_with_a_later_timestamp() {
        let fs = InMemoryFileSystem::new();
        let profile = EntityId::new_random();
        let instance = EntityId::new_random();
        let dir = Path::new("/logs");
        let writer = LogWriter::open_with_rotation(&fs, dir, profile, instance, 1).unwrap();
        let first_path = writer.active_path();
        assert!(!writer.append(1, 1, b"trigger rotation next append".to_vec()).unwrap());
        assert!(writer.append(2, 2, b"after rotation".to_vec()).unwrap());
        let second_path = writer.active_path();
        assert_ne!(first_path, second_path);

        let first_name = LogFileName::parse_path(&first_path).unwrap();
        let second_name = LogFileName::parse_path(&second_path).unwrap();
        assert!(second_name.creation_millis > first_name.creation_millis);

        let first_outcome = LogReader::read_file(&fs, &first_path).unwrap();
        assert!(!first_outcome.unfinalized);
        assert_eq!(first_outcome.records.len(), 1);
    }

    #[test]
    fn reopen_after_clean_finalize_starts_fresh_file() {
        let fs = InMemoryFileSystem::new();
        let profile = EntityId::new_random();
        let instance = EntityId::new_random();
        let dir = Path::new("/logs");
        let first_path;
        {
            let writer = LogWriter::open(&fs, dir, profile, instance).unwrap();
            writer.append(1, 1, b"a".to_vec()).unwrap();
            writer.finalize().unwrap();
            first_path = writer.active_path();
        }
        let writer = LogWriter::open(&fs, dir, profile, instance).unwrap();
        assert_ne!(writer.active_path(), first_path);
    }
}
