//! Streaming reader for `.crdtlog` files (C3).

use std::io::Cursor;
use std::path::{Path, PathBuf};

use crate::codec;
use crate::error::{EngineError, Result};
use crate::fs::FileSystem;

use super::LogRecord;

/// Outcome of reading a single log file end-to-end.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReadOutcome {
    /// Records recovered, in file order.
    pub records: Vec<LogRecord>,
    /// True if the file ended without a termination sentinel (zero-length
    /// record): either the writer that owns it hasn't shut it down cleanly,
    /// or this is the currently active file.
    pub unfinalized: bool,
    /// Byte offset at which a trailing partial record was discovered and
    /// discarded, if any. Distinguishes "ran out of records cleanly" from
    /// "ran out of bytes mid-record" for diagnostics and writer recovery.
    pub truncated_at_offset: Option<u64>,
}

/// Reads records out of a single `.crdtlog` file, tolerant of a missing
/// sentinel or a truncated trailing record — both recoverable, since the
/// writer that owns the file can be killed mid-append.
pub struct LogReader;

impl LogReader {
    /// Read every record out of `path`, validating the file header first.
    pub fn read_file(fs: &dyn FileSystem, path: &Path) -> Result<ReadOutcome> {
        let bytes = fs.read(path).map_err(|source| EngineError::IoAt {
            path: path.to_path_buf(),
            source,
        })?;
        let mut cursor = Cursor::new(bytes.as_slice());
        codec::read_header(&mut cursor, codec::LOG_MAGIC, path)?;

        let mut records = Vec::new();
        let mut unfinalized = true;
        let mut truncated_at_offset = None;

        loop {
            let record_start = cursor.position();
            let length = match codec::read_varint(&mut cursor) {
                Ok(Some(length)) => length,
                Ok(None) => break,
                Err(_) => {
                    truncated_at_offset = Some(record_start);
                    break;
                }
            };
            if length == 0 {
                unfinalized = false;
                break;
            }
            match read_record_body(&mut cursor, length) {
                Ok(record) => records.push(record),
                Err(_) => {
                    truncated_at_offset = Some(record_start);
                    break;
                }
            }
        }

        Ok(ReadOutcome {
            records,
            unfinalized,
            truncated_at_offset,
        })
    }
}

fn read_record_body(cursor: &mut Cursor<&[u8]>, length: u64) -> Result<LogRecord> {
    let start = cursor.position() as usize;
    let buf = *cursor.get_ref();
    let end = start.checked_add(length as usize).filter(|e| *e <= buf.len());
    let end = match end {
        Some(end) => end,
        None => {
            return Err(EngineError::Corrupt {
                reason: "record length exceeds remaining file bytes".to_string(),
                path: PathBuf::new(),
            });
        }
    };
    let body = &buf[start..end];
    let mut body_cursor = Cursor::new(body);
    let timestamp_millis = codec::read_u64_be(&mut body_cursor)?;
    let sequence = codec::read_varint(&mut body_cursor)?.ok_or_else(|| EngineError::Corrupt {
        reason: "record body too short for sequence field".to_string(),
        path: PathBuf::new(),
    })?;
    let data = body[body_cursor.position() as usize..].to_vec();
    cursor.set_position(end as u64);
    Ok(LogRecord {
        timestamp_millis,
        sequence,
        data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::write_header;
    use crate::fs::InMemoryFileSystem;
    use crate::log::{encode_record, encode_sentinel};

    fn sample(sequence: u64, data: &[u8]) -> LogRecord {
        LogRecord {
            timestamp_millis: 1_700_000_000_000 + sequence,
            sequence,
            data: data.to_vec(),
        }
    }

    #[test]
    fn reads_finalized_file() {
        let mut buf = Vec::new();
        write_header(&mut buf, codec::LOG_MAGIC).unwrap();
        encode_record(&mut buf, &sample(1, b"a")).unwrap();
        encode_record(&mut buf, &sample(2, b"bb")).unwrap();
        encode_sentinel(&mut buf).unwrap();

        let fs = InMemoryFileSystem::new();
        fs.write_atomic(Path::new("/x.crdtlog"), &buf).unwrap();
        let outcome = LogReader::read_file(&fs, Path::new("/x.crdtlog")).unwrap();
        assert_eq!(outcome.records, vec![sample(1, b"a"), sample(2, b"bb")]);
        assert!(!outcome.unfinalized);
        assert!(outcome.truncated_at_offset.is_none());
    }

    #[test]
    fn missing_sentinel_is_unfinalized_not_an_error() {
        let mut buf = Vec::new();
        write_header(&mut buf, codec::LOG_MAGIC).unwrap();
        encode_record(&mut buf, &sample(1, b"a")).unwrap();

        let fs = InMemoryFileSystem::new();
        fs.write_atomic(Path::new("/x.crdtlog"), &buf).unwrap();
        let outcome = LogReader::read_file(&fs, Path::new("/x.crdtlog")).unwrap();
        assert_eq!(outcome.records, vec![sample(1, b"a")]);
        assert!(outcome.unfinalized);
        assert!(outcome.truncated_at_offset.is_none());
    }

    #[test]
    fn truncated_trailing_record_is_reported_and_dropped() {
        let mut buf = Vec::new();
        write_header(&mut buf, codec::LOG_MAGIC).unwrap();
        encode_record(&mut buf, &sample(1, b"a")).unwrap();
        let cut_point = buf.len();
        encode_record(&mut buf, &sample(2, b"this gets cut off")).unwrap();
        buf.truncate(cut_point + 3);

        let fs = InMemoryFileSystem::new();
        fs.write_atomic(Path::new("/x.crdtlog"), &buf).unwrap();
        let outcome = LogReader::read_file(&fs, Path::new("/x.crdtlog")).unwrap();
        assert_eq!(outcome.records, vec![sample(1, b"a")]);
        assert!(outcome.unfinalized);
        assert_eq!(outcome.truncated_at_offset, Some(cut_point as u64));
    }

    #[test]
    fn bad_magic_is_rejected() {
        let fs = InMemoryFileSystem::new();
        fs.write_atomic(Path::new("/x.crdtlog"), b"nope!").unwrap();
        let err = LogReader::read_file(&fs, Path::new("/x.crdtlog")).unwrap_err();
        assert!(matches!(err, EngineError::BadMagic { .. } | EngineError::Corrupt { .. }));
    }
}
