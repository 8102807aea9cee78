use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

/// Unified error type for engine operations.
///
/// Failures that are expected and recoverable in normal operation
/// (truncated logs, incomplete snapshots, stale activity entries) are
/// modeled as data returned from the relevant component, not as errors —
/// see `log::reader`, `snapshot`, and `activity_sync`. This enum is
/// reserved for conditions the caller must actually decide what to do
/// about.
#[derive(Debug, Error)]
pub enum EngineError {
    /// General I/O failure not otherwise categorized below.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// I/O failure tied to a specific path, used where the path matters for
    /// diagnostics (e.g. a failed append to a `.crdtlog` file).
    #[error("IO error at '{path}': {source}")]
    IoAt {
        /// Path the operation was acting on.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Requested entity (document, SD, instance, move) does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation conflicts with concurrent state (e.g. a move already in
    /// flight for this note, or a profile lock already held elsewhere).
    #[error("Conflict: {0}")]
    Conflict(String),

    /// On-disk data failed to parse or violated a structural invariant.
    #[error("Corrupt data at '{path}': {reason}")]
    Corrupt {
        /// Human-readable description of what was wrong.
        reason: String,
        /// Path of the offending file.
        path: PathBuf,
    },

    /// Caller lacks permission to read or write the given path.
    #[error("Permission denied: '{0}'")]
    PermissionDenied(PathBuf),

    /// The Storage Directory is temporarily unreachable (e.g. the
    /// cloud-synced mount point is offline).
    #[error("Storage directory unavailable: {0}")]
    SdUnavailable(String),

    /// The profile's advisory filesystem lock is held by another process.
    #[error("Profile lock held: {0}")]
    LockHeld(String),

    /// On-disk schema version is newer than this build understands.
    #[error("Schema version {found} is newer than supported ({supported})")]
    SchemaTooNew {
        /// Version found on disk.
        found: u32,
        /// Highest version this build supports.
        supported: u32,
    },

    /// Caller-supplied value failed validation.
    #[error("Validation failed for field '{field}': {message}")]
    Validation {
        /// Name of the offending field.
        field: String,
        /// Description of the failure.
        message: String,
    },

    /// Bad magic bytes at the start of a framed file.
    #[error("Bad magic in '{path}': expected {expected:?}, found {found:?}")]
    BadMagic {
        /// Path of the offending file.
        path: PathBuf,
        /// Magic bytes expected.
        expected: [u8; 4],
        /// Magic bytes actually read.
        found: [u8; 4],
    },

    /// Framed file declares a version this build does not know how to read.
    #[error("Unsupported format version {version} in '{path}'")]
    UnsupportedVersion {
        /// Path of the offending file.
        path: PathBuf,
        /// Version byte read from the file.
        version: u8,
    },

    /// JSON (de)serialization failure, used for cache DB JSON columns.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// SQLite failure from the cache database.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// TOML failure loading configuration.
    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// TOML failure saving configuration.
    #[error("Config serialize error: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// A serializable representation of [`EngineError`] for crossing an IPC or
/// FFI boundary into the UI layer, without leaking `thiserror`/`rusqlite`
/// internals.
#[derive(Debug, Clone, Serialize)]
pub struct SerializableError {
    /// Error kind/variant name.
    pub kind: String,
    /// Human-readable error message.
    pub message: String,
    /// Associated path, if any.
    pub path: Option<PathBuf>,
}

impl From<&EngineError> for SerializableError {
    fn from(err: &EngineError) -> Self {
        let kind = match err {
            EngineError::Io(_) => "Io",
            EngineError::IoAt { .. } => "IoError",
            EngineError::NotFound(_) => "NotFound",
            EngineError::Conflict(_) => "Conflict",
            EngineError::Corrupt { .. } => "Corrupt",
            EngineError::PermissionDenied(_) => "PermissionDenied",
            EngineError::SdUnavailable(_) => "SdUnavailable",
            EngineError::LockHeld(_) => "LockHeld",
            EngineError::SchemaTooNew { .. } => "SchemaTooNew",
            EngineError::Validation { .. } => "Validation",
            EngineError::BadMagic { .. } => "Corrupt",
            EngineError::UnsupportedVersion { .. } => "Corrupt",
            EngineError::Json(_) => "Io",
            EngineError::Database(_) => "Io",
            EngineError::ConfigParse(_) => "Validation",
            EngineError::ConfigSerialize(_) => "Validation",
        }
        .to_string();

        let path = match err {
            EngineError::IoAt { path, .. } => Some(path.clone()),
            EngineError::Corrupt { path, .. } => Some(path.clone()),
            EngineError::PermissionDenied(path) => Some(path.clone()),
            EngineError::BadMagic { path, .. } => Some(path.clone()),
            EngineError::UnsupportedVersion { path, .. } => Some(path.clone()),
            _ => None,
        };

        Self {
            kind,
            message: err.to_string(),
            path,
        }
    }
}

impl From<EngineError> for SerializableError {
    fn from(err: EngineError) -> Self {
        SerializableError::from(&err)
    }
}

impl EngineError {
    /// Convert to a serializable representation for crossing an IPC boundary.
    pub fn to_serializable(&self) -> SerializableError {
        SerializableError::from(self)
    }

    /// True for errors a caller can legitimately retry after backoff (used
    /// by the activity sync poller and the cross-SD move's SD-access check).
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::SdUnavailable(_) | EngineError::Io(_))
    }
}
