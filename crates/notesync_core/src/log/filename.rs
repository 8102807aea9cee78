//! Log filename parsing: `{profileId}_{instanceId}_{creationMillis}.crdtlog`.

use std::path::{Path, PathBuf};

use crate::id::EntityId;

/// A parsed `.crdtlog` filename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFileName {
    /// Profile that owns the writing instance.
    pub profile_id: EntityId,
    /// Instance that wrote (and exclusively owns) this file.
    pub instance_id: EntityId,
    /// Millisecond timestamp the file was created at, used to order
    /// multiple files from the same instance and to pick a fresh, strictly
    /// increasing name on rotation.
    pub creation_millis: u64,
}

impl LogFileName {
    /// Build the filename (without directory) for these parameters.
    pub fn format(&self) -> String {
        format!(
            "{}_{}_{}.crdtlog",
            self.profile_id, self.instance_id, self.creation_millis
        )
    }

    /// Parse a bare filename (no directory components).
    pub fn parse(name: &str) -> Option<Self> {
        let stem = name.strip_suffix(".crdtlog")?;
        let mut parts = stem.splitn(3, '_');
        let profile_id = parts.next()?.parse().ok()?;
        let instance_id = parts.next()?.parse().ok()?;
        let creation_millis: u64 = parts.next()?.parse().ok()?;
        Some(Self {
            profile_id,
            instance_id,
            creation_millis,
        })
    }

    /// Parse the filename component of a full path.
    pub fn parse_path(path: &Path) -> Option<Self> {
        Self::parse(path.file_name()?.to_str()?)
    }

    /// Join this filename onto a containing `logs/` directory.
    pub fn path_in(&self, logs_dir: &Path) -> PathBuf {
        logs_dir.join(self.format())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_then_parse_round_trips() {
        let name = LogFileName {
            profile_id: EntityId::new_random(),
            instance_id: EntityId::new_random(),
            creation_millis: 1_700_000_000_123,
        };
        let formatted = name.format();
        let parsed = LogFileName::parse(&formatted).unwrap();
        assert_eq!(parsed, name);
    }

    #[test]
    fn rejects_wrong_extension() {
        assert!(LogFileName::parse("a_b_1.snapshot").is_none());
    }

    #[test]
    fn rejects_malformed_stem() {
        assert!(LogFileName::parse("not-enough-parts.crdtlog").is_none());
    }
}
