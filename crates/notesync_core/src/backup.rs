//! Backup and restore of a storage directory's on-disk tree (spec.md §6.2).
//!
//! A backup is a point-in-time copy of everything that makes an SD
//! self-contained: `notes/`, `folders/`, `activity/`, and `deleted/`. The
//! cache database is never part of a backup — it's a derived index,
//! rebuilt from disk on restore the same way a cold load rebuilds it (C12).

use std::path::{Path, PathBuf};

use crate::error::{EngineError, Result};
use crate::fs::FileSystem;
use crate::id::EntityId;

/// Identifies one backup: the SD it was taken from and when.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupId {
    pub sd_id: EntityId,
    pub created_at_millis: u64,
}

impl BackupId {
    fn dir_name(&self) -> String {
        format!("{}_{}", self.sd_id, self.created_at_millis)
    }

    fn parse(name: &str) -> Option<Self> {
        let (sd_part, ts_part) = name.split_once('_')?;
        Some(Self {
            sd_id: sd_part.parse().ok()?,
            created_at_millis: ts_part.parse().ok()?,
        })
    }
}

/// Where a restored SD's files should land.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreMode {
    /// Overwrite the SD's original root (the caller is responsible for
    /// ensuring nothing else is using it concurrently).
    Original,
    /// Restore into a fresh root, leaving the original untouched.
    New,
}

/// Outcome of a backup or restore pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupResult {
    pub backup_id: BackupId,
    pub files_copied: u64,
}

/// One entry in [`BackupManager::list_backups`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupEntry {
    pub id: BackupId,
}

const TREE_DIRS: [&str; 2] = ["activity", "deleted"];

/// Copies an SD's on-disk tree to and from a backup root.
pub struct BackupManager<'a, F: FileSystem> {
    fs: &'a F,
    backup_root: PathBuf,
}

impl<'a, F: FileSystem> BackupManager<'a, F> {
    pub fn new(fs: &'a F, backup_root: PathBuf) -> Self {
        Self { fs, backup_root }
    }

    /// Copy `sd_root`'s full tree into a new timestamped backup directory.
    pub fn create_backup(&self, sd_id: EntityId, sd_root: &Path, now_millis: u64) -> Result<BackupResult> {
        let id = BackupId { sd_id, created_at_millis: now_millis };
        let dest_root = self.backup_root.join(id.dir_name());
        self.fs.create_dir_all(&dest_root)?;

        let mut files_copied = 0u64;
        for leaf in TREE_DIRS {
            files_copied += copy_dir_recursive(self.fs, &sd_root.join(leaf), &dest_root.join(leaf))?;
        }
        files_copied += copy_dir_recursive(self.fs, &sd_root.join("folders"), &dest_root.join("folders"))?;

        let notes_src = sd_root.join("notes");
        if self.fs.exists(&notes_src) {
            for note_dir in self.fs.list_dir(&notes_src)? {
                if !self.fs.is_dir(&note_dir) {
                    continue;
                }
                let Some(name) = note_dir.file_name() else { continue };
                files_copied += copy_dir_recursive(self.fs, &note_dir, &dest_root.join("notes").join(name))?;
            }
        }

        Ok(BackupResult { backup_id: id, files_copied })
    }

    /// Copy a previously created backup's tree back onto disk: either over
    /// its original SD root, or into a fresh one, per `mode`.
    pub fn restore_backup(&self, backup_id: &BackupId, mode: RestoreMode, target_root: &Path) -> Result<BackupResult> {
        let _ = mode; // the destination root fully determines behavior; callers pick it per `mode`
        let src_root = self.backup_root.join(backup_id.dir_name());
        if !self.fs.exists(&src_root) {
            return Err(EngineError::NotFound(format!("backup {}", backup_id.dir_name())));
        }

        let mut files_copied = 0u64;
        for leaf in TREE_DIRS {
            files_copied += copy_dir_recursive(self.fs, &src_root.join(leaf), &target_root.join(leaf))?;
        }
        files_copied += copy_dir_recursive(self.fs, &src_root.join("folders"), &target_root.join("folders"))?;

        let notes_src = src_root.join("notes");
        if self.fs.exists(&notes_src) {
            for note_dir in self.fs.list_dir(&notes_src)? {
                if !self.fs.is_dir(&note_dir) {
                    continue;
                }
                let Some(name) = note_dir.file_name() else { continue };
                files_copied += copy_dir_recursive(self.fs, &note_dir, &target_root.join("notes").join(name))?;
            }
        }

        Ok(BackupResult { backup_id: backup_id.clone(), files_copied })
    }

    /// List every backup under the backup root, newest first.
    pub fn list_backups(&self) -> Result<Vec<BackupEntry>> {
        if !self.fs.exists(&self.backup_root) {
            return Ok(Vec::new());
        }
        let mut entries: Vec<BackupEntry> = self
            .fs
            .list_dir(&self.backup_root)?
            .iter()
            .filter_map(|p| p.file_name()?.to_str().and_then(BackupId::parse))
            .map(|id| BackupEntry { id })
            .collect();
        entries.sort_by(|a, b| b.id.created_at_millis.cmp(&a.id.created_at_millis));
        Ok(entries)
    }
}

/// Recursively copy every file under `src` into the matching path under
/// `dst`, creating directories as needed. Returns the number of files
/// copied. A missing `src` copies nothing (an SD that has no `deleted/`
/// directory yet, say, is not an error).
fn copy_dir_recursive(fs: &dyn FileSystem, src: &Path, dst: &Path) -> Result<u64> {
    if !fs.exists(src) {
        return Ok(0);
    }
    fs.create_dir_all(dst)?;
    let mut copied = 0u64;
    for path in fs.list_dir(src)? {
        let Some(name) = path.file_name() else { continue };
        let dest_path = dst.join(name);
        if fs.is_dir(&path) {
            copied += copy_dir_recursive(fs, &path, &dest_path)?;
        } else {
            fs.copy_file(&path, &dest_path)?;
            copied += 1;
        }
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::InMemoryFileSystem;
    use crate::log::LogWriter;

    fn seed_sd(fs: &InMemoryFileSystem, root: &Path, note_id: EntityId, profile: EntityId, instance: EntityId) {
        let notes_logs = root.join("notes").join(note_id.to_compact()).join("logs");
        let writer = LogWriter::open(fs, &notes_logs, profile, instance).unwrap();
        writer.append(1, 1, b"hello".to_vec()).unwrap();
        writer.finalize().unwrap();

        let activity = root.join("activity");
        fs.write_file(&activity.join(format!("{profile}_{instance}.log")), b"entry\n").unwrap();
    }

    #[test]
    fn create_backup_then_restore_into_new_root_round_trips() {
        let fs = InMemoryFileSystem::new();
        let sd_root = Path::new("/sd");
        let sd_id = EntityId::new_random();
        let profile = EntityId::new_random();
        let instance = EntityId::new_random();
        let note_id = EntityId::new_random();
        seed_sd(&fs, sd_root, note_id, profile, instance);

        let manager = BackupManager::new(&fs, PathBuf::from("/backups"));
        let result = manager.create_backup(sd_id, sd_root, 1_000).unwrap();
        assert!(result.files_copied >= 2);

        let backups = manager.list_backups().unwrap();
        assert_eq!(backups.len(), 1);
        assert_eq!(backups[0].id, result.backup_id);

        let restored_root = Path::new("/restored");
        let restore_result = manager.restore_backup(&result.backup_id, RestoreMode::New, restored_root).unwrap();
        assert_eq!(restore_result.files_copied, result.files_copied);

        let restored_log_dir = restored_root.join("notes").join(note_id.to_compact()).join("logs");
        assert_eq!(fs.list_dir(&restored_log_dir).unwrap().len(), 1);
    }

    #[test]
    fn restore_of_unknown_backup_errors() {
        let fs = InMemoryFileSystem::new();
        let manager = BackupManager::new(&fs, PathBuf::from("/backups"));
        let bogus = BackupId { sd_id: EntityId::new_random(), created_at_millis: 1 };
        let err = manager.restore_backup(&bogus, RestoreMode::New, Path::new("/x")).unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[test]
    fn list_backups_orders_newest_first() {
        let fs = InMemoryFileSystem::new();
        let sd_root = Path::new("/sd");
        let sd_id = EntityId::new_random();
        fs.write_file(&sd_root.join("activity").join("a.log"), b"x").unwrap();

        let manager = BackupManager::new(&fs, PathBuf::from("/backups"));
        manager.create_backup(sd_id, sd_root, 1_000).unwrap();
        manager.create_backup(sd_id, sd_root, 2_000).unwrap();

        let backups = manager.list_backups().unwrap();
        assert_eq!(backups.len(), 2);
        assert_eq!(backups[0].id.created_at_millis, 2_000);
        assert_eq!(backups[1].id.created_at_millis, 1_000);
    }
}
