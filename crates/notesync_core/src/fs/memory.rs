//! In-memory filesystem for fast, deterministic unit tests.

use std::collections::{HashMap, HashSet};
use std::io::{Error, ErrorKind, Result};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::FileSystem;

/// An in-memory filesystem, keyed by absolute `PathBuf`. Directories are
/// tracked separately so `is_dir`/`list_dir` behave sensibly without a real
/// inode tree.
#[derive(Default)]
pub struct InMemoryFileSystem {
    files: Mutex<HashMap<PathBuf, Vec<u8>>>,
    dirs: Mutex<HashSet<PathBuf>>,
}

impl InMemoryFileSystem {
    /// Create an empty in-memory filesystem.
    pub fn new() -> Self {
        Self::default()
    }

    fn mark_parents(&self, path: &Path) {
        let mut dirs = self.dirs.lock().unwrap();
        let mut cur = path.parent();
        while let Some(p) = cur {
            if !dirs.insert(p.to_path_buf()) {
                break;
            }
            cur = p.parent();
        }
    }
}

impl FileSystem for InMemoryFileSystem {
    fn read(&self, path: &Path) -> Result<Vec<u8>> {
        self.files
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| Error::new(ErrorKind::NotFound, format!("{path:?} not found")))
    }

    fn write_atomic(&self, path: &Path, content: &[u8]) -> Result<()> {
        self.mark_parents(path);
        self.files
            .lock()
            .unwrap()
            .insert(path.to_path_buf(), content.to_vec());
        Ok(())
    }

    fn append_fsync(&self, path: &Path, content: &[u8]) -> Result<()> {
        self.mark_parents(path);
        let mut files = self.files.lock().unwrap();
        files.entry(path.to_path_buf()).or_default().extend_from_slice(content);
        Ok(())
    }

    fn truncate(&self, path: &Path, len: u64) -> Result<()> {
        let mut files = self.files.lock().unwrap();
        let data = files
            .get_mut(path)
            .ok_or_else(|| Error::new(ErrorKind::NotFound, format!("{path:?} not found")))?;
        data.truncate(len as usize);
        Ok(())
    }

    fn write_file(&self, path: &Path, content: &[u8]) -> Result<()> {
        self.write_atomic(path, content)
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        self.files.lock().unwrap().remove(path);
        Ok(())
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        let mut dirs = self.dirs.lock().unwrap();
        let mut cur = Some(path);
        while let Some(p) = cur {
            dirs.insert(p.to_path_buf());
            cur = p.parent();
        }
        Ok(())
    }

    fn list_dir(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let files = self.files.lock().unwrap();
        let dirs = self.dirs.lock().unwrap();
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for path in files.keys().chain(dirs.iter()) {
            if let Some(parent) = path.parent()
                && parent == dir
                && seen.insert(path.clone())
            {
                out.push(path.clone());
            }
        }
        out.sort();
        Ok(out)
    }

    fn file_len(&self, path: &Path) -> Option<u64> {
        self.files.lock().unwrap().get(path).map(|v| v.len() as u64)
    }

    fn exists(&self, path: &Path) -> bool {
        self.files.lock().unwrap().contains_key(path) || self.dirs.lock().unwrap().contains(path)
    }

    fn is_dir(&self, path: &Path) -> bool {
        self.dirs.lock().unwrap().contains(path)
    }

    fn fsync_dir(&self, _dir: &Path) -> Result<()> {
        Ok(())
    }

    fn write_at(&self, path: &Path, offset: u64, data: &[u8]) -> Result<()> {
        let mut files = self.files.lock().unwrap();
        let buf = files
            .get_mut(path)
            .ok_or_else(|| Error::new(ErrorKind::NotFound, format!("{path:?} not found")))?;
        let offset = offset as usize;
        let end = offset + data.len();
        if buf.len() < end {
            buf.resize(end, 0);
        }
        buf[offset..end].copy_from_slice(data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read() {
        let fs = InMemoryFileSystem::new();
        fs.write_atomic(Path::new("/a/b.txt"), b"hello").unwrap();
        assert_eq!(fs.read(Path::new("/a/b.txt")).unwrap(), b"hello");
        assert!(fs.is_dir(Path::new("/a")));
    }

    #[test]
    fn append_accumulates() {
        let fs = InMemoryFileSystem::new();
        fs.append_fsync(Path::new("/x.log"), b"one;").unwrap();
        fs.append_fsync(Path::new("/x.log"), b"two;").unwrap();
        assert_eq!(fs.read(Path::new("/x.log")).unwrap(), b"one;two;");
    }

    #[test]
    fn truncate_drops_tail() {
        let fs = InMemoryFileSystem::new();
        fs.write_atomic(Path::new("/x"), b"0123456789").unwrap();
        fs.truncate(Path::new("/x"), 4).unwrap();
        assert_eq!(fs.read(Path::new("/x")).unwrap(), b"0123");
    }

    #[test]
    fn list_dir_returns_immediate_children() {
        let fs = InMemoryFileSystem::new();
        fs.write_atomic(Path::new("/d/a"), b"1").unwrap();
        fs.write_atomic(Path::new("/d/b"), b"2").unwrap();
        fs.create_dir_all(Path::new("/d/sub")).unwrap();
        let mut entries = fs.list_dir(Path::new("/d")).unwrap();
        entries.sort();
        assert_eq!(
            entries,
            vec![
                PathBuf::from("/d/a"),
                PathBuf::from("/d/b"),
                PathBuf::from("/d/sub"),
            ]
        );
    }
}
