//! Cross-process advisory locking around a single `.lock` file, guarding
//! read-modify-write access to the JSON document it sits next to.
//!
//! One `LockFile` is held for the duration of a single read-modify-write
//! cycle; it is released when the guard returned by [`LockFile::lock`]
//! drops. Concurrent processes (and concurrent tasks within this process,
//! via [`crate::document::Store`]'s own async mutex) block on `lock()`
//! rather than failing, mirroring the `filelock.FileLock` discipline the
//! original tooling relies on.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fd_lock::{RwLock, RwLockWriteGuard};

use crate::error::{Result, StoreError};

pub struct LockFile {
    path: PathBuf,
    inner: RwLock<File>,
}

impl LockFile {
    /// Open (creating if needed) the lock file at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .read(true)
            .open(&path)
            .map_err(|source| StoreError::Lock {
                path: path.clone(),
                source,
            })?;
        Ok(Self {
            path,
            inner: RwLock::new(file),
        })
    }

    /// Block until the exclusive lock is acquired, returning a guard that
    /// releases it on drop.
    pub fn lock(&mut self) -> Result<RwLockWriteGuard<'_, File>> {
        self.inner.write().map_err(|source| StoreError::Lock {
            path: self.path.clone(),
            source,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_then_unlock_allows_relock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.lock");
        let mut lock = LockFile::open(&path).unwrap();
        {
            let _guard = lock.lock().unwrap();
        }
        // The guard dropped; a second acquisition must not deadlock.
        let _guard2 = lock.lock().unwrap();
    }

    #[test]
    fn open_creates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("store.lock");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        assert!(!path.exists());
        let _lock = LockFile::open(&path).unwrap();
        assert!(path.exists());
    }
}
