//! Cross-process writer lock
//!
//! The server config and the ledger files have no locking of their own, so
//! every mutation takes an exclusive `flock` on a sidecar lock file first.

use crate::Result;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Advisory lock on a sidecar file
#[derive(Debug, Clone)]
pub struct StoreLock {
    path: PathBuf,
}

/// Held lock; released on drop
pub struct StoreLockGuard {
    _flock: Flock<File>,
}

impl StoreLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lock file handle, creating the file and its directory on first use
    fn open(&self) -> Result<File> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.path)?;
        Ok(file)
    }

    /// Block until the exclusive lock is held
    pub fn acquire(&self) -> Result<StoreLockGuard> {
        let flock = Flock::lock(self.open()?, FlockArg::LockExclusive)
            .map_err(|(_, errno)| std::io::Error::from(errno))?;
        debug!("Acquired writer lock {:?}", self.path);
        Ok(StoreLockGuard { _flock: flock })
    }

    /// Take the lock only if nobody else holds it
    pub fn try_acquire(&self) -> Result<Option<StoreLockGuard>> {
        match Flock::lock(self.open()?, FlockArg::LockExclusiveNonblock) {
            Ok(flock) => Ok(Some(StoreLockGuard { _flock: flock })),
            Err((_, errno)) if errno == nix::errno::Errno::EWOULDBLOCK => Ok(None),
            Err((_, errno)) => Err(std::io::Error::from(errno).into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_holder_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let lock = StoreLock::new(dir.path().join(".lock"));

        let guard = lock.acquire().unwrap();
        // flock is per open file description, so a second open conflicts
        assert!(lock.try_acquire().unwrap().is_none());
        drop(guard);
        assert!(lock.try_acquire().unwrap().is_some());
    }

    #[test]
    fn test_lock_creates_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("nested").join(".lock");
        let lock = StoreLock::new(&path);

        let guard = lock.try_acquire().unwrap();
        assert!(guard.is_some());
        assert!(path.is_file());
        drop(guard);

        // Reopening an existing lock file keeps it in place
        let _guard = lock.acquire().unwrap();
        assert!(path.is_file());
    }
}
