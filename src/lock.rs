//! The process-wide exclusive lock that gives a directory at most one live
//! [`crate::Engine`] at a time (I4).

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use fs4::FileExt;

use crate::error::{Error, Result};

const LOCK_FILE_NAME: &str = "lock";

/// A held advisory lock on `<dir>/lock`. Dropping it releases the lock, which
/// also happens automatically if the process exits or panics, since the OS
/// releases advisory locks when the holding file descriptor is closed.
#[derive(Debug)]
pub struct DirLock {
    file: File,
    path: PathBuf,
}

impl DirLock {
    /// Acquires the lock for `dir`, creating the sentinel file if needed.
    /// Returns `Error::DatabaseLocked` if another live instance already
    /// holds it.
    pub fn acquire(dir: &Path) -> Result<Self> {
        let path = dir.join(LOCK_FILE_NAME);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;

        match file.try_lock_exclusive() {
            Ok(()) => Ok(Self { file, path }),
            Err(e) if is_contended(&e) => Err(Error::DatabaseLocked),
            Err(e) => Err(Error::Io(e)),
        }
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to release lock file");
        }
    }
}

fn is_contended(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_on_same_directory_is_locked() {
        let dir = tempfile::tempdir().unwrap();
        let first = DirLock::acquire(dir.path()).unwrap();
        let second = DirLock::acquire(dir.path());
        assert!(matches!(second, Err(Error::DatabaseLocked)));
        drop(first);
        assert!(DirLock::acquire(dir.path()).is_ok());
    }
}
