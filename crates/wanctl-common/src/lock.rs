//! Per-instance advisory file lock.
//!
//! Each daemon takes an exclusive non-blocking `flock` on its lock
//! file at startup; a second instance fails fast instead of fighting
//! over the state file. The lock is released when the process exits
//! (the fd closes), so a crashed daemon never wedges a restart.

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("cannot open lock file {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("another instance holds the lock at {path}")]
    Held { path: PathBuf },
}

/// Exclusive advisory lock, held for the lifetime of the value.
#[derive(Debug)]
pub struct FileLock {
    // Kept only to hold the fd (and the flock) open.
    _file: File,
    path: PathBuf,
}

impl FileLock {
    /// Acquire the lock without blocking. `Err(Held)` means another
    /// daemon instance is already running.
    pub fn acquire(path: &Path) -> Result<FileLock, LockError> {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(|source| LockError::Open {
                path: path.to_path_buf(),
                source,
            })?;

        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            return Err(LockError::Held {
                path: path.to_path_buf(),
            });
        }

        Ok(FileLock {
            _file: file,
            path: path.to_path_buf(),
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
    fn acquire_succeeds_on_fresh_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wan.lock");
        let lock = FileLock::acquire(&path).unwrap();
        assert_eq!(lock.path(), path);
    }

    #[test]
    fn second_acquire_fails_while_held() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wan.lock");
        let _held = FileLock::acquire(&path).unwrap();
        match FileLock::acquire(&path) {
            Err(LockError::Held { .. }) => {}
            other => panic!("expected Held, got {other:?}"),
        }
    }

    #[test]
    fn lock_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wan.lock");
        drop(FileLock::acquire(&path).unwrap());
        FileLock::acquire(&path).expect("lock should be reacquirable after drop");
    }
}
