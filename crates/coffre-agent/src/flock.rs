//! Advisory file locks guarding daemon singleton acquisition.
//!
//! `flock(LOCK_EX)` over a dedicated lock file. Acquisition retries with a
//! short delay because the lock window during agent startup is measured in
//! milliseconds. Unix-only, like the rest of the socket plumbing.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{AgentError, AgentResult};

const DEFAULT_ATTEMPTS: u32 = 1000;
const RETRY_DELAY: Duration = Duration::from_millis(5);

/// An exclusively held lock file; released (and removed) on drop.
pub struct FileLock {
    path: PathBuf,
    file: Option<File>,
}

fn flock_exclusive(file: &File) -> std::io::Result<()> {
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

impl FileLock {
    /// Acquires `path` exclusively, retrying up to the default bound.
    pub fn acquire(path: &Path) -> AgentResult<FileLock> {
        Self::acquire_with_attempts(path, DEFAULT_ATTEMPTS)
    }

    /// Acquires `path` exclusively with an explicit retry bound.
    pub fn acquire_with_attempts(path: &Path, attempts: u32) -> AgentResult<FileLock> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o600)
            .open(path)?;

        let mut last = None;
        for _ in 0..attempts.max(1) {
            match flock_exclusive(&file) {
                Ok(()) => {
                    return Ok(FileLock {
                        path: path.to_path_buf(),
                        file: Some(file),
                    })
                }
                Err(e) => {
                    last = Some(e);
                    std::thread::sleep(RETRY_DELAY);
                }
            }
        }
        Err(AgentError::Io(last.unwrap_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::WouldBlock, "lock busy")
        })))
    }

    /// Releases the lock and removes the lock file.
    pub fn unlock(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.file.take().is_some() {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.lock");
        let lock = FileLock::acquire(&path).unwrap();
        assert!(path.exists());
        lock.unlock();
        assert!(!path.exists());
    }

    #[test]
    fn test_second_holder_blocks_until_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.lock");
        let lock = FileLock::acquire(&path).unwrap();

        // a single immediate attempt must fail while held
        assert!(FileLock::acquire_with_attempts(&path, 1).is_err());

        lock.unlock();
        assert!(FileLock::acquire_with_attempts(&path, 1).is_ok());
    }

    #[test]
    fn test_drop_releases() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.lock");
        {
            let _lock = FileLock::acquire(&path).unwrap();
        }
        assert!(FileLock::acquire_with_attempts(&path, 1).is_ok());
    }
}
