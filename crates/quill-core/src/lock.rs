//! Process-level lock on a correction store.
//!
//! One background loop per repository. The lock is an advisory `flock(2)`
//! on a file inside the git directory, taken through `fs2`; the OS drops it
//! when the holder exits, so a crashed worker never leaves a stale lock.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;

use crate::error::{QuillError, QuillResult};

/// Lock file name inside the git directory.
pub const LOCK_FILE: &str = "quill.lock";

/// Exclusive store lock, released on drop.
#[derive(Debug)]
pub struct StoreLock {
    path: PathBuf,
    _file: File,
}

impl StoreLock {
    /// Take the lock, polling until `timeout` elapses.
    pub fn acquire(git_dir: &Path, timeout: Duration) -> QuillResult<Self> {
        let (path, file) = open_lock_file(git_dir)?;
        let start = Instant::now();
        let poll = Duration::from_millis(10);
        loop {
            if file.try_lock_exclusive().is_ok() {
                tracing::debug!(path = %path.display(), "store lock acquired");
                return Ok(StoreLock { path, _file: file });
            }
            if start.elapsed() >= timeout {
                return Err(QuillError::LockTimeout);
            }
            std::thread::sleep(poll);
        }
    }

    /// Take the lock without waiting; `AlreadyRunning` when it is held.
    pub fn try_acquire(git_dir: &Path) -> QuillResult<Self> {
        let (path, file) = open_lock_file(git_dir)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(StoreLock { path, _file: file }),
            Err(_) => Err(QuillError::AlreadyRunning),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn open_lock_file(git_dir: &Path) -> QuillResult<(PathBuf, File)> {
    let path = git_dir.join(LOCK_FILE);
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(&path)?;
    Ok((path, file))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};

    #[test]
    fn test_lock_file_created_and_reusable_after_drop() {
        let dir = tempfile::tempdir().unwrap();
        {
            let lock = StoreLock::acquire(dir.path(), Duration::from_secs(1)).unwrap();
            assert!(lock.path().exists());
        }
        StoreLock::try_acquire(dir.path()).unwrap();
    }

    #[test]
    fn test_second_holder_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let _held = StoreLock::try_acquire(dir.path()).unwrap();

        assert!(matches!(
            StoreLock::try_acquire(dir.path()),
            Err(QuillError::AlreadyRunning)
        ));
        let start = Instant::now();
        assert!(matches!(
            StoreLock::acquire(dir.path(), Duration::from_millis(80)),
            Err(QuillError::LockTimeout)
        ));
        assert!(start.elapsed() >= Duration::from_millis(80));
    }

    #[test]
    fn test_waiter_gets_lock_once_released() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_path_buf();
        let barrier = Arc::new(Barrier::new(2));

        let b = barrier.clone();
        let p = path.clone();
        let holder = std::thread::spawn(move || {
            let _lock = StoreLock::acquire(&p, Duration::from_secs(5)).unwrap();
            b.wait();
            std::thread::sleep(Duration::from_millis(100));
        });

        barrier.wait();
        assert!(StoreLock::acquire(&path, Duration::from_secs(2)).is_ok());
        holder.join().unwrap();
    }
}
