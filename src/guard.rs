use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use fs2::FileExt;

use crate::error::HybridLogError;

const ACQUIRE_BACKOFF: Duration = Duration::from_millis(10);

/// Advisory exclusive ownership of a log path, held through a sidecar
/// `<stem>.lock` file so that compaction can rename the data file without
/// disturbing the lock.
///
/// The lock is per open file description, so a second open of the same path
/// conflicts even within one process.
#[derive(Debug)]
pub(crate) struct FileGuard {
    file: File,
    lock_path: PathBuf,
}

impl FileGuard {
    /// Acquires the lock, polling until `timeout` elapses. Fails with
    /// [`HybridLogError::Busy`] when another owner holds the path.
    pub(crate) fn acquire(path: &Path, timeout: Duration) -> Result<Self, HybridLogError> {
        let lock_path = path.with_extension("lock");
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|source| HybridLogError::Open {
                path: lock_path.clone(),
                source,
            })?;

        let deadline = Instant::now() + timeout;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    return Ok(Self { file, lock_path });
                }
                Err(_) if Instant::now() < deadline => {
                    thread::sleep(ACQUIRE_BACKOFF.min(timeout));
                }
                Err(_) => {
                    return Err(HybridLogError::Busy {
                        path: path.to_path_buf(),
                        timeout,
                    });
                }
            }
        }
    }

    /// Releases the lock and removes the sidecar file. Used on clean close;
    /// `Drop` only unlocks, so a crashed process leaves the sidecar behind
    /// without blocking the next owner.
    pub(crate) fn release(self) {
        let _ = self.file.unlock();
        let _ = fs::remove_file(&self.lock_path);
    }
}

impl Drop for FileGuard {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn acquires_and_releases() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.log");
        let guard = FileGuard::acquire(&path, Duration::from_millis(50)).unwrap();
        let lock_path = path.with_extension("lock");
        assert!(lock_path.exists());
        guard.release();
        assert!(!lock_path.exists());
    }

    #[test]
    fn second_acquisition_times_out() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.log");
        let _guard = FileGuard::acquire(&path, Duration::from_millis(50)).unwrap();
        let err = FileGuard::acquire(&path, Duration::from_millis(50)).unwrap_err();
        assert!(matches!(err, HybridLogError::Busy { .. }));
    }

    #[test]
    fn lock_is_free_again_after_release() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.log");
        let guard = FileGuard::acquire(&path, Duration::from_millis(50)).unwrap();
        guard.release();
        let again = FileGuard::acquire(&path, Duration::from_millis(50));
        assert!(again.is_ok());
    }
}
