//! Advisory file locking for cross-process state
//!
//! Used by the file-backed counter. Acquisition polls a non-blocking
//! exclusive lock until a bounded timeout, logs once on contention and
//! releases on drop.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, warn};

/// Lock result type
pub type LockResult<T> = Result<T, LockError>;

/// Poll interval while the lock is held elsewhere
const POLL_INTERVAL: Duration = Duration::from_millis(2);

/// Waiting longer than this logs a contention warning
const CONTENTION_WARN_AFTER: Duration = Duration::from_millis(500);

/// Errors from lock operations
#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock timeout after {timeout:?} on {path}")]
    Timeout { path: PathBuf, timeout: Duration },

    #[error("lock I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Exclusive advisory lock on a file, released when dropped.
pub struct FileLock {
    lock_path: PathBuf,
    #[allow(dead_code)]
    lock_file: File,
}

impl FileLock {
    /// Acquire an exclusive lock on `lock_path`, waiting up to `timeout`.
    ///
    /// Creates the parent directory and the lock file if needed.
    pub fn acquire(lock_path: &Path, timeout: Duration) -> LockResult<Self> {
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let start = Instant::now();
        let mut warned = false;

        loop {
            match Self::try_acquire_exclusive(lock_path) {
                Ok(file) => {
                    if warned {
                        debug!(
                            path = %lock_path.display(),
                            waited_ms = start.elapsed().as_millis() as u64,
                            "lock acquired after contention"
                        );
                    }
                    return Ok(Self {
                        lock_path: lock_path.to_path_buf(),
                        lock_file: file,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if !warned && start.elapsed() > CONTENTION_WARN_AFTER {
                        warn!(path = %lock_path.display(), "lock contention, waiting");
                        warned = true;
                    }
                }
                Err(e) => return Err(LockError::Io(e)),
            }

            if start.elapsed() >= timeout {
                return Err(LockError::Timeout {
                    path: lock_path.to_path_buf(),
                    timeout,
                });
            }

            std::thread::sleep(POLL_INTERVAL);
        }
    }

    #[cfg(unix)]
    fn try_acquire_exclusive(lock_path: &Path) -> io::Result<File> {
        use std::os::unix::fs::OpenOptionsExt;
        use std::os::unix::io::AsRawFd;

        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .mode(0o644)
            .open(lock_path)?;

        let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };

        if result == 0 {
            Ok(file)
        } else {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
                Err(io::Error::new(io::ErrorKind::WouldBlock, "lock held"))
            } else {
                Err(err)
            }
        }
    }

    /// Non-unix fallback: exclusive creation stands in for flock, so the
    /// file must be removed on release.
    #[cfg(not(unix))]
    fn try_acquire_exclusive(lock_path: &Path) -> io::Result<File> {
        match OpenOptions::new().write(true).create_new(true).open(lock_path) {
            Ok(file) => Ok(file),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                Err(io::Error::new(io::ErrorKind::WouldBlock, "lock held"))
            }
            Err(e) => Err(e),
        }
    }

    pub fn path(&self) -> &Path {
        &self.lock_path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            unsafe {
                libc::flock(self.lock_file.as_raw_fd(), libc::LOCK_UN);
            }
        }
        #[cfg(not(unix))]
        {
            let _ = fs::remove_file(&self.lock_path);
        }
    }
}
