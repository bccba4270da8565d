//! Concurrent counters
//!
//! Workers merge their per-item numbers through a [`Counter`]. Two backends:
//!
//! - [`MemoryCounter`]: a mutex-guarded map, for workers inside one process.
//! - [`FileCounter`]: a JSON value file guarded by an advisory lock file, for
//!   independent processes that must share one run's totals.
//!
//! Either way, a batch of deltas is applied in a single critical section and
//! `K` workers adding `1` `M` times each always read back `K * M`.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use crate::executor::PolicyOutcome;
use crate::lock::{FileLock, LockError};

/// Counter result type
pub type CounterResult<T> = Result<T, CounterError>;

/// Errors from counter operations
#[derive(Debug, Error)]
pub enum CounterError {
    #[error("counter lock failed: {0}")]
    Lock(#[from] LockError),

    #[error("counter I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("counter file {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("counter has been removed")]
    Closed,
}

/// Named integer counters with atomic read-modify-write.
pub trait Counter: Send + Sync {
    /// Apply every delta in one critical section and return the values after.
    fn apply(&self, deltas: &[(&str, i64)]) -> CounterResult<BTreeMap<String, i64>>;

    /// Current values of every counter.
    fn snapshot(&self) -> CounterResult<BTreeMap<String, i64>>;

    /// Add `delta` to `name` and return the new value.
    fn increment(&self, name: &str, delta: i64) -> CounterResult<i64> {
        let values = self.apply(&[(name, delta)])?;
        Ok(values.get(name).copied().unwrap_or(0))
    }

    /// Current value of `name`; unknown counters read as zero.
    fn read(&self, name: &str) -> CounterResult<i64> {
        Ok(self.snapshot()?.get(name).copied().unwrap_or(0))
    }
}

/// In-process counter backend
#[derive(Debug, Default)]
pub struct MemoryCounter {
    values: Mutex<BTreeMap<String, i64>>,
}

impl MemoryCounter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Counter for MemoryCounter {
    fn apply(&self, deltas: &[(&str, i64)]) -> CounterResult<BTreeMap<String, i64>> {
        // A poisoned map is still consistent: every update is a single insert
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        for (name, delta) in deltas {
            *values.entry((*name).to_string()).or_insert(0) += delta;
        }
        Ok(values.clone())
    }

    fn snapshot(&self) -> CounterResult<BTreeMap<String, i64>> {
        Ok(self.values.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }
}

/// Cross-process counter backend
///
/// The lock file is held only across read-modify-write of the value file,
/// never across caller work. Clones share an in-process guard so `remove`
/// cannot race a sibling thread into recreating the files.
#[derive(Debug, Clone)]
pub struct FileCounter {
    lock_path: PathBuf,
    value_path: PathBuf,
    timeout: Duration,
    removed: Arc<Mutex<bool>>,
}

impl FileCounter {
    /// Counter files for one invocation: `<state_dir>/locks/<domain>-<run_id>-<pid>.{lock,counter}`.
    ///
    /// The pid keeps concurrent invocations apart even if they share a run id.
    pub fn for_run(state_dir: &Path, domain: &str, run_id: &str, timeout: Duration) -> Self {
        let stem = format!("{}-{}-{}", domain, run_id, std::process::id());
        let dir = state_dir.join("locks");
        Self::at(
            dir.join(format!("{stem}.lock")),
            dir.join(format!("{stem}.counter")),
            timeout,
        )
    }

    /// Counter at explicit paths, for processes that agree on them.
    pub fn at(lock_path: PathBuf, value_path: PathBuf, timeout: Duration) -> Self {
        Self {
            lock_path,
            value_path,
            timeout,
            removed: Arc::new(Mutex::new(false)),
        }
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    pub fn value_path(&self) -> &Path {
        &self.value_path
    }

    /// Delete the lock and value files and refuse further updates through
    /// this handle and its clones. Missing files are not an error.
    pub fn remove(&self) -> io::Result<()> {
        let mut removed = self.removed.lock().unwrap_or_else(PoisonError::into_inner);
        *removed = true;
        for path in [&self.value_path, &self.lock_path, &self.temp_path()] {
            match fs::remove_file(path) {
                Ok(()) => debug!(path = %path.display(), "removed counter file"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.value_path.as_os_str().to_os_string();
        name.push(".tmp");
        PathBuf::from(name)
    }

    fn load(&self) -> CounterResult<BTreeMap<String, i64>> {
        let bytes = match fs::read(&self.value_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(source) => {
                return Err(CounterError::Io {
                    path: self.value_path.clone(),
                    source,
                })
            }
        };
        if bytes.is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_slice(&bytes).map_err(|e| CounterError::Corrupt {
            path: self.value_path.clone(),
            reason: e.to_string(),
        })
    }

    /// Write-then-rename; the caller holds the lock so one temp name suffices.
    fn store(&self, values: &BTreeMap<String, i64>) -> CounterResult<()> {
        let temp = self.temp_path();
        let io_err = |source| CounterError::Io {
            path: temp.clone(),
            source,
        };
        let bytes = serde_json::to_vec(values).map_err(|e| CounterError::Corrupt {
            path: self.value_path.clone(),
            reason: e.to_string(),
        })?;

        let mut file = fs::File::create(&temp).map_err(io_err)?;
        file.write_all(&bytes).map_err(io_err)?;
        drop(file);

        fs::rename(&temp, &self.value_path).map_err(|source| CounterError::Io {
            path: self.value_path.clone(),
            source,
        })
    }
}

impl Counter for FileCounter {
    fn apply(&self, deltas: &[(&str, i64)]) -> CounterResult<BTreeMap<String, i64>> {
        let removed = self.removed.lock().unwrap_or_else(PoisonError::into_inner);
        if *removed {
            return Err(CounterError::Closed);
        }
        let _lock = FileLock::acquire(&self.lock_path, self.timeout)?;
        let mut values = self.load()?;
        for (name, delta) in deltas {
            *values.entry((*name).to_string()).or_insert(0) += delta;
        }
        self.store(&values)?;
        Ok(values)
    }

    fn snapshot(&self) -> CounterResult<BTreeMap<String, i64>> {
        let removed = self.removed.lock().unwrap_or_else(PoisonError::into_inner);
        if *removed {
            return Err(CounterError::Closed);
        }
        let _lock = FileLock::acquire(&self.lock_path, self.timeout)?;
        self.load()
    }
}

/// Totals of the three standard counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct CounterTotals {
    pub errors: u64,
    pub warnings: u64,
    pub failures: u64,
}

/// Per-invocation error, warning and failure totals.
///
/// An explicit object handed to the executor, so two invocations in one
/// process never share totals.
#[derive(Clone)]
pub struct SharedCounters {
    backend: Arc<dyn Counter>,
}

impl SharedCounters {
    pub const ERRORS: &'static str = "errors";
    pub const WARNINGS: &'static str = "warnings";
    pub const FAILURES: &'static str = "failures";

    pub fn new(backend: Arc<dyn Counter>) -> Self {
        Self { backend }
    }

    /// Counters backed by process memory
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryCounter::new()))
    }

    pub fn backend(&self) -> &Arc<dyn Counter> {
        &self.backend
    }

    /// Merge one item's outcome in a single critical section.
    pub fn record(&self, outcome: &PolicyOutcome) -> CounterResult<()> {
        let failed = i64::from(!outcome.is_success());
        self.backend.apply(&[
            (Self::ERRORS, saturating_i64(outcome.error_count)),
            (Self::WARNINGS, saturating_i64(outcome.warning_count)),
            (Self::FAILURES, failed),
        ])?;
        Ok(())
    }

    pub fn totals(&self) -> CounterResult<CounterTotals> {
        let values = self.backend.snapshot()?;
        let get = |name: &str| values.get(name).copied().unwrap_or(0).max(0) as u64;
        Ok(CounterTotals {
            errors: get(Self::ERRORS),
            warnings: get(Self::WARNINGS),
            failures: get(Self::FAILURES),
        })
    }
}

fn saturating_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
