//! Framework error taxonomy
//!
//! Every component error folds into one of four kinds:
//! - `InvalidArgument`: a bad call into the framework, fatal to that call only
//! - `ResourceUnavailable`: cache directory or lock file unusable, surfaced not retried
//! - `Transient`: an item's underlying remote call failed, recorded per item
//! - `Interrupted`: a termination signal arrived, cleanup drains, exit is non-zero

use thiserror::Error;

use crate::cache::CacheError;
use crate::counter::CounterError;
use crate::lock::LockError;

/// Result alias for framework-level operations
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Coarse classification used by callers to pick exit codes and retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
    ResourceUnavailable,
    Transient,
    Interrupted,
}

impl ErrorKind {
    /// Stable lowercase name, used in summaries
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::ResourceUnavailable => "resource_unavailable",
            ErrorKind::Transient => "transient",
            ErrorKind::Interrupted => "interrupted",
        }
    }
}

/// Framework-level error
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("resource unavailable: {0}")]
    ResourceUnavailable(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("interrupted after {completed} completed item(s)")]
    Interrupted { completed: usize },
}

impl RuntimeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RuntimeError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            RuntimeError::ResourceUnavailable(_) => ErrorKind::ResourceUnavailable,
            RuntimeError::Transient(_) => ErrorKind::Transient,
            RuntimeError::Interrupted { .. } => ErrorKind::Interrupted,
        }
    }

    /// Whether a caller-side retry policy may try again
    pub fn is_retryable(&self) -> bool {
        matches!(self, RuntimeError::Transient(_))
    }
}

impl From<CacheError> for RuntimeError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::InvalidKey { .. } | CacheError::InvalidRoot { .. } => {
                RuntimeError::InvalidArgument(err.to_string())
            }
            CacheError::Closed => RuntimeError::Interrupted { completed: 0 },
            CacheError::Io { .. } | CacheError::Serialization(_) => {
                RuntimeError::ResourceUnavailable(err.to_string())
            }
        }
    }
}

impl From<LockError> for RuntimeError {
    fn from(err: LockError) -> Self {
        RuntimeError::ResourceUnavailable(err.to_string())
    }
}

impl From<CounterError> for RuntimeError {
    fn from(err: CounterError) -> Self {
        match err {
            CounterError::Closed => RuntimeError::Interrupted { completed: 0 },
            other => RuntimeError::ResourceUnavailable(other.to_string()),
        }
    }
}
