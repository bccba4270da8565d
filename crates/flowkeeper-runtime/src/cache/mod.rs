//! Content-addressed, TTL-bounded file cache
//!
//! ## Layout
//!
//! ```text
//! <cache_root>/entries/<64-hex key>.json     committed entries {key, written_at, payload}
//! <cache_root>/entries/.tmp-<pid>-<seq>      in-flight writes, renamed into place
//! ```
//!
//! ## Guarantees
//!
//! - Writes are write-then-rename, so readers never observe a partial entry.
//! - Expiry is lazy: an entry older than the TTL reads as a miss.
//! - Keys are 64-hex digests; anything else is rejected before touching disk.
//! - Only filesystem faults surface as errors. Retrying is the caller's call.

mod key;
mod store;

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

pub use key::{derive_key, hash_file, resolve_within, CacheKey};
pub use store::{CacheEntry, CacheStats, CacheStore, PruneReport};

/// Result alias for cache operations
pub type CacheResult<T> = Result<T, CacheError>;

/// Errors from cache operations
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("invalid cache key: {reason}")]
    InvalidKey { reason: String },

    #[error("invalid cache root {path}: {reason}")]
    InvalidRoot { path: PathBuf, reason: String },

    #[error("cache I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cache serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("cache is closed for writes")]
    Closed,
}

impl CacheError {
    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        CacheError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}
