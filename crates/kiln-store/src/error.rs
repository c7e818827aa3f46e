//! Store error types.

use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by store operations.
///
/// Read paths are fail-safe: corruption and transient I/O degrade to cache
/// misses at the caller. Only startup problems and oversized reservations
/// reach the caller as hard errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store root could not be created or scanned at startup.
    #[error("store root '{path}' is unavailable: {message}")]
    Unavailable { path: PathBuf, message: String },

    /// Another process holds the store lock.
    #[error("store lock '{path}' is held by another process")]
    LockHeld { path: PathBuf },

    /// The requested reservation exceeds the configured budget outright.
    #[error("artifact of {requested} bytes exceeds the cache budget of {budget} bytes")]
    BudgetExceeded { requested: u64, budget: u64 },

    /// A read or write under the store root failed.
    #[error("store I/O error at '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// An entry's on-disk bytes disagree with what was committed.
    #[error("corrupted entry {digest}: {details}")]
    Corrupted { digest: String, details: String },
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Convenient Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
