//! Dispatch error taxonomy.
//!
//! These are the kinds surfaced at the dispatcher boundary. Workers never
//! propagate a compiler's non-zero exit as a system error; it arrives here as
//! [`DispatchError::BuildFailed`] with the captured stderr.

use thiserror::Error;

use kiln_store::StoreError;

/// Errors surfaced to the caller of a dispatch.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The compiler exited non-zero. Never cached.
    #[error("build failed with exit status {status}")]
    BuildFailed {
        status: i32,
        /// Captured compiler diagnostics.
        stderr: Vec<u8>,
    },

    /// The remote builder could not be reached or timed out, and no local
    /// fallback remained.
    #[error("remote builder unavailable: {reason}")]
    RemoteUnavailable { reason: String },

    /// The caller disconnected or the deadline expired.
    #[error("request cancelled")]
    Cancelled,

    /// A store failure that could not be degraded to a miss.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Infrastructure failure with no fallback left.
    #[error("internal dispatch error: {reason}")]
    Internal { reason: String },
}

impl DispatchError {
    pub fn internal(reason: impl Into<String>) -> Self {
        DispatchError::Internal {
            reason: reason.into(),
        }
    }
}

/// Convenient Result type for dispatch operations.
pub type DispatchResult<T> = Result<T, DispatchError>;
