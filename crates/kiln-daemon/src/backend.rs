//! The compile-backend interface.
//!
//! A build can run under the local compiler subprocess or on a remote
//! builder; both are variants of one interface so the dispatcher's routing
//! and fallback logic never branches on the concrete type.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use kiln_core::Invocation;

/// Which flavor of backend produced a result; used in routing and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Local,
    Remote,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Local => write!(f, "local"),
            BackendKind::Remote => write!(f, "remote"),
        }
    }
}

/// One build as handed to a backend: the flag set plus the preprocessed
/// translation unit.
#[derive(Debug, Clone)]
pub struct BuildJob {
    pub invocation: Invocation,
    pub source: Arc<Vec<u8>>,
}

/// What a backend hands back when the compiler actually ran.
///
/// A non-zero `status` is a *compile* failure, not a backend error; the
/// dispatcher surfaces it to the caller uncached.
#[derive(Debug)]
pub struct BuildOutput {
    pub status: i32,
    pub object: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl BuildOutput {
    pub fn succeeded(&self) -> bool {
        self.status == 0
    }
}

/// Infrastructure failures a backend can hit before or instead of running
/// the compiler. These trigger the dispatcher's one-shot fallback.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The compiler binary could not be launched.
    #[error("failed to launch compiler '{path}': {source}")]
    Spawn {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Scratch-file I/O around the build failed.
    #[error("build scratch I/O failed: {0}")]
    Scratch(#[from] std::io::Error),

    /// The local build exceeded its configured wall cap.
    #[error("local build exceeded its {cap_ms} ms wall cap")]
    WallCapExceeded { cap_ms: u64 },

    /// The remote builder could not be reached or the stream broke.
    #[error("remote transport failure: {reason}")]
    Transport { reason: String },

    /// The remote builder did not answer within the deadline.
    #[error("remote deadline of {deadline_ms} ms exceeded")]
    DeadlineExceeded { deadline_ms: u64 },

    /// The remote builder answered with an internal error.
    #[error("remote builder reported an internal error: {reason}")]
    RemoteInternal { reason: String },
}

/// A way of running one compilation.
#[async_trait]
pub trait CompileBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Whether this backend is currently worth trying. The remote backend
    /// reports `false` while its recent failure rate is above threshold.
    fn available(&self) -> bool {
        true
    }

    async fn run(&self, job: &BuildJob) -> Result<BuildOutput, BackendError>;
}
