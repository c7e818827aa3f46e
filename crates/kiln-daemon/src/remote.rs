//! Remote builder backend.
//!
//! Speaks the framed wire protocol to a peer daemon under a per-request
//! deadline, and keeps a sliding window of recent outcomes. While the
//! windowed failure rate sits above the configured threshold the backend
//! reports itself unavailable, so the dispatcher routes around a flapping
//! remote instead of paying the timeout on every request.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::backend::{BackendError, BackendKind, BuildJob, BuildOutput, CompileBackend};
use crate::protocol::{read_frame, write_frame, BuildStatus, RemoteRequest, RemoteResponse};

/// Outcomes remembered for the failure rate.
const WINDOW: usize = 32;

/// Below this many samples the tracker always reports healthy.
const MIN_SAMPLES: usize = 8;

/// Sliding window of recent remote outcomes.
struct FailureTracker {
    window: Mutex<VecDeque<bool>>,
    threshold: f64,
}

impl FailureTracker {
    fn new(threshold: f64) -> Self {
        Self {
            window: Mutex::new(VecDeque::with_capacity(WINDOW)),
            threshold,
        }
    }

    fn record(&self, failed: bool) {
        let mut window = self.window.lock();
        if window.len() == WINDOW {
            window.pop_front();
        }
        window.push_back(failed);
    }

    fn failure_rate(&self) -> f64 {
        let window = self.window.lock();
        if window.len() < MIN_SAMPLES {
            return 0.0;
        }
        let failures = window.iter().filter(|&&failed| failed).count();
        failures as f64 / window.len() as f64
    }

    fn healthy(&self) -> bool {
        self.failure_rate() < self.threshold
    }
}

/// Backend that forwards builds to a remote builder daemon.
pub struct RemoteBackend {
    endpoint: String,
    deadline: Duration,
    secret: Option<String>,
    tracker: FailureTracker,
}

impl RemoteBackend {
    pub fn new(
        endpoint: impl Into<String>,
        deadline: Duration,
        error_threshold: f64,
        secret: Option<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            deadline,
            secret,
            tracker: FailureTracker::new(error_threshold),
        }
    }

    /// Windowed failure rate, for logs and tests.
    pub fn failure_rate(&self) -> f64 {
        self.tracker.failure_rate()
    }

    async fn exchange(&self, job: &BuildJob) -> Result<RemoteResponse, BackendError> {
        let mut stream =
            TcpStream::connect(&self.endpoint)
                .await
                .map_err(|e| BackendError::Transport {
                    reason: format!("connect {}: {e}", self.endpoint),
                })?;

        let request = RemoteRequest {
            secret: self.secret.clone(),
            flags: job.invocation.clone(),
            source: job.source.as_slice().to_vec(),
        };
        write_frame(&mut stream, &request)
            .await
            .map_err(|e| BackendError::Transport {
                reason: format!("send request: {e}"),
            })?;
        read_frame(&mut stream)
            .await
            .map_err(|e| BackendError::Transport {
                reason: format!("read response: {e}"),
            })
    }
}

#[async_trait]
impl CompileBackend for RemoteBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Remote
    }

    fn available(&self) -> bool {
        self.tracker.healthy()
    }

    async fn run(&self, job: &BuildJob) -> Result<BuildOutput, BackendError> {
        let response = match tokio::time::timeout(self.deadline, self.exchange(job)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                warn!(endpoint = %self.endpoint, error = %e, "remote exchange failed");
                self.tracker.record(true);
                return Err(e);
            }
            Err(_) => {
                warn!(endpoint = %self.endpoint, "remote deadline exceeded");
                self.tracker.record(true);
                return Err(BackendError::DeadlineExceeded {
                    deadline_ms: self.deadline.as_millis() as u64,
                });
            }
        };

        match response.status {
            BuildStatus::Ok => {
                self.tracker.record(false);
                debug!(endpoint = %self.endpoint, "remote build succeeded");
                Ok(BuildOutput {
                    status: 0,
                    object: response.artifact.unwrap_or_default(),
                    stderr: response.stderr.unwrap_or_default(),
                })
            }
            // The remote infrastructure worked; the compiler itself failed.
            BuildStatus::BuildFailed => {
                self.tracker.record(false);
                let status = if response.exit_status != 0 {
                    response.exit_status
                } else {
                    1
                };
                Ok(BuildOutput {
                    status,
                    object: Vec::new(),
                    stderr: response.stderr.unwrap_or_default(),
                })
            }
            BuildStatus::Internal => {
                self.tracker.record(true);
                let reason = response
                    .stderr
                    .map(|b| String::from_utf8_lossy(&b).into_owned())
                    .unwrap_or_else(|| "unspecified".into());
                Err(BackendError::RemoteInternal { reason })
            }
        }
    }
}
