//! The per-request state machine.
//!
//! A request moves through parse → fingerprint → lookup → inflight →
//! build → store → serve. Cache-ineligible requests short-circuit to direct
//! local execution. On a miss, the inflight table elects one leader per
//! fingerprint; the leader builds (local or remote, with a one-shot fallback
//! to the other side), persists the artifact, and wakes every follower with
//! the shared result.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, warn};
use uuid::Uuid;

use kiln_core::{fingerprint, Clock, Digest, Invocation, SystemClock};
use kiln_store::{ArtifactStore, StoreError};

use crate::artifact::{encode_parts, Artifact};
use crate::backend::{BackendError, BackendKind, BuildJob, BuildOutput, CompileBackend};
use crate::cancel::CancelToken;
use crate::error::{DispatchError, DispatchResult};
use crate::inflight::{Claim, Completion, FollowerSignal, InflightTable, LeaderSlot};
use crate::stats::DispatchStats;
use crate::workers::WorkerPool;

/// Everything a dispatcher needs from its environment. Passed in explicitly;
/// the core holds no process-wide state.
#[derive(Clone)]
pub struct Context {
    pub clock: Arc<dyn Clock>,
    pub stats: Arc<DispatchStats>,
}

impl Default for Context {
    fn default() -> Self {
        Self {
            clock: Arc::new(SystemClock::new()),
            stats: Arc::new(DispatchStats::new()),
        }
    }
}

/// One compilation request as seen by the dispatcher.
pub struct CompileRequest {
    /// Correlation id for logs.
    pub id: Uuid,
    pub invocation: Invocation,
    /// Preprocessed translation unit. Empty when the driver had nothing to
    /// preprocess, which forces the direct path.
    pub source: Arc<Vec<u8>>,
    /// Where to materialize the object file, for local callers.
    pub output_path: Option<PathBuf>,
    pub cancel: CancelToken,
}

impl CompileRequest {
    pub fn new(invocation: Invocation, source: Vec<u8>) -> Self {
        Self {
            id: Uuid::new_v4(),
            invocation,
            source: Arc::new(source),
            output_path: None,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_output_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_path = Some(path.into());
        self
    }
}

/// How a reply was produced; drives tests and log lines, not behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Served {
    /// Straight from the store.
    Hit,
    /// Built by this request as inflight leader.
    Built,
    /// Received from another request's build.
    Followed,
    /// Cache-ineligible, ran directly.
    Direct,
}

/// Successful dispatch outcome.
#[derive(Debug)]
pub struct CompileReply {
    pub object: Arc<Vec<u8>>,
    pub stderr: Arc<Vec<u8>>,
    pub served: Served,
}

/// What happened when the leader tried to persist its artifact.
enum Persist {
    Cached,
    /// Not cached (budget or I/O); the artifact is still served from memory.
    Uncached,
    /// Read-back verification failed; the entry was deleted.
    Corrupt,
}

/// The request state machine.
pub struct Dispatcher {
    store: Arc<ArtifactStore>,
    inflight: InflightTable,
    pool: WorkerPool,
    local: Arc<dyn CompileBackend>,
    remote: Option<Arc<dyn CompileBackend>>,
    queue_high_watermark: usize,
    ctx: Context,
}

impl Dispatcher {
    pub fn new(
        store: Arc<ArtifactStore>,
        local: Arc<dyn CompileBackend>,
        remote: Option<Arc<dyn CompileBackend>>,
        pool: WorkerPool,
        queue_high_watermark: usize,
        ctx: Context,
    ) -> Self {
        Self {
            store,
            inflight: InflightTable::new(),
            pool,
            local,
            remote,
            queue_high_watermark,
            ctx,
        }
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn store(&self) -> &Arc<ArtifactStore> {
        &self.store
    }

    /// Drives one request to completion.
    pub async fn dispatch(&self, request: CompileRequest) -> DispatchResult<CompileReply> {
        if request.cancel.is_cancelled() {
            self.ctx.stats.record_cancelled();
            return Err(DispatchError::Cancelled);
        }

        if !request.invocation.is_cacheable() || request.source.is_empty() {
            return self.dispatch_direct(&request).await;
        }

        let digest = fingerprint(&request.source, &request.invocation);
        debug!(request = %request.id, digest = %digest, "request fingerprinted");

        if let Some(artifact) = self.read_cached(&digest).await {
            self.ctx.stats.record_hit();
            debug!(request = %request.id, digest = %digest, "cache hit");
            return self
                .serve_bytes(
                    &request,
                    Arc::new(artifact.object),
                    Arc::new(artifact.stderr),
                    Served::Hit,
                )
                .await;
        }
        self.ctx.stats.record_miss();

        let mut claim = self.inflight.claim(digest);
        loop {
            match claim {
                Claim::Leader(slot) => return self.lead_build(&request, digest, slot).await,
                Claim::Follower(ticket) => {
                    self.ctx.stats.record_dedup_join();
                    debug!(request = %request.id, digest = %digest, "joined inflight build");
                    let signal = tokio::select! {
                        signal = ticket.wait() => signal,
                        _ = request.cancel.cancelled() => {
                            // Dropping the ticket detaches this follower;
                            // the leader continues undisturbed.
                            self.ctx.stats.record_cancelled();
                            return Err(DispatchError::Cancelled);
                        }
                    };
                    match signal {
                        Some(FollowerSignal::Done(outcome)) => {
                            return self.reply_from(&request, &outcome, Served::Followed).await;
                        }
                        Some(FollowerSignal::Promoted(slot)) => {
                            debug!(request = %request.id, digest = %digest, "promoted to leader");
                            claim = Claim::Leader(slot);
                        }
                        None => {
                            return Err(DispatchError::internal("inflight record vanished"));
                        }
                    }
                }
            }
        }
    }

    /// Direct path: no fingerprint, no store, no inflight. Still bounded by
    /// the worker pool.
    async fn dispatch_direct(&self, request: &CompileRequest) -> DispatchResult<CompileReply> {
        self.ctx.stats.record_direct();
        debug!(
            request = %request.id,
            action = ?request.invocation.action,
            "cache-ineligible, running direct"
        );

        let job = self.job_for(request);
        let result = tokio::select! {
            result = self.run_backend(&self.local, &job) => result?,
            _ = request.cancel.cancelled() => {
                self.ctx.stats.record_cancelled();
                return Err(DispatchError::Cancelled);
            }
        };
        let output = match result {
            Ok(output) => output,
            Err(e) => return Err(DispatchError::internal(e.to_string())),
        };
        self.note_build(BackendKind::Local);

        if output.succeeded() {
            self.serve_bytes(
                request,
                Arc::new(output.object),
                Arc::new(output.stderr),
                Served::Direct,
            )
            .await
        } else {
            self.ctx.stats.record_build_failure();
            Err(DispatchError::BuildFailed {
                status: output.status,
                stderr: output.stderr,
            })
        }
    }

    /// Leader path: build, persist, publish, serve.
    async fn lead_build(
        &self,
        request: &CompileRequest,
        digest: Digest,
        slot: LeaderSlot,
    ) -> DispatchResult<CompileReply> {
        // A previous leader may have committed between our lookup and claim.
        if let Some(artifact) = self.read_cached(&digest).await {
            let completion = Arc::new(Completion::Success {
                object: Arc::new(artifact.object),
                stderr: Arc::new(artifact.stderr),
            });
            slot.complete(Arc::clone(&completion));
            return self.reply_from(request, &completion, Served::Hit).await;
        }

        let job = self.job_for(request);
        let built = tokio::select! {
            built = self.build_and_persist(digest, &job) => built,
            _ = request.cancel.cancelled() => {
                // Oldest follower (if any) takes over the build.
                self.ctx.stats.record_cancelled();
                slot.abdicate();
                return Err(DispatchError::Cancelled);
            }
        };

        match built {
            Ok(completion) => {
                slot.complete(Arc::clone(&completion));
                self.reply_from(request, &completion, Served::Built).await
            }
            Err(e) => {
                // Followers each translate this to their own failure.
                slot.complete(Arc::new(Completion::Error {
                    message: e.to_string(),
                }));
                Err(e)
            }
        }
    }

    /// Runs the build (with the one-shot fallback) and writes the result
    /// back into the store. Compiler failures come back as
    /// [`Completion::Failure`]; only infrastructure failures with no
    /// fallback left are `Err`.
    async fn build_and_persist(
        &self,
        digest: Digest,
        job: &BuildJob,
    ) -> DispatchResult<Arc<Completion>> {
        let mut attempt = 0;
        loop {
            let output = self.execute_with_fallback(job).await?;

            if !output.succeeded() {
                self.ctx.stats.record_build_failure();
                return Ok(Arc::new(Completion::Failure {
                    status: output.status,
                    stderr: Arc::new(output.stderr),
                }));
            }

            let object = Arc::new(output.object);
            let stderr = Arc::new(output.stderr);
            match self.persist(digest, &object, &stderr).await {
                Persist::Cached | Persist::Uncached => {
                    return Ok(Arc::new(Completion::Success { object, stderr }));
                }
                Persist::Corrupt if attempt == 0 => {
                    // Entry already deleted; run the build once more.
                    self.ctx.stats.record_corruption_retry();
                    attempt += 1;
                }
                Persist::Corrupt => {
                    warn!(digest = %digest, "read-back failed twice, serving uncached");
                    return Ok(Arc::new(Completion::Success { object, stderr }));
                }
            }
        }
    }

    /// Picks a primary backend per the routing rules and falls back to the
    /// other side exactly once on infrastructure failure.
    async fn execute_with_fallback(&self, job: &BuildJob) -> DispatchResult<BuildOutput> {
        let (primary, fallback) = self.route();

        match self.run_backend(primary, job).await? {
            Ok(output) => {
                self.note_build(primary.kind());
                return Ok(output);
            }
            Err(e) => {
                warn!(backend = %primary.kind(), error = %e, "primary backend failed");
                let Some(fallback) = fallback else {
                    return Err(fatal_backend_error(e));
                };
                self.ctx.stats.record_fallback();
                match self.run_backend(fallback, job).await? {
                    Ok(output) => {
                        self.note_build(fallback.kind());
                        Ok(output)
                    }
                    Err(e2) => {
                        warn!(backend = %fallback.kind(), error = %e2, "fallback backend failed");
                        Err(fatal_backend_error(e2))
                    }
                }
            }
        }
    }

    /// Remote is preferred only when the local pool is saturated past the
    /// high watermark and the remote breaker is closed. An unhealthy remote
    /// is not used even as a fallback.
    fn route(&self) -> (&Arc<dyn CompileBackend>, Option<&Arc<dyn CompileBackend>>) {
        match &self.remote {
            Some(remote) if remote.available() => {
                if self.pool.queue_depth() >= self.queue_high_watermark {
                    (remote, Some(&self.local))
                } else {
                    (&self.local, Some(remote))
                }
            }
            _ => (&self.local, None),
        }
    }

    /// Submits one backend run to the worker pool. The outer error means the
    /// pool is shut down; the inner result is the backend's own.
    async fn run_backend(
        &self,
        backend: &Arc<dyn CompileBackend>,
        job: &BuildJob,
    ) -> DispatchResult<Result<BuildOutput, BackendError>> {
        self.pool
            .run(backend.run(job))
            .await
            .map_err(|_| DispatchError::internal("worker pool is shut down"))
    }

    /// Encodes and commits the artifact. Never fails the request: budget and
    /// I/O problems degrade to serving from memory, corruption reports
    /// [`Persist::Corrupt`] after deleting the entry.
    async fn persist(&self, digest: Digest, object: &Arc<Vec<u8>>, stderr: &Arc<Vec<u8>>) -> Persist {
        let payload = match encode_parts(object, stderr) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(digest = %digest, error = %e, "artifact encode failed, serving uncached");
                return Persist::Uncached;
            }
        };

        let reservation = match self.store.reserve(digest, payload.len() as u64).await {
            Ok(reservation) => reservation,
            Err(StoreError::BudgetExceeded { requested, budget }) => {
                warn!(digest = %digest, requested, budget, "artifact exceeds budget, not caching");
                self.ctx.stats.record_budget_skip();
                return Persist::Uncached;
            }
            Err(e) => {
                warn!(digest = %digest, error = %e, "reservation failed, not caching");
                return Persist::Uncached;
            }
        };

        let handle = match self.store.commit(reservation, &payload).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!(digest = %digest, error = %e, "commit failed, serving uncached");
                return Persist::Uncached;
            }
        };

        // Read-back verification through the container checksum.
        match handle.read().await {
            Ok(bytes) if Artifact::decode(&bytes).is_ok() => Persist::Cached,
            _ => {
                warn!(digest = %digest, "read-back verification failed, deleting entry");
                self.store.delete(&digest).await;
                Persist::Corrupt
            }
        }
    }

    /// Fail-safe cached read: any store or container problem deletes the
    /// entry and reports a miss.
    async fn read_cached(&self, digest: &Digest) -> Option<Artifact> {
        let handle = self.store.lookup(digest).await?;
        let bytes = match handle.read().await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(digest = %digest, error = %e, "cached entry unreadable, deleting");
                self.store.delete(digest).await;
                return None;
            }
        };
        match Artifact::decode(&bytes) {
            Ok(artifact) => Some(artifact),
            Err(e) => {
                warn!(digest = %digest, error = %e, "cached entry corrupt, deleting");
                self.store.delete(digest).await;
                None
            }
        }
    }

    async fn reply_from(
        &self,
        request: &CompileRequest,
        completion: &Arc<Completion>,
        served: Served,
    ) -> DispatchResult<CompileReply> {
        match &**completion {
            Completion::Success { object, stderr } => {
                self.serve_bytes(request, Arc::clone(object), Arc::clone(stderr), served)
                    .await
            }
            Completion::Failure { status, stderr } => Err(DispatchError::BuildFailed {
                status: *status,
                stderr: stderr.as_slice().to_vec(),
            }),
            Completion::Error { message } => Err(DispatchError::internal(message.clone())),
        }
    }

    /// Materializes the payload at the caller-requested output path and
    /// hands the bytes back.
    async fn serve_bytes(
        &self,
        request: &CompileRequest,
        object: Arc<Vec<u8>>,
        stderr: Arc<Vec<u8>>,
        served: Served,
    ) -> DispatchResult<CompileReply> {
        if let Some(path) = &request.output_path {
            tokio::fs::write(path, object.as_slice())
                .await
                .map_err(|e| {
                    DispatchError::internal(format!("write output '{}': {e}", path.display()))
                })?;
        }
        Ok(CompileReply {
            object,
            stderr,
            served,
        })
    }

    fn job_for(&self, request: &CompileRequest) -> BuildJob {
        BuildJob {
            invocation: request.invocation.clone(),
            source: Arc::clone(&request.source),
        }
    }

    fn note_build(&self, kind: BackendKind) {
        match kind {
            BackendKind::Local => self.ctx.stats.record_local_build(),
            BackendKind::Remote => self.ctx.stats.record_remote_build(),
        }
    }
}

fn fatal_backend_error(e: BackendError) -> DispatchError {
    match e {
        BackendError::Transport { .. }
        | BackendError::DeadlineExceeded { .. }
        | BackendError::RemoteInternal { .. } => DispatchError::RemoteUnavailable {
            reason: e.to_string(),
        },
        other => DispatchError::internal(other.to_string()),
    }
}
