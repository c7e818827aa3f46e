//! Integration tests for the dispatcher state machine, driven by scripted
//! backends so that worker invocations can be counted exactly.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use kiln_core::{CompilerId, Invocation, SystemClock};
use kiln_daemon::{
    BackendError, BackendKind, BuildJob, BuildOutput, CompileBackend, CompileRequest, Context,
    DispatchError, Dispatcher, RemoteBackend, Served, Server, WorkerPool,
};
use kiln_store::ArtifactStore;

const SOURCE: &[u8] = b"int main(){return 0;}\n";

/// What a scripted backend does when invoked.
enum Script {
    /// Succeed, echoing the preprocessed source back as the object.
    Echo,
    /// Compiler exits non-zero.
    Fail { status: i32, stderr: &'static [u8] },
    /// Infrastructure failure of the given flavor.
    Infra(fn() -> BackendError),
    /// Wait on the gate, then echo.
    Gated(Arc<tokio::sync::Semaphore>),
}

struct FakeBackend {
    kind: BackendKind,
    script: Script,
    calls: AtomicUsize,
}

impl FakeBackend {
    fn new(kind: BackendKind, script: Script) -> Arc<Self> {
        Arc::new(Self {
            kind,
            script,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CompileBackend for FakeBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn run(&self, job: &BuildJob) -> Result<BuildOutput, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.script {
            Script::Echo => Ok(BuildOutput {
                status: 0,
                object: job.source.as_slice().to_vec(),
                stderr: b"note: built\n".to_vec(),
            }),
            Script::Fail { status, stderr } => Ok(BuildOutput {
                status: *status,
                object: Vec::new(),
                stderr: stderr.to_vec(),
            }),
            Script::Infra(make) => Err(make()),
            Script::Gated(gate) => {
                let permit = gate.acquire().await.expect("gate closed");
                permit.forget();
                Ok(BuildOutput {
                    status: 0,
                    object: job.source.as_slice().to_vec(),
                    stderr: Vec::new(),
                })
            }
        }
    }
}

fn transport_error() -> BackendError {
    BackendError::Transport {
        reason: "scripted outage".into(),
    }
}

fn spawn_error() -> BackendError {
    BackendError::Spawn {
        path: "/usr/bin/clang".into(),
        source: std::io::Error::new(std::io::ErrorKind::NotFound, "scripted"),
    }
}

fn invocation() -> Invocation {
    Invocation::from_args(
        CompilerId::new("/usr/bin/clang", "3.4"),
        ["-cc1", "-emit-obj", "-o", "a.o", "a.cc"],
    )
}

struct Harness {
    _dir: tempfile::TempDir,
    dispatcher: Arc<Dispatcher>,
}

fn harness(
    local: Arc<FakeBackend>,
    remote: Option<Arc<FakeBackend>>,
    watermark: usize,
) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(
        ArtifactStore::open(dir.path(), 1 << 20, false, Arc::new(SystemClock::new())).unwrap(),
    );
    let dispatcher = Arc::new(Dispatcher::new(
        store,
        local as Arc<dyn CompileBackend>,
        remote.map(|r| r as Arc<dyn CompileBackend>),
        WorkerPool::new(4),
        watermark,
        Context::default(),
    ));
    Harness {
        _dir: dir,
        dispatcher,
    }
}

#[tokio::test]
async fn second_identical_request_is_a_hit_without_a_build() {
    let local = FakeBackend::new(BackendKind::Local, Script::Echo);
    let h = harness(Arc::clone(&local), None, 4);

    let first = h
        .dispatcher
        .dispatch(CompileRequest::new(invocation(), SOURCE.to_vec()))
        .await
        .unwrap();
    assert_eq!(first.served, Served::Built);
    assert_eq!(local.calls(), 1);

    // Same cacheable inputs, different output path.
    let out_dir = tempfile::tempdir().unwrap();
    let out_path = out_dir.path().join("b.o");
    let mut second_invocation = invocation();
    second_invocation.output = Some("b.o".into());
    let second = h
        .dispatcher
        .dispatch(
            CompileRequest::new(second_invocation, SOURCE.to_vec())
                .with_output_path(&out_path),
        )
        .await
        .unwrap();

    assert_eq!(second.served, Served::Hit);
    assert_eq!(local.calls(), 1, "hit must not invoke a worker");
    assert_eq!(second.object.as_slice(), first.object.as_slice());
    assert_eq!(std::fs::read(&out_path).unwrap(), SOURCE);

    let stats = h.dispatcher.context().stats.snapshot();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);
}

#[tokio::test]
async fn non_cached_flag_values_do_not_split_the_cache() {
    let local = FakeBackend::new(BackendKind::Local, Script::Echo);
    let h = harness(Arc::clone(&local), None, 4);

    let mut first = invocation();
    first.non_cached = vec!["-coverage-file".into(), "/tmp/a.o".into()];
    h.dispatcher
        .dispatch(CompileRequest::new(first, SOURCE.to_vec()))
        .await
        .unwrap();

    let mut second = invocation();
    second.non_cached = vec!["-coverage-file".into(), "/tmp/b.o".into()];
    let reply = h
        .dispatcher
        .dispatch(CompileRequest::new(second, SOURCE.to_vec()))
        .await
        .unwrap();

    assert_eq!(reply.served, Served::Hit);
    assert_eq!(local.calls(), 1);
}

#[tokio::test]
async fn ten_concurrent_duplicates_build_once() {
    let gate = Arc::new(tokio::sync::Semaphore::new(0));
    let local = FakeBackend::new(BackendKind::Local, Script::Gated(Arc::clone(&gate)));
    let h = harness(Arc::clone(&local), None, 4);

    let mut tasks = Vec::new();
    for _ in 0..10 {
        let dispatcher = Arc::clone(&h.dispatcher);
        tasks.push(tokio::spawn(async move {
            dispatcher
                .dispatch(CompileRequest::new(invocation(), SOURCE.to_vec()))
                .await
                .unwrap()
        }));
    }

    // Let the leader reach the backend and the rest pile up behind it.
    while local.calls() == 0 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
    gate.add_permits(1);

    for task in tasks {
        let reply = task.await.unwrap();
        assert_eq!(reply.object.as_slice(), SOURCE);
    }
    assert_eq!(local.calls(), 1, "duplicates must collapse to one build");

    let stats = h.dispatcher.context().stats.snapshot();
    assert_eq!(stats.dedup_joins, 9);
}

#[tokio::test]
async fn compile_failure_is_surfaced_and_not_cached() {
    let local = FakeBackend::new(
        BackendKind::Local,
        Script::Fail {
            status: 1,
            stderr: b"a.cc:1:1: error: expected unqualified-id\n",
        },
    );
    let h = harness(Arc::clone(&local), None, 4);

    let err = h
        .dispatcher
        .dispatch(CompileRequest::new(invocation(), SOURCE.to_vec()))
        .await
        .unwrap_err();
    match err {
        DispatchError::BuildFailed { status, stderr } => {
            assert_eq!(status, 1);
            assert!(String::from_utf8_lossy(&stderr).contains("expected unqualified-id"));
        }
        other => panic!("expected BuildFailed, got {other:?}"),
    }
    assert_eq!(h.dispatcher.store().entry_count(), 0, "failures are not cached");

    // A later identical request misses and builds again.
    let _ = h
        .dispatcher
        .dispatch(CompileRequest::new(invocation(), SOURCE.to_vec()))
        .await
        .unwrap_err();
    assert_eq!(local.calls(), 2);
}

#[tokio::test]
async fn follower_receives_the_leaders_artifact() {
    let gate = Arc::new(tokio::sync::Semaphore::new(0));
    let local = FakeBackend::new(BackendKind::Local, Script::Gated(Arc::clone(&gate)));
    let h = harness(Arc::clone(&local), None, 4);

    // Leader blocked in the backend; follower joins the same fingerprint.
    let leader = {
        let dispatcher = Arc::clone(&h.dispatcher);
        tokio::spawn(async move {
            dispatcher
                .dispatch(CompileRequest::new(invocation(), SOURCE.to_vec()))
                .await
        })
    };
    while local.calls() == 0 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    let follower = {
        let dispatcher = Arc::clone(&h.dispatcher);
        tokio::spawn(async move {
            dispatcher
                .dispatch(CompileRequest::new(invocation(), SOURCE.to_vec()))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    gate.add_permits(1);

    let leader_reply = leader.await.unwrap().unwrap();
    let follower_reply = follower.await.unwrap().unwrap();
    assert_eq!(leader_reply.served, Served::Built);
    assert_eq!(follower_reply.served, Served::Followed);
    assert_eq!(follower_reply.object.as_slice(), leader_reply.object.as_slice());
    assert_eq!(local.calls(), 1);
}

#[tokio::test]
async fn remote_failure_falls_back_to_local_once() {
    let remote = FakeBackend::new(BackendKind::Remote, Script::Infra(transport_error));
    let local = FakeBackend::new(BackendKind::Local, Script::Echo);
    // Watermark zero: remote is always the preferred backend.
    let h = harness(Arc::clone(&local), Some(Arc::clone(&remote)), 0);

    let reply = h
        .dispatcher
        .dispatch(CompileRequest::new(invocation(), SOURCE.to_vec()))
        .await
        .unwrap();
    assert_eq!(reply.served, Served::Built);
    assert_eq!(remote.calls(), 1);
    assert_eq!(local.calls(), 1);

    // The artifact landed in the cache despite the detour.
    let second = h
        .dispatcher
        .dispatch(CompileRequest::new(invocation(), SOURCE.to_vec()))
        .await
        .unwrap();
    assert_eq!(second.served, Served::Hit);
    assert_eq!(local.calls(), 1);

    let stats = h.dispatcher.context().stats.snapshot();
    assert_eq!(stats.fallbacks, 1);
}

#[tokio::test]
async fn second_infrastructure_failure_is_fatal() {
    let remote = FakeBackend::new(BackendKind::Remote, Script::Infra(transport_error));
    let local = FakeBackend::new(BackendKind::Local, Script::Infra(spawn_error));
    let h = harness(Arc::clone(&local), Some(Arc::clone(&remote)), 0);

    let err = h
        .dispatcher
        .dispatch(CompileRequest::new(invocation(), SOURCE.to_vec()))
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::Internal { .. }));
    assert_eq!(remote.calls(), 1);
    assert_eq!(local.calls(), 1);
}

#[tokio::test]
async fn cache_ineligible_requests_run_direct() {
    let local = FakeBackend::new(BackendKind::Local, Script::Echo);
    let h = harness(Arc::clone(&local), None, 4);

    // No input source: unknown action.
    let version_query = Invocation::from_args(
        CompilerId::new("/usr/bin/clang", "3.4"),
        ["--version"],
    );
    let reply = h
        .dispatcher
        .dispatch(CompileRequest::new(version_query, b"x".to_vec()))
        .await
        .unwrap();
    assert_eq!(reply.served, Served::Direct);

    // Compile action but nothing preprocessed: also direct.
    let reply = h
        .dispatcher
        .dispatch(CompileRequest::new(invocation(), Vec::new()))
        .await
        .unwrap();
    assert_eq!(reply.served, Served::Direct);

    assert_eq!(h.dispatcher.store().entry_count(), 0, "direct path must bypass the store");
    assert_eq!(local.calls(), 2);
}

#[tokio::test]
async fn cancelled_leader_promotes_follower_who_builds() {
    let gate = Arc::new(tokio::sync::Semaphore::new(0));
    let local = FakeBackend::new(BackendKind::Local, Script::Gated(Arc::clone(&gate)));
    let h = harness(Arc::clone(&local), None, 4);

    let leader_request = CompileRequest::new(invocation(), SOURCE.to_vec());
    let leader_cancel = leader_request.cancel.clone();
    let leader = {
        let dispatcher = Arc::clone(&h.dispatcher);
        tokio::spawn(async move { dispatcher.dispatch(leader_request).await })
    };
    while local.calls() == 0 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    let follower = {
        let dispatcher = Arc::clone(&h.dispatcher);
        tokio::spawn(async move {
            dispatcher
                .dispatch(CompileRequest::new(invocation(), SOURCE.to_vec()))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    leader_cancel.cancel();
    assert!(matches!(
        leader.await.unwrap(),
        Err(DispatchError::Cancelled)
    ));

    // The promoted follower re-runs the build itself.
    gate.add_permits(2);
    let reply = follower.await.unwrap().unwrap();
    assert_eq!(reply.served, Served::Built);
    assert_eq!(reply.object.as_slice(), SOURCE);
    assert_eq!(local.calls(), 2);
}

#[tokio::test]
async fn cancelled_follower_detaches_quietly() {
    let gate = Arc::new(tokio::sync::Semaphore::new(0));
    let local = FakeBackend::new(BackendKind::Local, Script::Gated(Arc::clone(&gate)));
    let h = harness(Arc::clone(&local), None, 4);

    let leader = {
        let dispatcher = Arc::clone(&h.dispatcher);
        tokio::spawn(async move {
            dispatcher
                .dispatch(CompileRequest::new(invocation(), SOURCE.to_vec()))
                .await
        })
    };
    while local.calls() == 0 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    let follower_request = CompileRequest::new(invocation(), SOURCE.to_vec());
    let follower_cancel = follower_request.cancel.clone();
    let follower = {
        let dispatcher = Arc::clone(&h.dispatcher);
        tokio::spawn(async move { dispatcher.dispatch(follower_request).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    follower_cancel.cancel();
    assert!(matches!(
        follower.await.unwrap(),
        Err(DispatchError::Cancelled)
    ));

    // The leader is unaffected.
    gate.add_permits(1);
    let reply = leader.await.unwrap().unwrap();
    assert_eq!(reply.served, Served::Built);
    assert_eq!(local.calls(), 1);
}

#[tokio::test]
async fn remote_round_trip_through_the_server() {
    // Builder daemon: local Echo backend behind a TCP server.
    let builder_local = FakeBackend::new(BackendKind::Local, Script::Echo);
    let builder = harness(Arc::clone(&builder_local), None, 4);
    let server = Server::bind(
        Arc::clone(&builder.dispatcher),
        Some("s3cret".into()),
        "127.0.0.1:0",
    )
    .await
    .unwrap();
    let addr = server.local_addr().unwrap();
    let shutdown = server.shutdown_handle();
    let server_task = tokio::spawn(server.run());

    // Client daemon: remote backend pointed at the builder, local unusable.
    let remote = Arc::new(RemoteBackend::new(
        addr.to_string(),
        Duration::from_secs(5),
        0.5,
        Some("s3cret".into()),
    ));
    let client_local = FakeBackend::new(BackendKind::Local, Script::Infra(spawn_error));
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(
        ArtifactStore::open(dir.path(), 1 << 20, false, Arc::new(SystemClock::new())).unwrap(),
    );
    let client = Dispatcher::new(
        store,
        client_local as Arc<dyn CompileBackend>,
        Some(remote as Arc<dyn CompileBackend>),
        WorkerPool::new(2),
        0,
        Context::default(),
    );

    let reply = client
        .dispatch(CompileRequest::new(invocation(), SOURCE.to_vec()))
        .await
        .unwrap();
    assert_eq!(reply.object.as_slice(), SOURCE);
    assert_eq!(builder_local.calls(), 1);

    let stats = client.context().stats.snapshot();
    assert_eq!(stats.remote_builds, 1);

    shutdown.notify_one();
    let _ = server_task.await;
}

#[tokio::test]
async fn server_rejects_bad_shared_secret() {
    let builder_local = FakeBackend::new(BackendKind::Local, Script::Echo);
    let builder = harness(Arc::clone(&builder_local), None, 4);
    let server = Server::bind(
        Arc::clone(&builder.dispatcher),
        Some("right".into()),
        "127.0.0.1:0",
    )
    .await
    .unwrap();
    let addr = server.local_addr().unwrap();
    let shutdown = server.shutdown_handle();
    let server_task = tokio::spawn(server.run());

    let remote = RemoteBackend::new(addr.to_string(), Duration::from_secs(5), 0.5, Some("wrong".into()));
    let job = BuildJob {
        invocation: invocation(),
        source: Arc::new(SOURCE.to_vec()),
    };
    let err = remote.run(&job).await.unwrap_err();
    assert!(matches!(err, BackendError::RemoteInternal { .. }));
    assert_eq!(builder_local.calls(), 0);

    shutdown.notify_one();
    let _ = server_task.await;
}
