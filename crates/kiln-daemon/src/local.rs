//! Local compiler subprocess backend.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::backend::{BackendError, BackendKind, BuildJob, BuildOutput, CompileBackend};

/// Runs builds by invoking the job's compiler on this machine.
///
/// Each build gets a scratch directory that is removed on every exit path.
/// The subprocess is spawned with `kill_on_drop`, so cancelling the build
/// future (leader cancellation, wall cap) also kills the compiler.
pub struct LocalBackend {
    /// Optional wall-clock cap on one build. `None` means uncapped.
    wall_cap: Option<Duration>,
}

impl LocalBackend {
    pub fn new(wall_cap: Option<Duration>) -> Self {
        Self { wall_cap }
    }
}

#[async_trait]
impl CompileBackend for LocalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    async fn run(&self, job: &BuildJob) -> Result<BuildOutput, BackendError> {
        let scratch = tempfile::tempdir()?;

        let input_name = job
            .invocation
            .input
            .as_deref()
            .map(file_name_of)
            .unwrap_or("input.i");
        let input_path = scratch.path().join(input_name);
        let output_path = scratch.path().join("output.o");
        tokio::fs::write(&input_path, job.source.as_slice()).await?;

        let compiler = &job.invocation.compiler.path;
        let mut command = Command::new(compiler);
        command
            .args(&job.invocation.other)
            .args(&job.invocation.non_cached);
        if let Some(language) = &job.invocation.language {
            command.arg("-x").arg(language);
        }
        command
            .arg(&input_path)
            .arg("-o")
            .arg(&output_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(compiler = %compiler, input = %input_path.display(), "spawning local build");
        let child = command.spawn().map_err(|e| BackendError::Spawn {
            path: compiler.clone(),
            source: e,
        })?;

        let output = match self.wall_cap {
            Some(cap) => tokio::time::timeout(cap, child.wait_with_output())
                .await
                .map_err(|_| BackendError::WallCapExceeded {
                    cap_ms: cap.as_millis() as u64,
                })??,
            None => child.wait_with_output().await?,
        };

        let status = output.status.code().unwrap_or(-1);
        let object = if status == 0 {
            tokio::fs::read(&output_path).await?
        } else {
            Vec::new()
        };

        Ok(BuildOutput {
            status,
            object,
            stderr: output.stderr,
        })
    }
}

fn file_name_of(path: &str) -> &str {
    Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("input.i")
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::Arc;

    use kiln_core::{CompilerId, Invocation};

    /// Writes an executable shell script standing in for a compiler.
    fn fake_compiler(dir: &Path, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("fake-cc");
        let script = format!("#!/bin/sh\n{body}\n");
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_str().unwrap().to_string()
    }

    /// Script body that copies its input to the `-o` target.
    const COPY_BODY: &str = r#"
out=""
in=""
while [ $# -gt 0 ]; do
  case "$1" in
    -o) shift; out="$1";;
    -x) shift;;
    -*) ;;
    *) in="$1";;
  esac
  shift
done
cat "$in" > "$out"
echo "note: compiled" >&2
"#;

    fn job(compiler: String, source: &[u8]) -> BuildJob {
        let mut invocation = Invocation::compile(CompilerId::new(compiler, "1.0"), "a.cc");
        invocation.other = vec!["-fsyntax-mode".into()];
        BuildJob {
            invocation,
            source: Arc::new(source.to_vec()),
        }
    }

    #[tokio::test]
    async fn successful_build_returns_object_and_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let compiler = fake_compiler(dir.path(), COPY_BODY);

        let backend = LocalBackend::new(None);
        let output = backend.run(&job(compiler, b"tu-bytes")).await.unwrap();

        assert!(output.succeeded());
        assert_eq!(output.object, b"tu-bytes");
        assert_eq!(output.stderr, b"note: compiled\n");
    }

    #[tokio::test]
    async fn failing_compiler_is_not_a_backend_error() {
        let dir = tempfile::tempdir().unwrap();
        let compiler = fake_compiler(dir.path(), "echo 'a.cc:1: error' >&2\nexit 1");

        let backend = LocalBackend::new(None);
        let output = backend.run(&job(compiler, b"x")).await.unwrap();

        assert_eq!(output.status, 1);
        assert!(output.object.is_empty());
        assert_eq!(output.stderr, b"a.cc:1: error\n");
    }

    #[tokio::test]
    async fn missing_compiler_is_spawn_error() {
        let backend = LocalBackend::new(None);
        let err = backend
            .run(&job("/nonexistent/compiler".into(), b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Spawn { .. }));
    }

    #[tokio::test]
    async fn wall_cap_kills_slow_build() {
        let dir = tempfile::tempdir().unwrap();
        let compiler = fake_compiler(dir.path(), "sleep 30");

        let backend = LocalBackend::new(Some(Duration::from_millis(50)));
        let err = backend.run(&job(compiler, b"x")).await.unwrap_err();
        assert!(matches!(err, BackendError::WallCapExceeded { cap_ms: 50 }));
    }
}
