//! Container runtime seam. The executor only ever talks to
//! [`ContainerRuntime`]; production uses [`DockerCliRuntime`], which drives
//! the `docker` CLI through spawned processes, and tests use the in-memory
//! stub from `test_support`.

use async_trait::async_trait;
use mfp_shared::{MfpError, MfpResult};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};

/// Where the compiled libraries appear inside the sandbox; the execution
/// prelude points `sys.path` here.
pub const COMPILED_MOUNT_PATH: &str = "/opt/mfp/compiled";

/// Cap on captured stdout (1 MiB) and stderr.
const MAX_STDOUT_BYTES: usize = 1_048_576;
const MAX_STDERR_BYTES: usize = 4096;

/// Launch parameters for one sandbox container. The hard resource limits of
/// the sandbox are not configurable per call; they are baked into the
/// runtime implementation.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub image: String,
    pub network: String,
    /// Credential env vars built by the vault. Never logged.
    pub env: HashMap<String, String>,
    /// Host directory bind-mounted read-only at [`COMPILED_MOUNT_PATH`].
    pub compiled_dir: PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct ContainerOutput {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

/// Result of waiting on a container. A timeout still carries whatever
/// partial output was captured before the deadline.
#[derive(Debug)]
pub enum WaitOutcome {
    Exited(ContainerOutput),
    TimedOut { stdout: String, stderr: String },
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create and start a container, write `payload` to its stdin, and close
    /// stdin. Returns the container id, exclusively owned by the caller.
    async fn launch(&self, spec: &ContainerSpec, payload: &str) -> MfpResult<String>;

    /// Wait up to `deadline` for the container to exit.
    async fn wait(&self, id: &str, deadline: Duration) -> MfpResult<WaitOutcome>;

    /// Force-stop a running container. Idempotent.
    async fn kill(&self, id: &str) -> MfpResult<()>;

    /// Remove the container and release all resources. Idempotent.
    async fn remove(&self, id: &str) -> MfpResult<()>;
}

/// Scoped ownership of one container. Every exit path (success, failure,
/// cancellation) ends in removal: explicitly via [`release`], or from
/// `Drop` through a detached cleanup task when the owning future is
/// cancelled mid-flight.
pub struct ContainerLease {
    runtime: Arc<dyn ContainerRuntime>,
    id: Option<String>,
}

impl ContainerLease {
    #[must_use]
    pub fn new(runtime: Arc<dyn ContainerRuntime>, id: String) -> Self {
        Self {
            runtime,
            id: Some(id),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        self.id.as_deref().unwrap_or_default()
    }

    /// Remove the container now.
    pub async fn release(mut self) {
        if let Some(id) = self.id.take() {
            if let Err(e) = self.runtime.remove(&id).await {
                tracing::warn!(container = %id, error = %e, "container removal failed");
            }
        }
    }
}

impl Drop for ContainerLease {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            let runtime = self.runtime.clone();
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        let _ = runtime.kill(&id).await;
                        if let Err(e) = runtime.remove(&id).await {
                            tracing::warn!(container = %id, error = %e, "deferred container removal failed");
                        }
                    });
                }
                Err(_) => {
                    tracing::warn!(container = %id, "no runtime available for container cleanup");
                }
            }
        }
    }
}

struct RunningContainer {
    child: Option<Child>,
    stdout_buf: Arc<std::sync::Mutex<String>>,
    stderr_buf: Arc<std::sync::Mutex<String>>,
    readers: Vec<JoinHandle<()>>,
}

/// Drives the `docker` CLI. One `docker run -i` child process per
/// container; output is drained by background reader tasks so partial
/// output survives a timeout kill.
#[derive(Default)]
pub struct DockerCliRuntime {
    running: Mutex<HashMap<String, RunningContainer>>,
}

impl DockerCliRuntime {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn spawn_reader(
    mut stream: impl AsyncReadExt + Unpin + Send + 'static,
    buf: Arc<std::sync::Mutex<String>>,
    cap: usize,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut chunk = [0u8; 4096];
        loop {
            match stream.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let mut locked = buf.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                    if locked.len() < cap {
                        let take = (cap - locked.len()).min(n);
                        locked.push_str(&String::from_utf8_lossy(&chunk[..take]));
                    }
                }
            }
        }
    })
}

fn snapshot(buf: &Arc<std::sync::Mutex<String>>) -> String {
    buf.lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .clone()
}

#[async_trait]
impl ContainerRuntime for DockerCliRuntime {
    async fn launch(&self, spec: &ContainerSpec, payload: &str) -> MfpResult<String> {
        let id = format!("mfp-exec-{}", uuid::Uuid::new_v4());
        let compiled = spec.compiled_dir.canonicalize().map_err(|e| {
            MfpError::Internal(format!(
                "Compiled directory {} is not accessible: {e}",
                spec.compiled_dir.display()
            ))
        })?;

        let mut cmd = Command::new("docker");
        cmd.arg("run")
            .args(["--name", &id])
            .arg("-i")
            .args(["--network", &spec.network])
            .args(["--memory", "256m", "--memory-swap", "256m"])
            .args(["--cpu-period", "100000", "--cpu-quota", "50000"])
            .args(["--security-opt", "no-new-privileges:true"])
            .arg("--read-only")
            .args(["--tmpfs", "/tmp:rw,size=64m,mode=1777"])
            .args(["--user", "1000:1000"])
            .args([
                "-v",
                &format!("{}:{}:ro", compiled.display(), COMPILED_MOUNT_PATH),
            ]);

        // Credentials travel through the docker client's own environment
        // (`-e KEY` without a value), never through argv.
        for key in spec.env.keys() {
            cmd.args(["-e", key]);
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        cmd.arg(&spec.image)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| MfpError::Internal(format!("Failed to spawn docker: {e}")))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| MfpError::Internal("Failed to open container stdin".into()))?;
        stdin
            .write_all(payload.as_bytes())
            .await
            .map_err(|e| MfpError::Internal(format!("Failed to send code to container: {e}")))?;
        stdin
            .shutdown()
            .await
            .map_err(|e| MfpError::Internal(format!("Failed to close container stdin: {e}")))?;
        drop(stdin);

        let stdout_buf = Arc::new(std::sync::Mutex::new(String::new()));
        let stderr_buf = Arc::new(std::sync::Mutex::new(String::new()));
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, stdout_buf.clone(), MAX_STDOUT_BYTES));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, stderr_buf.clone(), MAX_STDERR_BYTES));
        }

        tracing::debug!(container = %id, image = %spec.image, "container launched");
        self.running.lock().await.insert(
            id.clone(),
            RunningContainer {
                child: Some(child),
                stdout_buf,
                stderr_buf,
                readers,
            },
        );
        Ok(id)
    }

    async fn wait(&self, id: &str, deadline: Duration) -> MfpResult<WaitOutcome> {
        let (mut child, stdout_buf, stderr_buf) = {
            let mut running = self.running.lock().await;
            let entry = running
                .get_mut(id)
                .ok_or_else(|| MfpError::Internal(format!("Unknown container '{id}'")))?;
            let child = entry
                .child
                .take()
                .ok_or_else(|| MfpError::Internal(format!("Container '{id}' already waited")))?;
            (child, entry.stdout_buf.clone(), entry.stderr_buf.clone())
        };

        match timeout(deadline, child.wait()).await {
            Ok(Ok(status)) => {
                // Let the reader tasks drain to EOF before snapshotting.
                let readers = {
                    let mut running = self.running.lock().await;
                    running
                        .get_mut(id)
                        .map(|entry| std::mem::take(&mut entry.readers))
                        .unwrap_or_default()
                };
                for reader in readers {
                    let _ = reader.await;
                }
                Ok(WaitOutcome::Exited(ContainerOutput {
                    exit_code: i64::from(status.code().unwrap_or(1)),
                    stdout: snapshot(&stdout_buf),
                    stderr: snapshot(&stderr_buf),
                }))
            }
            Ok(Err(e)) => Err(MfpError::Internal(format!(
                "Failed waiting on container '{id}': {e}"
            ))),
            Err(_) => {
                // Timed out: hand the child back so remove() can reap it.
                let mut running = self.running.lock().await;
                if let Some(entry) = running.get_mut(id) {
                    entry.child = Some(child);
                }
                Ok(WaitOutcome::TimedOut {
                    stdout: snapshot(&stdout_buf),
                    stderr: snapshot(&stderr_buf),
                })
            }
        }
    }

    async fn kill(&self, id: &str) -> MfpResult<()> {
        let output = Command::new("docker")
            .args(["kill", id])
            .output()
            .await
            .map_err(|e| MfpError::Internal(format!("Failed to run docker kill: {e}")))?;
        if !output.status.success() {
            // Already exited or already gone; nothing to do.
            tracing::debug!(container = %id, "docker kill was a no-op");
        }
        Ok(())
    }

    async fn remove(&self, id: &str) -> MfpResult<()> {
        if let Some(mut entry) = self.running.lock().await.remove(id) {
            if let Some(mut child) = entry.child.take() {
                let _ = child.kill().await;
            }
            for reader in entry.readers {
                reader.abort();
            }
        }

        let output = Command::new("docker")
            .args(["rm", "-f", id])
            .output()
            .await
            .map_err(|e| MfpError::Internal(format!("Failed to run docker rm: {e}")))?;
        if !output.status.success() {
            tracing::debug!(container = %id, "docker rm was a no-op");
        }
        tracing::debug!(container = %id, "container removed");
        Ok(())
    }
}
