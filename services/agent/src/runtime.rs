//! Supervisor process launching.
//!
//! The container runloop never touches the OS process table directly; it
//! goes through the `Runtime` trait so the rest of the agent is testable
//! without spawning real processes. The production implementation launches
//! the `flotilla-supervisor` binary, which wraps the user process and
//! heartbeats back to the agent.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, warn};

use flotilla_api::Error;

use crate::logs::ContainerLog;

/// Everything a runtime needs to launch one container's supervisor.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub container_id: String,
    /// Working directory for the supervisor; holds the runtime descriptor.
    pub run_dir: PathBuf,
    /// Where the supervisor POSTs its heartbeats.
    pub heartbeat_url: String,
    /// Expanded user command.
    pub exec: Vec<String>,
}

/// A launched supervisor process.
#[derive(Debug, Clone, Copy, Default)]
pub struct SupervisorProc {
    pub pid: Option<u32>,
}

/// Seam between the container runloop and the OS.
#[async_trait]
pub trait Runtime: Send + Sync + 'static {
    /// Launch the supervising process for a container. Output lines go to
    /// the container's log buffer.
    async fn start_supervisor(
        &self,
        spec: &LaunchSpec,
        log: ContainerLog,
    ) -> Result<SupervisorProc, Error>;
}

/// Launches real `flotilla-supervisor` child processes.
pub struct ProcessRuntime {
    supervisor_bin: PathBuf,
}

impl ProcessRuntime {
    pub fn new() -> Self {
        Self {
            supervisor_bin: supervisor_binary(),
        }
    }
}

impl Default for ProcessRuntime {
    fn default() -> Self {
        Self::new()
    }
}

/// The supervisor binary ships beside the agent binary; fall back to PATH.
fn supervisor_binary() -> PathBuf {
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            let sibling = dir.join("flotilla-supervisor");
            if sibling.exists() {
                return sibling;
            }
        }
    }
    PathBuf::from("flotilla-supervisor")
}

#[async_trait]
impl Runtime for ProcessRuntime {
    async fn start_supervisor(
        &self,
        spec: &LaunchSpec,
        log: ContainerLog,
    ) -> Result<SupervisorProc, Error> {
        let mut command = tokio::process::Command::new(&self.supervisor_bin);
        command
            .args(&spec.exec)
            .env("FLOTILLA_HEARTBEAT_URL", &spec.heartbeat_url)
            .current_dir(&spec.run_dir)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        let mut child = command.spawn().map_err(|e| {
            Error::RuntimeFailure(format!("spawn supervisor for {}: {e}", spec.container_id))
        })?;

        let pid = child.id();

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, log.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, log));
        }

        // Reap the child whenever it exits; lifecycle decisions flow through
        // the heartbeat protocol, not the wait status.
        let container_id = spec.container_id.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => debug!(container_id = %container_id, %status, "supervisor exited"),
                Err(e) => warn!(container_id = %container_id, error = %e, "supervisor wait failed"),
            }
        });

        Ok(SupervisorProc { pid })
    }
}

async fn forward_lines<R>(reader: R, log: ContainerLog)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        log.add_line(line).await;
    }
}

/// Records launches instead of spawning processes. Test double.
#[derive(Default)]
pub struct MockRuntime {
    launches: std::sync::Mutex<Vec<LaunchSpec>>,
    /// When set, the next launch fails with this message.
    fail_with: std::sync::Mutex<Option<String>>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn launches(&self) -> Vec<LaunchSpec> {
        self.launches.lock().unwrap().clone()
    }

    pub fn fail_next(&self, message: &str) {
        *self.fail_with.lock().unwrap() = Some(message.to_string());
    }
}

#[async_trait]
impl Runtime for MockRuntime {
    async fn start_supervisor(
        &self,
        spec: &LaunchSpec,
        _log: ContainerLog,
    ) -> Result<SupervisorProc, Error> {
        if let Some(message) = self.fail_with.lock().unwrap().take() {
            return Err(Error::RuntimeFailure(message));
        }
        self.launches.lock().unwrap().push(spec.clone());
        Ok(SupervisorProc { pid: None })
    }
}

/// Artifact store double that provisions an empty rootfs directory.
pub struct NullArtifactStore {
    root: PathBuf,
}

impl NullArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl crate::artifact::ArtifactStore for NullArtifactStore {
    async fn fetch(&self, _artifact_url: &str) -> Result<PathBuf, Error> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| Error::RuntimeFailure(format!("mkdir {}: {e}", self.root.display())))?;
        Ok(self.root.clone())
    }
}
