//! The per-container state machine.
//!
//! One runloop per container owns every piece of mutable state: status,
//! heartbeat desire, subscriber set, and the supervisor handle. All
//! operations arrive as messages on the inbox and are processed one at a
//! time, so no interleaving between a heartbeat, a user action, and a
//! destroy needs reasoning about.
//!
//! ## Lifecycle
//!
//! ```text
//! PUT -> starting -> (create, start) -> running -> finished | failed
//!                                                      |
//!                                            DELETE -> deleted (event only)
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use flotilla_api::{
    Advisory, ContainerConfig, ContainerInstance, ContainerStatus, Error, Heartbeat,
    ReportedStatus,
};

use crate::artifact::ArtifactStore;
use crate::logs::ContainerLog;
use crate::ports;
use crate::runtime::{LaunchSpec, Runtime};

/// Shared construction context for containers: filesystem roots and the
/// seams to the outside world.
pub struct ContainerContext {
    pub artifacts: Arc<dyn ArtifactStore>,
    pub runtime: Arc<dyn Runtime>,
    pub run_root: PathBuf,
    pub log_root: PathBuf,
    /// Address supervisors use to reach this agent.
    pub advertised_addr: String,
    pub log_buffer_lines: usize,
    /// Padding added to every stop deadline so the supervisor observes at
    /// least one DOWN advisory before escalation.
    pub heartbeat_interval: Duration,
}

/// What the agent wants from a container's supervisor. Unset until the
/// first start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Desired {
    Up,
    Down,
    Exit,
}

/// The runtime descriptor written into the run directory for the
/// supervisor to pick up.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct ContainerDescriptor {
    pub container_id: String,
    pub exec: Vec<String>,
    pub working_dir: String,
    pub env: std::collections::BTreeMap<String, String>,
    pub ports: std::collections::BTreeMap<String, u16>,
    pub memory_limit_mb: u64,
}

enum Msg {
    Create {
        reply: oneshot::Sender<Result<(), Error>>,
    },
    Start {
        reply: oneshot::Sender<Result<(), Error>>,
    },
    Stop {
        timeout: Duration,
        reply: oneshot::Sender<()>,
    },
    Restart {
        reply: oneshot::Sender<Result<(), Error>>,
    },
    Destroy {
        reply: oneshot::Sender<Result<(), Error>>,
    },
    Heartbeat {
        heartbeat: Heartbeat,
        reply: oneshot::Sender<Advisory>,
    },
    Subscribe {
        sink: mpsc::Sender<ContainerInstance>,
        reply: oneshot::Sender<u64>,
    },
    Unsubscribe(u64),
    Instance {
        reply: oneshot::Sender<ContainerInstance>,
    },
}

/// Handle to one container's runloop. Cloneable; the runloop ends when the
/// container is destroyed.
#[derive(Clone)]
pub struct Container {
    id: String,
    tx: mpsc::Sender<Msg>,
    log: ContainerLog,
}

impl Container {
    /// Spawn the runloop for a new container in status `starting`.
    pub fn new(id: impl Into<String>, config: ContainerConfig, ctx: Arc<ContainerContext>) -> Self {
        let id = id.into();
        let log = ContainerLog::new(ctx.log_buffer_lines);
        let (tx, rx) = mpsc::channel(64);

        let actor = ContainerActor {
            instance: ContainerInstance {
                id: id.clone(),
                status: ContainerStatus::Starting,
                config,
            },
            desired: None,
            down_deadline: None,
            subscribers: HashMap::new(),
            next_subscription: 1,
            dropped_events: 0,
            log: log.clone(),
            ctx,
        };
        tokio::spawn(actor.run(rx));

        Self { id, tx, log }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn log(&self) -> &ContainerLog {
        &self.log
    }

    /// Fetch the artifact, provision directories and ports, and write the
    /// runtime descriptor.
    pub async fn create(&self) -> Result<(), Error> {
        self.request(|reply| Msg::Create { reply }).await?
    }

    /// Launch the supervising process and mark the container running.
    pub async fn start(&self) -> Result<(), Error> {
        self.request(|reply| Msg::Start { reply }).await?
    }

    /// Ask the container to come down within `timeout`. Never kills
    /// synchronously; escalation flows through the heartbeat replies.
    pub async fn stop(&self, timeout: Duration) {
        let _ = self.request(|reply| Msg::Stop { timeout, reply }).await;
    }

    /// Relaunch a container that is not running.
    pub async fn restart(&self) -> Result<(), Error> {
        self.request(|reply| Msg::Restart { reply }).await?
    }

    /// Tear the container down. Rejected while running.
    pub async fn destroy(&self) -> Result<(), Error> {
        self.request(|reply| Msg::Destroy { reply }).await?
    }

    /// Answer a supervisor heartbeat. A closed runloop answers EXIT so
    /// orphaned supervisors terminate themselves.
    pub async fn heartbeat(&self, heartbeat: Heartbeat) -> Advisory {
        self.request(|reply| Msg::Heartbeat { heartbeat, reply })
            .await
            .unwrap_or(Advisory::Exit)
    }

    /// Register a sink for subsequent status changes. Best-effort: a sink
    /// that is not ready misses events.
    pub async fn subscribe(&self, sink: mpsc::Sender<ContainerInstance>) -> Result<u64, Error> {
        self.request(|reply| Msg::Subscribe { sink, reply }).await
    }

    pub async fn unsubscribe(&self, subscription: u64) {
        let _ = self.tx.send(Msg::Unsubscribe(subscription)).await;
    }

    /// Snapshot of the current instance state.
    pub async fn instance(&self) -> Result<ContainerInstance, Error> {
        self.request(|reply| Msg::Instance { reply }).await
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Msg) -> Result<T, Error> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| Error::NotFound(format!("container {} runloop stopped", self.id)))?;
        rx.await
            .map_err(|_| Error::NotFound(format!("container {} runloop stopped", self.id)))
    }
}

struct ContainerActor {
    instance: ContainerInstance,
    desired: Option<Desired>,
    down_deadline: Option<Instant>,
    subscribers: HashMap<u64, mpsc::Sender<ContainerInstance>>,
    next_subscription: u64,
    dropped_events: u64,
    log: ContainerLog,
    ctx: Arc<ContainerContext>,
}

impl ContainerActor {
    async fn run(mut self, mut rx: mpsc::Receiver<Msg>) {
        while let Some(msg) = rx.recv().await {
            match msg {
                Msg::Create { reply } => {
                    let result = self.create().await;
                    if let Err(e) = &result {
                        warn!(container_id = %self.instance.id, error = %e, "create failed");
                        self.set_status(ContainerStatus::Failed);
                    }
                    let _ = reply.send(result);
                }
                Msg::Start { reply } => {
                    let _ = reply.send(self.start().await);
                }
                Msg::Stop { timeout, reply } => {
                    self.desired = Some(Desired::Down);
                    self.down_deadline =
                        Some(Instant::now() + timeout + self.ctx.heartbeat_interval);
                    info!(
                        container_id = %self.instance.id,
                        timeout_secs = timeout.as_secs(),
                        "stop requested"
                    );
                    let _ = reply.send(());
                }
                Msg::Restart { reply } => {
                    let _ = reply.send(self.start().await);
                }
                Msg::Destroy { reply } => {
                    let result = self.destroy().await;
                    let stopping = result.is_ok();
                    let _ = reply.send(result);
                    if stopping {
                        break;
                    }
                }
                Msg::Heartbeat { heartbeat, reply } => {
                    let _ = reply.send(self.heartbeat(&heartbeat));
                }
                Msg::Subscribe { sink, reply } => {
                    let id = self.next_subscription;
                    self.next_subscription += 1;
                    self.subscribers.insert(id, sink);
                    let _ = reply.send(id);
                }
                Msg::Unsubscribe(id) => {
                    self.subscribers.remove(&id);
                }
                Msg::Instance { reply } => {
                    let _ = reply.send(self.instance.clone());
                }
            }
        }
    }

    /// The heartbeat protocol table. The reply is a pure function of
    /// (desired, reported); the only side effect is the transition to
    /// `finished` when the supervisor reports EXITING.
    fn heartbeat(&mut self, heartbeat: &Heartbeat) -> Advisory {
        match (self.desired, heartbeat.status) {
            (Some(Desired::Up), ReportedStatus::Up) => Advisory::Up,
            (Some(Desired::Down), ReportedStatus::Up) => {
                match self.down_deadline {
                    Some(deadline) if Instant::now() > deadline => Advisory::Exit,
                    _ => Advisory::Down,
                }
            }
            (Some(Desired::Exit), ReportedStatus::Up) => Advisory::Exit,
            (Some(_), ReportedStatus::Exiting) => {
                self.desired = Some(Desired::Exit);
                self.set_status(ContainerStatus::Finished);
                Advisory::Exit
            }
            (None, _) => Advisory::Unknown,
        }
    }

    async fn create(&mut self) -> Result<(), Error> {
        let id = &self.instance.id;
        let run_dir = self.ctx.run_root.join(id);
        let log_dir = self.ctx.log_root.join(id);

        for dir in [&run_dir, &log_dir] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| Error::RuntimeFailure(format!("mkdir {}: {e}", dir.display())))?;
        }

        let rootfs = self
            .ctx
            .artifacts
            .fetch(&self.instance.config.artifact_url)
            .await?;

        symlink_if_absent(&rootfs, &run_dir.join("rootfs")).await?;
        symlink_if_absent(&log_dir, &run_dir.join("log")).await?;

        // Allocate requested ports and materialise them into the
        // environment as PORT_<NAME>.
        let config = &mut self.instance.config;
        let port_names: Vec<String> = config.ports.keys().cloned().collect();
        for name in port_names {
            let port = match config.ports[&name] {
                0 => ports::next_port(),
                fixed => fixed,
            };
            config.ports.insert(name.clone(), port);
            config
                .env
                .insert(format!("PORT_{}", name.to_uppercase()), port.to_string());
        }

        let exec: Vec<String> = config
            .command
            .exec
            .iter()
            .map(|arg| expand_vars(arg, &config.env))
            .collect();

        let descriptor = ContainerDescriptor {
            container_id: id.clone(),
            exec,
            working_dir: config.command.working_dir.clone(),
            env: config.env.clone(),
            ports: config.ports.clone(),
            memory_limit_mb: config.resources.mem,
        };
        let descriptor_path = run_dir.join("container.json");
        let body = serde_json::to_vec_pretty(&descriptor)
            .map_err(|e| Error::RuntimeFailure(format!("encode descriptor: {e}")))?;
        tokio::fs::write(&descriptor_path, body)
            .await
            .map_err(|e| Error::RuntimeFailure(format!("write {}: {e}", descriptor_path.display())))?;

        info!(container_id = %id, rootfs = %rootfs.display(), "container created");
        Ok(())
    }

    async fn start(&mut self) -> Result<(), Error> {
        if self.instance.status == ContainerStatus::Running {
            return Err(Error::Conflict(format!(
                "container {} is running",
                self.instance.id
            )));
        }

        let descriptor_exec = self.descriptor_exec().await?;
        let spec = LaunchSpec {
            container_id: self.instance.id.clone(),
            run_dir: self.ctx.run_root.join(&self.instance.id),
            heartbeat_url: format!(
                "http://{}/api/v0/containers/{}/heartbeat",
                self.ctx.advertised_addr, self.instance.id
            ),
            exec: descriptor_exec,
        };

        self.desired = Some(Desired::Up);
        self.down_deadline = None;

        match self.ctx.runtime.start_supervisor(&spec, self.log.clone()).await {
            Ok(proc) => {
                info!(
                    container_id = %self.instance.id,
                    pid = ?proc.pid,
                    "supervisor started"
                );
                self.set_status(ContainerStatus::Running);
                Ok(())
            }
            Err(e) => {
                warn!(container_id = %self.instance.id, error = %e, "start failed");
                self.set_status(ContainerStatus::Failed);
                Err(e)
            }
        }
    }

    /// The expanded command, as written by create. Falls back to the raw
    /// config when the descriptor is missing (start without create).
    async fn descriptor_exec(&self) -> Result<Vec<String>, Error> {
        let path = self.ctx.run_root.join(&self.instance.id).join("container.json");
        match tokio::fs::read(&path).await {
            Ok(body) => {
                let descriptor: ContainerDescriptor = serde_json::from_slice(&body)
                    .map_err(|e| Error::RuntimeFailure(format!("decode {}: {e}", path.display())))?;
                Ok(descriptor.exec)
            }
            Err(_) => Ok(self.instance.config.command.exec.clone()),
        }
    }

    async fn destroy(&mut self) -> Result<(), Error> {
        if self.instance.status == ContainerStatus::Running {
            return Err(Error::Conflict(format!(
                "container {} is running",
                self.instance.id
            )));
        }

        let run_dir = self.ctx.run_root.join(&self.instance.id);
        if let Err(e) = tokio::fs::remove_dir_all(&run_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(Error::RuntimeFailure(format!(
                    "remove {}: {e}",
                    run_dir.display()
                )));
            }
        }

        self.set_status(ContainerStatus::Deleted);
        self.subscribers.clear();
        self.log.exit().await;
        info!(container_id = %self.instance.id, "container destroyed");
        Ok(())
    }

    fn set_status(&mut self, status: ContainerStatus) {
        if self.instance.status == status {
            return;
        }
        self.instance.status = status;
        self.broadcast();
    }

    /// Push the current instance to every subscriber; a sink that is not
    /// ready misses the event and never blocks another sink.
    fn broadcast(&mut self) {
        let instance = self.instance.clone();
        let dropped = &mut self.dropped_events;
        self.subscribers.retain(|_, sink| {
            match sink.try_send(instance.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    *dropped += 1;
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }
}

async fn symlink_if_absent(original: &std::path::Path, link: &std::path::Path) -> Result<(), Error> {
    match tokio::fs::symlink(original, link).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(Error::RuntimeFailure(format!(
            "symlink {}: {e}",
            link.display()
        ))),
    }
}

/// Expand `${VAR}` references against the container environment. Unknown
/// variables expand to the empty string.
fn expand_vars(arg: &str, env: &std::collections::BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(arg.len());
    let mut rest = arg;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        match rest[start + 2..].find('}') {
            Some(end) => {
                let name = &rest[start + 2..start + 2 + end];
                if let Some(value) = env.get(name) {
                    out.push_str(value);
                }
                rest = &rest[start + 2 + end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use chrono::Utc;
    use flotilla_api::{Command, Grace, ProcessStatus, ResourceLimits};

    use crate::runtime::{MockRuntime, NullArtifactStore};

    fn test_config() -> ContainerConfig {
        ContainerConfig {
            job_name: "site".to_string(),
            task_name: "web".to_string(),
            artifact_url: "http://artifacts.internal/site/web.tar.gz".to_string(),
            ports: BTreeMap::from([("http".to_string(), 0)]),
            env: BTreeMap::from([("MODE".to_string(), "prod".to_string())]),
            command: Command {
                working_dir: "/srv".to_string(),
                exec: vec!["./web".to_string(), "--port=${PORT_HTTP}".to_string()],
            },
            resources: ResourceLimits { mem: 64, cpus: 0.5 },
            storage: Default::default(),
            grace: Grace {
                startup: 2,
                shutdown: 2,
            },
        }
    }

    fn test_context(
        root: &std::path::Path,
        runtime: Arc<dyn Runtime>,
    ) -> Arc<ContainerContext> {
        Arc::new(ContainerContext {
            artifacts: Arc::new(NullArtifactStore::new(root.join("rootfs"))),
            runtime,
            run_root: root.join("run"),
            log_root: root.join("log"),
            advertised_addr: "127.0.0.1:3333".to_string(),
            log_buffer_lines: 64,
            heartbeat_interval: Duration::ZERO,
        })
    }

    fn heartbeat(status: ReportedStatus) -> Heartbeat {
        Heartbeat {
            status,
            err: String::new(),
            timestamp: Utc::now(),
            container_status: ProcessStatus::default(),
        }
    }

    #[tokio::test]
    async fn create_allocates_ports_and_expands_command() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(MockRuntime::new());
        let ctx = test_context(dir.path(), runtime.clone());
        let container = Container::new("site-x:web-y:0", test_config(), ctx);

        container.create().await.unwrap();

        let instance = container.instance().await.unwrap();
        let port = instance.config.ports["http"];
        assert!(port >= ports::PORT_RANGE_START);
        assert_eq!(instance.config.env["PORT_HTTP"], port.to_string());

        let descriptor: ContainerDescriptor = serde_json::from_slice(
            &std::fs::read(dir.path().join("run/site-x:web-y:0/container.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(descriptor.exec[1], format!("--port={port}"));

        container.start().await.unwrap();
        let launches = runtime.launches();
        assert_eq!(launches.len(), 1);
        assert_eq!(launches[0].exec[1], format!("--port={port}"));
        assert!(launches[0]
            .heartbeat_url
            .ends_with("/api/v0/containers/site-x:web-y:0/heartbeat"));
    }

    #[tokio::test]
    async fn heartbeat_reply_follows_the_protocol_table() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path(), Arc::new(MockRuntime::new()));
        let container = Container::new("c1", test_config(), ctx);

        // Before any start, desired is unset.
        assert_eq!(
            container.heartbeat(heartbeat(ReportedStatus::Up)).await,
            Advisory::Unknown
        );

        container.create().await.unwrap();
        container.start().await.unwrap();

        // desired UP
        assert_eq!(
            container.heartbeat(heartbeat(ReportedStatus::Up)).await,
            Advisory::Up
        );

        // desired DOWN, within the deadline window
        container.stop(Duration::from_secs(60)).await;
        assert_eq!(
            container.heartbeat(heartbeat(ReportedStatus::Up)).await,
            Advisory::Down
        );

        // EXITING always acknowledges with EXIT and finishes the container.
        assert_eq!(
            container.heartbeat(heartbeat(ReportedStatus::Exiting)).await,
            Advisory::Exit
        );
        let instance = container.instance().await.unwrap();
        assert_eq!(instance.status, ContainerStatus::Finished);

        // desired is EXIT from here on.
        assert_eq!(
            container.heartbeat(heartbeat(ReportedStatus::Up)).await,
            Advisory::Exit
        );
    }

    #[tokio::test]
    async fn down_past_deadline_escalates_to_exit() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path(), Arc::new(MockRuntime::new()));
        let container = Container::new("c2", test_config(), ctx);

        container.create().await.unwrap();
        container.start().await.unwrap();

        // Zero timeout and zero interval padding: the deadline is already
        // in the past by the time the heartbeat arrives.
        container.stop(Duration::ZERO).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(
            container.heartbeat(heartbeat(ReportedStatus::Up)).await,
            Advisory::Exit
        );
    }

    #[tokio::test]
    async fn destroy_is_rejected_while_running() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path(), Arc::new(MockRuntime::new()));
        let container = Container::new("c3", test_config(), ctx);

        container.create().await.unwrap();
        container.start().await.unwrap();
        assert!(matches!(
            container.destroy().await,
            Err(Error::Conflict(_))
        ));

        // Finish it via the heartbeat protocol, then destroy.
        container.heartbeat(heartbeat(ReportedStatus::Exiting)).await;
        container.destroy().await.unwrap();

        // The runloop is gone: subsequent operations report not-found.
        assert!(matches!(
            container.instance().await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn destroy_emits_deleted_and_releases_subscribers() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path(), Arc::new(MockRuntime::new()));
        let container = Container::new("c4", test_config(), ctx);

        let (sink, mut events) = mpsc::channel(8);
        container.subscribe(sink).await.unwrap();

        container.create().await.unwrap();
        container.destroy().await.unwrap();

        let event = events.recv().await.unwrap();
        assert_eq!(event.status, ContainerStatus::Deleted);
        // Subscribers are released on destroy.
        assert!(events.recv().await.is_none());
    }

    #[tokio::test]
    async fn failed_start_marks_the_container_failed() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(MockRuntime::new());
        let ctx = test_context(dir.path(), runtime.clone());
        let container = Container::new("c5", test_config(), ctx);

        container.create().await.unwrap();
        runtime.fail_next("no such binary");
        assert!(container.start().await.is_err());

        let instance = container.instance().await.unwrap();
        assert_eq!(instance.status, ContainerStatus::Failed);
    }

    #[tokio::test]
    async fn full_subscriber_misses_events_without_blocking() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path(), Arc::new(MockRuntime::new()));
        let container = Container::new("c6", test_config(), ctx);

        let (ready, mut ready_rx) = mpsc::channel(4);
        let (full, full_rx) = mpsc::channel(1);
        full.send(ContainerInstance {
            id: "filler".to_string(),
            status: ContainerStatus::Starting,
            config: ContainerConfig::default(),
        })
        .await
        .unwrap();

        container.subscribe(ready).await.unwrap();
        container.subscribe(full).await.unwrap();

        container.create().await.unwrap();
        container.start().await.unwrap();

        let event = ready_rx.recv().await.unwrap();
        assert_eq!(event.status, ContainerStatus::Running);
        drop(full_rx);
    }

    #[test]
    fn expand_vars_handles_known_unknown_and_unterminated() {
        let env = BTreeMap::from([("PORT_HTTP".to_string(), "30000".to_string())]);
        assert_eq!(expand_vars("--port=${PORT_HTTP}", &env), "--port=30000");
        assert_eq!(expand_vars("${MISSING}x", &env), "x");
        assert_eq!(expand_vars("plain", &env), "plain");
        assert_eq!(expand_vars("${UNTERMINATED", &env), "${UNTERMINATED");
    }
}
