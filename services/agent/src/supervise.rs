//! The supervising side of the heartbeat protocol.
//!
//! `flotilla-supervisor` is launched by the agent, one per container, with
//! the container's run directory as its working directory. It starts the
//! user process described by `container.json`, heartbeats the agent every
//! interval, and maps advisories to signals: DOWN is a SIGTERM, EXIT a
//! SIGKILL. It never acts unilaterally on a failed heartbeat, because
//! stale advice is worse than no advice.
//!
//! Exit policy: a non-zero exit while the agent wants the process up is
//! restarted after a short back-off; exit zero ends supervision. On the way
//! out the supervisor keeps sending EXITING heartbeats until the agent
//! acknowledges with EXIT, so the two sides never disagree about the end of
//! a container's life.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tracing::{debug, info, warn};

use flotilla_api::{Advisory, Heartbeat, HeartbeatReply, ProcessMetrics, ProcessStatus, ReportedStatus};

use crate::container::ContainerDescriptor;

pub struct SupervisorConfig {
    /// Where heartbeats are POSTed.
    pub heartbeat_url: String,
    /// The runtime descriptor written by the agent at create time.
    pub descriptor_path: PathBuf,
    pub heartbeat_interval: Duration,
    pub restart_backoff: Duration,
}

impl SupervisorConfig {
    pub fn from_env() -> Result<Self> {
        let heartbeat_url = std::env::var("FLOTILLA_HEARTBEAT_URL")
            .context("FLOTILLA_HEARTBEAT_URL not set")?;
        Ok(Self {
            heartbeat_url,
            descriptor_path: PathBuf::from("./container.json"),
            heartbeat_interval: Duration::from_secs(3),
            restart_backoff: Duration::from_secs(1),
        })
    }
}

/// Run supervision to completion. Returns once the agent has acknowledged
/// the final EXITING heartbeat.
pub async fn run(config: SupervisorConfig) -> Result<()> {
    let client = reqwest::Client::new();
    let mut metrics = ProcessMetrics::default();
    let mut last_status = ProcessStatus::default();
    let mut startup_err = String::new();

    match load_descriptor(&config.descriptor_path) {
        Ok(descriptor) => {
            info!(container_id = %descriptor.container_id, "supervising");
            if let Err(e) = supervise(&client, &config, &descriptor, &mut metrics, &mut last_status).await {
                startup_err = e.to_string();
            }
        }
        Err(e) => {
            startup_err = e.to_string();
        }
    }

    // The container is done; stay until the agent agrees.
    sync_exit(&client, &config, last_status, startup_err).await;
    Ok(())
}

fn load_descriptor(path: &std::path::Path) -> Result<ContainerDescriptor> {
    let body = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_slice(&body).with_context(|| format!("decode {}", path.display()))
}

/// The restart loop: one iteration per user-process lifetime.
async fn supervise(
    client: &reqwest::Client,
    config: &SupervisorConfig,
    descriptor: &ContainerDescriptor,
    metrics: &mut ProcessMetrics,
    last_status: &mut ProcessStatus,
) -> Result<()> {
    metrics.memory_limit = descriptor.memory_limit_mb * 1024 * 1024;
    let mut desired: Option<Advisory> = None;

    loop {
        let mut child = spawn_user_process(descriptor)?;
        let pid = child.id();

        let mut ticker = tokio::time::interval(config.heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let wait_status = loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Some(pid) = pid {
                        update_metrics(pid, metrics);
                    }
                    let status = ProcessStatus {
                        up: true,
                        metrics: *metrics,
                        ..Default::default()
                    };
                    *last_status = status.clone();

                    match send_heartbeat(client, &config.heartbeat_url, ReportedStatus::Up, String::new(), status).await {
                        Ok(reply) => {
                            desired = Some(reply.want);
                            match reply.want {
                                Advisory::Down => signal_child(pid, Signal::SIGTERM),
                                Advisory::Exit => signal_child(pid, Signal::SIGKILL),
                                Advisory::Up | Advisory::Unknown => {}
                            }
                        }
                        Err(e) => {
                            // Never act on stale advice; just try again next tick.
                            warn!(error = %e, "heartbeat failed");
                        }
                    }
                }
                exited = child.wait() => {
                    break exited.context("wait on user process")?;
                }
            }
        };

        let status = wait_status_to_process_status(wait_status, *metrics);
        *last_status = status.clone();
        debug!(?status, "user process exited");

        // Asked to come down, or a clean exit: supervision ends.
        if matches!(desired, Some(Advisory::Down | Advisory::Exit)) {
            return Ok(());
        }
        if status.exited && status.exit_status == 0 {
            return Ok(());
        }

        tokio::time::sleep(config.restart_backoff).await;
        metrics.restarts += 1;
        info!(restarts = metrics.restarts, "restarting user process");
    }
}

fn spawn_user_process(descriptor: &ContainerDescriptor) -> Result<tokio::process::Child> {
    let (program, args) = descriptor
        .exec
        .split_first()
        .context("descriptor exec is empty")?;

    let mut command = tokio::process::Command::new(program);
    command.args(args).envs(&descriptor.env);
    if !descriptor.working_dir.is_empty() {
        command.current_dir(&descriptor.working_dir);
    }

    command
        .spawn()
        .with_context(|| format!("spawn user process {program:?}"))
}

fn signal_child(pid: Option<u32>, sig: Signal) {
    let Some(pid) = pid else { return };
    if let Err(e) = signal::kill(Pid::from_raw(pid as i32), sig) {
        warn!(pid, signal = %sig, error = %e, "signal failed");
    }
}

fn wait_status_to_process_status(
    wait: std::process::ExitStatus,
    metrics: ProcessMetrics,
) -> ProcessStatus {
    use std::os::unix::process::ExitStatusExt;

    match wait.code() {
        Some(code) => ProcessStatus {
            exited: true,
            exit_status: code,
            metrics,
            ..Default::default()
        },
        None => ProcessStatus {
            signaled: true,
            signal: wait.signal().unwrap_or_default(),
            metrics,
            ..Default::default()
        },
    }
}

/// Keep reporting EXITING until the agent answers EXIT. Transport failures
/// back off and retry; the agent may be restarting.
async fn sync_exit(
    client: &reqwest::Client,
    config: &SupervisorConfig,
    last_status: ProcessStatus,
    err: String,
) {
    loop {
        match send_heartbeat(
            client,
            &config.heartbeat_url,
            ReportedStatus::Exiting,
            err.clone(),
            last_status.clone(),
        )
        .await
        {
            Ok(reply) if reply.want == Advisory::Exit => return,
            Ok(reply) => debug!(want = %reply.want, "waiting for exit acknowledgement"),
            Err(e) => warn!(error = %e, "unable to reach host agent"),
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

async fn send_heartbeat(
    client: &reqwest::Client,
    url: &str,
    status: ReportedStatus,
    err: String,
    container_status: ProcessStatus,
) -> Result<HeartbeatReply> {
    let heartbeat = Heartbeat {
        status,
        err,
        timestamp: Utc::now(),
        container_status,
    };

    let response = client
        .post(url)
        .json(&heartbeat)
        .timeout(Duration::from_secs(5))
        .send()
        .await?;

    if !response.status().is_success() {
        anyhow::bail!("heartbeat failed with status {}", response.status());
    }

    Ok(response.json().await?)
}

/// Resident memory and CPU time from procfs; best effort.
fn update_metrics(pid: u32, metrics: &mut ProcessMetrics) {
    if let Ok(statm) = std::fs::read_to_string(format!("/proc/{pid}/statm")) {
        if let Some(resident_pages) = statm
            .split_whitespace()
            .nth(1)
            .and_then(|f| f.parse::<u64>().ok())
        {
            metrics.memory_usage = resident_pages * 4096;
        }
    }

    if let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        // Fields after the parenthesised command name; utime and stime are
        // the 14th and 15th fields overall.
        if let Some(after_comm) = stat.rsplit_once(") ").map(|(_, rest)| rest) {
            let fields: Vec<&str> = after_comm.split_whitespace().collect();
            let utime = fields.get(11).and_then(|f| f.parse::<u64>().ok());
            let stime = fields.get(12).and_then(|f| f.parse::<u64>().ok());
            if let (Some(u), Some(s)) = (utime, stime) {
                metrics.cpu_time = u + s;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_status_maps_exit_code() {
        use std::os::unix::process::ExitStatusExt;
        let status = std::process::ExitStatus::from_raw(0x0100); // exit(1)
        let ps = wait_status_to_process_status(status, ProcessMetrics::default());
        assert!(ps.exited);
        assert_eq!(ps.exit_status, 1);
        assert!(!ps.signaled);
    }

    #[test]
    fn wait_status_maps_signal() {
        use std::os::unix::process::ExitStatusExt;
        let status = std::process::ExitStatus::from_raw(9); // killed by SIGKILL
        let ps = wait_status_to_process_status(status, ProcessMetrics::default());
        assert!(ps.signaled);
        assert_eq!(ps.signal, 9);
        assert!(!ps.exited);
    }
}
