//! Agent configuration, loaded from the environment.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;

/// Interval at which supervisors heartbeat their parent agent. The down
/// deadline handed out by Stop is padded by one interval so a supervisor
/// always sees at least one DOWN advisory before escalation.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(3);

#[derive(Debug, Clone)]
pub struct Config {
    /// Address the HTTP API binds to.
    pub listen_addr: SocketAddr,

    /// Address supervisors use to reach this agent, e.g. "127.0.0.1:3333".
    /// Baked into each container's heartbeat URL at start.
    pub advertised_addr: String,

    /// UDP port for the container log ingest.
    pub log_udp_port: u16,

    /// Per-container run directories live under here.
    pub run_root: PathBuf,

    /// Per-container log directories live under here.
    pub log_root: PathBuf,

    /// Extracted artifacts are cached under here.
    pub artifact_root: PathBuf,

    /// Ring buffer capacity per container log.
    pub log_buffer_lines: usize,

    /// Host memory advertised to the scheduler, in MB.
    pub total_mem_mb: f64,

    /// Host CPUs advertised to the scheduler.
    pub total_cpus: f64,

    /// Host volume paths containers may bind-mount.
    pub volumes: Vec<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let listen_addr = std::env::var("FLOTILLA_AGENT_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:3333".to_string())
            .parse()?;

        let advertised_addr =
            std::env::var("FLOTILLA_AGENT_ADVERTISED").unwrap_or_else(|_| "127.0.0.1:3333".to_string());

        let log_udp_port = std::env::var("FLOTILLA_LOG_UDP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(3334);

        let run_root = std::env::var("FLOTILLA_RUN_ROOT")
            .unwrap_or_else(|_| "/run/flotilla".to_string())
            .into();

        let log_root = std::env::var("FLOTILLA_LOG_ROOT")
            .unwrap_or_else(|_| "/srv/flotilla/log".to_string())
            .into();

        let artifact_root = std::env::var("FLOTILLA_ARTIFACT_ROOT")
            .unwrap_or_else(|_| "/srv/flotilla/artifacts".to_string())
            .into();

        let log_buffer_lines = std::env::var("FLOTILLA_LOG_BUFFER_LINES")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(10_000);

        let total_mem_mb = std::env::var("FLOTILLA_TOTAL_MEM_MB")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(resources_detect_mem_mb);

        let total_cpus = std::env::var("FLOTILLA_TOTAL_CPUS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(resources_detect_cpus);

        let volumes = std::env::var("FLOTILLA_VOLUMES")
            .map(|s| {
                s.split(',')
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            listen_addr,
            advertised_addr,
            log_udp_port,
            run_root,
            log_root,
            artifact_root,
            log_buffer_lines,
            total_mem_mb,
            total_cpus,
            volumes,
        })
    }
}

fn resources_detect_cpus() -> f64 {
    std::thread::available_parallelism()
        .map(|n| n.get() as f64)
        .unwrap_or(1.0)
}

fn resources_detect_mem_mb() -> f64 {
    // MemTotal from /proc/meminfo, in kB.
    let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") else {
        return 1024.0;
    };
    meminfo
        .lines()
        .find(|l| l.starts_with("MemTotal:"))
        .and_then(|l| l.split_whitespace().nth(1))
        .and_then(|kb| kb.parse::<f64>().ok())
        .map(|kb| kb / 1024.0)
        .unwrap_or(1024.0)
}
