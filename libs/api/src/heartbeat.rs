//! The heartbeat protocol between a container supervisor and its agent.
//!
//! The supervisor reports its view every interval; the agent answers with
//! the advisory the supervisor should act on. All kill escalation flows
//! through these replies; the agent never signals the child directly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What the supervisor reports about itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ReportedStatus {
    /// The user process is up (or being restarted).
    Up,
    /// The supervisor is on its way out and will not restart the process.
    Exiting,
}

/// What the agent wants the supervisor to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Advisory {
    /// Keep the process running.
    Up,
    /// Shut the process down gracefully (SIGTERM).
    Down,
    /// Kill the process and exit (SIGKILL).
    Exit,
    /// The (desired, reported) pair is outside the protocol table.
    Unknown,
}

impl std::fmt::Display for Advisory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Advisory::Up => write!(f, "UP"),
            Advisory::Down => write!(f, "DOWN"),
            Advisory::Exit => write!(f, "EXIT"),
            Advisory::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// One heartbeat, POSTed by the supervisor every interval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub status: ReportedStatus,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub err: String,

    pub timestamp: DateTime<Utc>,

    pub container_status: ProcessStatus,
}

/// The agent's answer to a heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatReply {
    pub want: Advisory,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub err: String,
}

/// Wait-status and telemetry for the supervised user process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessStatus {
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub up: bool,

    /// True when the process exited on its own or in response to a signal
    /// it handled; `exit_status` is meaningful when set.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub exited: bool,
    #[serde(default)]
    pub exit_status: i32,

    /// True when the process was killed by a signal; `signal` is meaningful
    /// when set.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub signaled: bool,
    #[serde(default)]
    pub signal: i32,

    /// True if the process was killed for exceeding its memory limit.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub oomed: bool,

    #[serde(default)]
    pub metrics: ProcessMetrics,
}

/// Counters and gauges collected by the supervisor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessMetrics {
    /// Counter of user-process restarts.
    pub restarts: u64,
    /// Counter of OOM kills.
    pub ooms: u64,
    /// Total CPU time consumed, in ticks.
    pub cpu_time: u64,
    /// Resident memory in bytes.
    pub memory_usage: u64,
    /// Memory limit in bytes.
    pub memory_limit: u64,
}
