//! Container instance state as reported by agents.

use serde::{Deserialize, Serialize};

use crate::config::ContainerConfig;

/// The state of one container on one agent. In scheduler terminology this
/// is always one instance of a task. Objects on the agent event stream are
/// complete current states, not transitions.
///
/// Container IDs are assigned by the scheduler and globally unique across
/// the scheduling domain, not merely per agent. This works because IDs
/// arrive with the PUT rather than being minted by the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerInstance {
    #[serde(rename = "container_id")]
    pub id: String,
    pub status: ContainerStatus,
    pub config: ContainerConfig,
}

/// Current state of a container in an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerStatus {
    /// Accepted and in the process of starting up.
    Starting,

    /// Running from the perspective of the agent. Implies nothing about the
    /// healthiness of the user process.
    Running,

    /// Exited with a non-zero status. Usually short-lived, as the
    /// supervisor restarts the process.
    Failed,

    /// Exited zero. Long-lived: the agent does not restart finished
    /// containers.
    Finished,

    /// Event-only meta state sent to subscribers when a container is
    /// destroyed. Never stored.
    Deleted,
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContainerStatus::Starting => write!(f, "starting"),
            ContainerStatus::Running => write!(f, "running"),
            ContainerStatus::Failed => write!(f, "failed"),
            ContainerStatus::Finished => write!(f, "finished"),
            ContainerStatus::Deleted => write!(f, "deleted"),
        }
    }
}
