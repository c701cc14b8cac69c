//! Host resource reporting, served by GET /resources.

use serde::{Deserialize, Serialize};

/// Current resource picture of one agent host. Scheduling algorithms read
/// this; a failed resources query marks the agent dirty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostResources {
    /// Megabytes.
    pub mem: TotalReserved,
    /// Whole CPUs.
    pub cpus: TotalReserved,
    /// Bytes.
    #[serde(default)]
    pub storage: TotalReserved,
    /// Host volume paths this agent is willing to bind-mount.
    #[serde(default)]
    pub volumes: Vec<String>,
}

/// Total scalar amount of a resource and the part currently reserved by
/// registered containers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TotalReserved {
    pub total: f64,
    pub reserved: f64,
}
