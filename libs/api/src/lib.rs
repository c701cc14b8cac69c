//! Wire types for the flotilla scheduling domain.
//!
//! Everything that crosses the HTTP boundary between the scheduler and the
//! per-host agents lives here: container configuration, instance state,
//! the heartbeat protocol, host resources, and job definitions. Both tiers
//! depend on this crate and nothing else shared, so the wire contract is
//! exactly what these types serialize to.

pub mod config;
pub mod error;
pub mod heartbeat;
pub mod instance;
pub mod job;
pub mod resources;

pub use config::{Command, ContainerConfig, Grace, ResourceLimits, Storage};
pub use error::Error;
pub use heartbeat::{Advisory, Heartbeat, HeartbeatReply, ProcessMetrics, ProcessStatus, ReportedStatus};
pub use instance::{ContainerInstance, ContainerStatus};
pub use job::{Job, Task};
pub use resources::{HostResources, TotalReserved};

/// Prefix for the agent HTTP API.
pub const API_VERSION_PREFIX: &str = "/api/v0";

/// Event name for a single-instance change on the agent event stream.
pub const CONTAINER_EVENT: &str = "container";

/// Event name for the full-snapshot event that opens every agent event
/// stream subscription.
pub const CONTAINERS_EVENT: &str = "containers";
