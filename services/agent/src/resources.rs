//! Host resource accounting for GET /resources.

use std::sync::Arc;

use flotilla_api::{HostResources, TotalReserved};

use crate::config::Config;
use crate::registry::Registry;

/// The host resource picture: configured totals with reservations summed
/// over every registered container.
pub async fn host_resources(config: &Config, registry: &Arc<Registry>) -> HostResources {
    let mut reserved_mem = 0.0;
    let mut reserved_cpus = 0.0;
    for instance in registry.instances().await {
        reserved_mem += instance.config.resources.mem as f64;
        reserved_cpus += instance.config.resources.cpus;
    }

    HostResources {
        mem: TotalReserved {
            total: config.total_mem_mb,
            reserved: reserved_mem,
        },
        cpus: TotalReserved {
            total: config.total_cpus,
            reserved: reserved_cpus,
        },
        storage: TotalReserved::default(),
        volumes: config.volumes.clone(),
    }
}
