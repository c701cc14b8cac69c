//! Scheduling algorithms: given the fleet's state, pick an endpoint for
//! one container.

use std::collections::BTreeMap;

use rand::seq::SliceRandom;

use flotilla_api::{ContainerConfig, Error};

use crate::transformer::AgentState;

/// Pick an endpoint for a container, or explain why none fits.
pub type SchedulingAlgorithm =
    fn(&BTreeMap<String, AgentState>, &ContainerConfig) -> Result<String, Error>;

/// Uniformly random over the agents whose state can be trusted. The
/// default: resource-aware placement can come later, distrust cannot.
pub fn random_non_dirty(
    states: &BTreeMap<String, AgentState>,
    _config: &ContainerConfig,
) -> Result<String, Error> {
    let mut endpoints: Vec<&String> = states.keys().collect();
    endpoints.shuffle(&mut rand::thread_rng());

    for endpoint in endpoints {
        if !states[endpoint].dirty {
            return Ok(endpoint.clone());
        }
    }
    Err(Error::AgentUnavailable(
        "no trustable agent available".to_string(),
    ))
}
