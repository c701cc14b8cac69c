//! Scheduler configuration, loaded from the environment.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;

#[derive(Debug, Clone)]
pub struct Config {
    /// Address the HTTP API binds to.
    pub listen_addr: SocketAddr,

    /// Agent endpoints, e.g. "10.0.0.1:3333,10.0.0.2:3333".
    pub agent_endpoints: Vec<String>,

    /// How often the transformer polls an agent while waiting for a
    /// container to start or stop.
    pub agent_poll_interval: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let listen_addr = std::env::var("FLOTILLA_SCHEDULER_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:4444".to_string())
            .parse()?;

        let agent_endpoints = std::env::var("FLOTILLA_AGENTS")
            .map(|s| {
                s.split(',')
                    .map(str::trim)
                    .filter(|e| !e.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        let agent_poll_interval = std::env::var("FLOTILLA_AGENT_POLL_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_millis(250));

        Ok(Self {
            listen_addr,
            agent_endpoints,
            agent_poll_interval,
        })
    }
}
