//! flotilla-supervisor
//!
//! Wraps one container's user process: heartbeats the parent agent, maps
//! advisories to signals, restarts on failure while the agent wants the
//! process up. Launched by the agent with the container run directory as
//! its working directory.

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use flotilla_agent::supervise;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = supervise::SupervisorConfig::from_env()?;
    supervise::run(config).await
}
