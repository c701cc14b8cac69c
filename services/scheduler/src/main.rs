//! flotilla scheduler
//!
//! Central process of the scheduling domain: serves the job API, stores
//! desired state in the registry, and reconciles the agent fleet toward it.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use flotilla_scheduler::api;
use flotilla_scheduler::config::Config;
use flotilla_scheduler::discovery::StaticDiscovery;
use flotilla_scheduler::registry::Registry;
use flotilla_scheduler::scheduler::Scheduler;
use flotilla_scheduler::transformer::{HttpConnector, Transformer};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    info!(
        listen = %config.listen_addr,
        agents = config.agent_endpoints.len(),
        "starting flotilla scheduler"
    );

    let (lost_tx, lost_rx) = mpsc::unbounded_channel();
    let registry = Registry::new(Some(lost_tx));

    let discovery = Arc::new(StaticDiscovery::new(config.agent_endpoints.clone()));
    let transformer = Transformer::new(
        discovery,
        registry.clone(),
        Arc::new(HttpConnector),
        config.agent_poll_interval,
    );

    let scheduler = Scheduler::new(registry, Arc::new(transformer), lost_rx);

    let app = api::router(scheduler);
    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    info!(addr = %config.listen_addr, "scheduler API listening");
    axum::serve(listener, app).await?;

    Ok(())
}
