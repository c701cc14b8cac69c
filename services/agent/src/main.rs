//! flotilla agent
//!
//! Runs on every host in the scheduling domain. Serves the container API
//! and event stream, ingests container logs over UDP, and supervises the
//! containers placed here by the scheduler.

use std::sync::Arc;

use anyhow::Result;
use tokio::net::UdpSocket;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use flotilla_agent::api::{self, AppState};
use flotilla_agent::artifact::HttpArtifactStore;
use flotilla_agent::config::{Config, HEARTBEAT_INTERVAL};
use flotilla_agent::container::ContainerContext;
use flotilla_agent::logs;
use flotilla_agent::registry::Registry;
use flotilla_agent::runtime::ProcessRuntime;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Arc::new(Config::from_env()?);
    info!(
        listen = %config.listen_addr,
        advertised = %config.advertised_addr,
        run_root = %config.run_root.display(),
        "starting flotilla agent"
    );

    let registry = Registry::new();
    let ctx = Arc::new(ContainerContext {
        artifacts: Arc::new(HttpArtifactStore::new(&config.artifact_root)),
        runtime: Arc::new(ProcessRuntime::new()),
        run_root: config.run_root.clone(),
        log_root: config.log_root.clone(),
        advertised_addr: config.advertised_addr.clone(),
        log_buffer_lines: config.log_buffer_lines,
        heartbeat_interval: HEARTBEAT_INTERVAL,
    });

    let log_socket = UdpSocket::bind(("0.0.0.0", config.log_udp_port)).await?;
    tokio::spawn(logs::receive_logs(registry.clone(), log_socket));

    let app = api::router(AppState {
        registry,
        ctx,
        config: config.clone(),
    });

    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    info!(addr = %config.listen_addr, "agent API listening");
    axum::serve(listener, app).await?;

    Ok(())
}
