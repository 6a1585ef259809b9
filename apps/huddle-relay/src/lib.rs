//! Signaling relay for Huddle calls: room membership, identity
//! bookkeeping, and offer/answer forwarding between connections.

pub mod cli;
pub mod config;
pub mod coordinator;
pub mod http;
pub mod registry;
pub mod telemetry;
pub mod websocket;

use std::sync::Arc;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tracing::info;

use crate::config::RelayConfig;
use crate::coordinator::Coordinator;
use crate::http::AppState;
use crate::registry::Registry;

pub async fn run(config: RelayConfig, metrics: PrometheusHandle) -> Result<()> {
    let coordinator = Arc::new(Coordinator::new(Registry::new(), config.options.clone()));
    let state = AppState::new(coordinator).with_metrics(metrics);

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!(
        listen_addr = %config.listen_addr,
        announce_departures = config.options.announce_departures,
        "huddle relay listening"
    );

    http::serve(listener, http::router(state), shutdown_signal()).await?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; sleeping for graceful period"
    );
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
