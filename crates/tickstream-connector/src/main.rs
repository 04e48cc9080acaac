//! tickstream-connector: market-data stream client binary
//!
//! Connects to the configured symbol and market streams, keeps the symbol
//! cache warm and serves health, readiness and Prometheus metrics.

use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tickstream_connector_lib::{run_server, MarketDataClient};
use tickstream_metadata::{ClientConfig, SettingsStore};

#[derive(Parser, Debug)]
#[command(name = "tickstream-connector")]
#[command(about = "Low-latency market-data stream client")]
struct Args {
    /// Path to client configuration file
    #[arg(short, long, env = "TICKSTREAM_CONFIG")]
    config: PathBuf,

    /// Path to the persisted refresh settings
    #[arg(short, long, env = "TICKSTREAM_SETTINGS")]
    settings: Option<PathBuf>,

    /// Health server bind address
    #[arg(long, default_value = "0.0.0.0:8080")]
    health_addr: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config = ClientConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    info!(
        name = %config.name,
        host = %config.endpoint.host,
        sources = config.sources.len(),
        markets = config.markets.len(),
        "Loaded client configuration"
    );

    let health_addr: SocketAddr = args
        .health_addr
        .parse()
        .with_context(|| format!("invalid health address {}", args.health_addr))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let shutdown_tx_clone = shutdown_tx.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Received shutdown signal");
        shutdown_tx_clone.send(true).ok();
    });

    let mut client = MarketDataClient::new(config)?;
    if let Some(path) = args.settings {
        client = client.with_settings_store(SettingsStore::new(path))?;
    }
    let client = Arc::new(client);

    let server_state = client.server_state();
    let server_shutdown = shutdown_rx.clone();
    let server = tokio::spawn(async move {
        if let Err(e) = run_server(health_addr, server_state, server_shutdown).await {
            error!(error = %e, "Health server failed");
        }
    });

    client.start();
    client.connect_configured().await;

    let mut shutdown_rx = shutdown_rx;
    while shutdown_rx.changed().await.is_ok() {
        if *shutdown_rx.borrow() {
            break;
        }
    }

    client.shutdown().await;
    server.await.ok();
    info!("Shutdown complete");
    Ok(())
}
