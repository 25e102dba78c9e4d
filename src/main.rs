//! Failover reverse proxy.
//!
//! # Architecture Overview
//!
//! ```text
//!                        ┌───────────────────────────────────────────────┐
//!   Client request       │                FAILOVER PROXY                 │
//!   ─────────────────────┼─▶ http::server ──▶ admin (management routes)  │
//!                        │        │                                      │
//!                        │        ▼                                      │
//!                        │  http::forwarder ◀──▶ resilience::breaker     │
//!                        │        │                                      │
//!                        │        ▼                                      │
//!                        │  protocol (convert) ──▶ reqwest ──────────────┼──▶ backend 1..n
//!                        │        │                                      │
//!   Client response      │        ▼                                      │
//!   ◀────────────────────┼── relay / compression                         │
//!                        └───────────────────────────────────────────────┘
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;

use failover_proxy::config::ConfigManager;
use failover_proxy::http::HttpServer;
use failover_proxy::lifecycle::{self, shutdown, Shutdown};
use failover_proxy::observability::{logging, metrics};

#[derive(Parser)]
#[command(name = "failover-proxy", version, about = "Failover reverse proxy with protocol conversion")]
struct Args {
    /// Configuration file (JSON, or TOML when it ends in .toml)
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Override the configured listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Seconds in-flight requests may run after a shutdown signal
    #[arg(long, default_value_t = shutdown::DEFAULT_DRAIN_PERIOD.as_secs())]
    drain_secs: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let manager = match ConfigManager::load(&args.config) {
        Ok(manager) => Arc::new(manager),
        Err(e) => {
            logging::init("info");
            tracing::error!(path = %args.config.display(), error = %e, "Failed to load configuration");
            return Err(e.into());
        }
    };
    let config = manager.snapshot();

    logging::init(&config.observability.log_level);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), config = %args.config.display(), "failover-proxy starting");
    lifecycle::startup::log_summary(&config);

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse::<SocketAddr>() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(e) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                error = %e,
                "Failed to parse metrics address"
            ),
        }
    }

    let bind_address = match args.port {
        Some(port) => format!("{}:{}", config.host, port),
        None => config.bind_address(),
    };
    let listener = TcpListener::bind(&bind_address).await?;
    tracing::info!(address = %listener.local_addr()?, "Listening for connections");

    let server = HttpServer::new(manager)?;
    let coordinator = Shutdown::new();
    let mut server_task = tokio::spawn(server.run(listener, coordinator.subscribe()));

    tokio::select! {
        result = &mut server_task => {
            // Server exited without a signal.
            return match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e.into()),
                Err(e) => Err(e.into()),
            };
        }
        _ = lifecycle::wait_for_shutdown() => {}
    }

    coordinator.trigger();
    let drained = shutdown::drain(server_task, std::time::Duration::from_secs(args.drain_secs)).await;
    tracing::info!(drained, "Shutdown complete");
    Ok(())
}
