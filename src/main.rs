//! Stackline Relay Server
//!
//! Matchmaking and game-state relay for head-to-head tile-stacking matches.

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use stackline::{
    network::{RelayServer, ServerConfig},
    RELAY_INTERVAL, VERSION,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ServerConfig::from_env();

    info!("Stackline Relay Server v{}", VERSION);
    info!("Bind: {}", config.bind_addr);
    info!("Max connections: {}", config.max_connections);
    info!("Client relay interval: {} ms", RELAY_INTERVAL.as_millis());

    let server = std::sync::Arc::new(RelayServer::new(config));

    let signal_server = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, shutting down");
            signal_server.shutdown();
        }
    });

    server.run().await.context("relay server failed")?;
    info!("Server stopped");
    Ok(())
}
