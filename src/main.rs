//! mbtcp - Modbus TCP responder
//!
//! Serves Modbus TCP requests with an echo handler. Useful for exercising
//! clients against a real peer.

use mbtcp_server::{Config, EchoHandler, Server};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration (from file if MBTCP_CONFIG is set, then env overrides)
    let config_path = std::env::var("MBTCP_CONFIG").ok();
    let config = match Config::load() {
        Ok(c) => {
            if let Some(path) = &config_path {
                tracing::info!("Loaded config from {}", path);
            }
            c
        }
        Err(e) => {
            // An explicitly named config file must load
            if config_path.is_some() {
                tracing::error!("Failed to load config: {}", e);
                return Err(e.into());
            }
            tracing::info!("Using default configuration");
            Config::default()
        }
    };

    tracing::info!("Starting mbtcp server");
    tracing::info!("  Bind address: {}", config.network.bind_addr);
    tracing::info!("  Max connections: {}", config.network.max_connections);
    tracing::info!(
        "  Timeouts: request={}ms response={}ms liveness={}ms",
        config.connection.request_timeout_ms,
        config.connection.response_timeout_ms,
        config.connection.liveness_timeout_ms
    );

    let server = Server::bind(config, EchoHandler)?;

    // Runs until the process is terminated
    server.run()?;
    Ok(())
}
