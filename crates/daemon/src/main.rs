//! Webpeer Daemon Binary
//!
//! Runs the bridge socket server for local front-ends.

mod server;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use webpeer_core::BridgeConfig;

use crate::server::{BridgeServer, ServerConfig};

fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,webpeer=debug"));

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    init_logging();

    tracing::info!("starting webpeer bridge...");

    let config = ServerConfig::default();
    tracing::info!("bridge will listen on {:?}", config.socket_path);

    let mut server = BridgeServer::new(config, BridgeConfig::default());

    tokio::select! {
        result = server.start() => {
            if let Err(e) = result {
                tracing::error!("bridge server error: {e}");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received shutdown signal");
            server.stop().await;
        }
    }

    tracing::info!("bridge stopped");
    Ok(())
}
