//! Standalone sync server.
//!
//! Usage: `scribe-server [config.toml]`. Without a config file the server
//! binds 0.0.0.0:9090 and keeps documents in memory. `RUST_LOG` controls
//! log output.

use log::{error, info};
use scribe_collab::{ServerConfig, SyncServer};

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = match std::env::args().nth(1) {
        Some(path) => match ServerConfig::load(&path) {
            Ok(config) => config,
            Err(e) => {
                error!("{e}");
                std::process::exit(2);
            }
        },
        None => ServerConfig::default(),
    };

    info!("Starting Scribe sync server...");

    let server = match SyncServer::new(config) {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to start: {e}");
            std::process::exit(1);
        }
    };

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Server error: {e}");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, flushing open documents");
        }
    }

    server.shutdown().await;
}
