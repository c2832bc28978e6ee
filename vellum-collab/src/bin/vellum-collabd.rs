//! Standalone synchronization server.
//!
//! Configuration comes from the environment (`VELLUM_BIND_ADDR`,
//! `VELLUM_DATA_DIR`, `VELLUM_IDLE_GRACE_SECS`, `RUST_LOG`). The update
//! log is opened before the listener binds; ctrl-c triggers a shutdown
//! that flushes every open document.

use vellum_collab::server::{CollabServer, ServerConfig};

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = ServerConfig::from_env();
    let server = match CollabServer::new(config) {
        Ok(server) => server,
        Err(e) => {
            log::error!("failed to open update log: {e}");
            std::process::exit(1);
        }
    };

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                log::error!("server error: {e}");
                server.shutdown().await;
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            log::info!("received ctrl-c");
        }
    }

    server.shutdown().await;
}
