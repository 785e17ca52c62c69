//! Template sync server
//!
//! Runs the authoritative sequencer behind a WebSocket listener until
//! Ctrl-C.

mod settings;

use collab::sequencer::Sequencer;
use collab::server::CollaborationServer;
use settings::ServerSettings;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    tracing::info!("Starting template sync server");

    let settings = match ServerSettings::path_from_env(std::env::args()) {
        Some(path) => ServerSettings::load(&path)?,
        None => ServerSettings::default(),
    };

    let sequencer = Arc::new(Sequencer::new(settings.sequencer));
    let server = Arc::new(CollaborationServer::new(settings.server, sequencer));

    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Ctrl-C received, shutting down");
                shutdown.shutdown();
            }
            Err(e) => tracing::error!("Failed to listen for Ctrl-C: {}", e),
        }
    });

    server.run().await?;
    Ok(())
}
