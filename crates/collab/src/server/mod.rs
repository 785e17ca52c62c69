//! WebSocket sync server.
//!
//! This module exposes a [`Sequencer`] over WebSocket. Each connection runs
//! in its own task: incoming frames are handled in order, and everything the
//! sequencer pushes for the connection is forwarded by a dedicated writer.
//!
//! # Example
//!
//! ```ignore
//! use collab::server::{CollaborationServer, ServerConfig};
//! use collab::sequencer::Sequencer;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let sequencer = Arc::new(Sequencer::default());
//!     let server = CollaborationServer::new(ServerConfig::default(), sequencer);
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod connection;

use crate::protocol::ServerMessage;
use crate::sequencer::Sequencer;
use connection::ClientConnection;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{accept_async, tungstenite::Message};

pub use connection::{MessageError, SendError};

/// Server configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_address: String,
    /// Port to listen on.
    pub port: u16,
    /// Maximum total connections.
    pub max_total_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 3000,
            max_total_connections: 1000,
        }
    }
}

impl ServerConfig {
    /// Create a new configuration with the specified port.
    pub fn with_port(port: u16) -> Self {
        Self {
            port,
            ..Default::default()
        }
    }

    /// Get the full bind address.
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

/// Server errors.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Failed to bind to address.
    #[error("Failed to bind to {0}: {1}")]
    BindFailed(String, std::io::Error),
    /// Failed to read the listener address.
    #[error("Listener error: {0}")]
    Listener(std::io::Error),
}

/// The sync server.
pub struct CollaborationServer {
    config: ServerConfig,
    sequencer: Arc<Sequencer>,
    connections: Arc<AtomicUsize>,
    shutdown_tx: broadcast::Sender<()>,
}

impl CollaborationServer {
    pub fn new(config: ServerConfig, sequencer: Arc<Sequencer>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            sequencer,
            connections: Arc::new(AtomicUsize::new(0)),
            shutdown_tx,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn sequencer(&self) -> &Arc<Sequencer> {
        &self.sequencer
    }

    /// Get a shutdown handle.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown_tx.clone(),
        }
    }

    /// Bind to the configured address and serve until shutdown.
    pub async fn run(&self) -> Result<(), ServerError> {
        let addr = self.config.socket_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| ServerError::BindFailed(addr.clone(), e))?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        let local_addr = listener.local_addr().map_err(ServerError::Listener)?;
        tracing::info!("Sync server listening on {}", local_addr);

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let conn_count = self.connections.load(Ordering::SeqCst);
                            if conn_count >= self.config.max_total_connections {
                                tracing::warn!("Max connections reached, rejecting {}", addr);
                                continue;
                            }

                            self.connections.fetch_add(1, Ordering::SeqCst);
                            tokio::spawn(handle_connection(
                                stream,
                                addr,
                                Arc::clone(&self.sequencer),
                                Arc::clone(&self.connections),
                                self.shutdown_tx.subscribe(),
                            ));
                        }
                        Err(e) => {
                            tracing::error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Server received shutdown signal");
                    break;
                }
            }
        }

        tracing::info!("Server shutdown complete");
        Ok(())
    }

    /// Get current server statistics.
    pub async fn stats(&self) -> ServerStats {
        ServerStats {
            total_connections: self.connections.load(Ordering::SeqCst),
            total_documents: self.sequencer.stats().await.total_documents,
        }
    }
}

/// Run one WebSocket connection to completion.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    sequencer: Arc<Sequencer>,
    connections: Arc<AtomicUsize>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    tracing::debug!("New connection from {}", addr);

    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            tracing::error!("WebSocket handshake failed for {}: {}", addr, e);
            connections.fetch_sub(1, Ordering::SeqCst);
            return;
        }
    };

    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    let (msg_tx, mut msg_rx) = mpsc::unbounded_channel::<ServerMessage>();
    let mut conn = ClientConnection::new(msg_tx);
    let conn_id = conn.id;

    // Outgoing message forwarder
    let outgoing = tokio::spawn(async move {
        while let Some(msg) = msg_rx.recv().await {
            match msg.to_json() {
                Ok(json) => {
                    if ws_tx.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!("Failed to serialize message: {}", e);
                }
            }
        }
    });

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Err(e) = conn.handle_text(&sequencer, &text).await {
                            tracing::error!("Message handling error: {}", e);
                            let _ = conn.send_error("message_error", e.to_string());
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::debug!("Connection {} closed", conn_id);
                        break;
                    }
                    Some(Err(e)) => {
                        tracing::error!("WebSocket error for {}: {}", conn_id, e);
                        break;
                    }
                    _ => {}
                }
            }
            _ = shutdown_rx.recv() => {
                tracing::debug!("Connection {} received shutdown signal", conn_id);
                break;
            }
        }
    }

    conn.disconnect(&sequencer).await;
    outgoing.abort();
    connections.fetch_sub(1, Ordering::SeqCst);
}

/// Server statistics.
#[derive(Clone, Debug)]
pub struct ServerStats {
    /// Total active connections.
    pub total_connections: usize,
    /// Total documents held by the sequencer.
    pub total_documents: usize,
}

/// Handle for triggering server shutdown.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: broadcast::Sender<()>,
}

impl ShutdownHandle {
    /// Signal the server to shut down.
    pub fn shutdown(&self) {
        let _ = self.tx.send(());
    }
}
