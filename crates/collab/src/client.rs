//! WebSocket room channel.
//!
//! A [`SyncClient`] owns one connection to a sync server and can join any
//! number of documents over it. Each joined document is a [`RemoteRoom`],
//! which implements [`RoomChannel`] and can back an optimistic store.
//!
//! A single reader task routes every server frame in arrival order, so
//! foreign mutations and acknowledgements reach the store in the order the
//! sequencer produced them.
//!
//! # Example
//!
//! ```ignore
//! use collab::client::SyncClient;
//! use collab::OptimisticStore;
//!
//! let client = SyncClient::connect("ws://127.0.0.1:3000").await?;
//! let store = OptimisticStore::new(client.join("test").await?);
//! ```

use crate::error::{CollabError, CollabResult};
use crate::mutation::{MutateParams, RoomState};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::room::{wait_ack, Dispatcher, MutationHandler, RoomChannel, Subscription};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};

#[derive(Default)]
struct Routes {
    rooms: HashMap<String, Arc<Dispatcher>>,
    joins: HashMap<String, oneshot::Sender<RoomState>>,
    closed: bool,
}

struct ClientInner {
    outgoing: mpsc::UnboundedSender<ClientMessage>,
    routes: Mutex<Routes>,
}

impl ClientInner {
    fn routes(&self) -> MutexGuard<'_, Routes> {
        self.routes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn send(&self, message: ClientMessage) -> CollabResult<()> {
        self.outgoing
            .send(message)
            .map_err(|_| CollabError::Communication("connection closed".to_string()))
    }

    fn route(&self, message: ServerMessage) {
        match message {
            ServerMessage::State { document_id, state } => {
                let waiter = self.routes().joins.remove(&document_id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(state);
                    }
                    None => tracing::debug!("Unsolicited state for {}", document_id),
                }
            }
            ServerMessage::Error { code, message } => {
                tracing::warn!("Server error [{}]: {}", code, message);
            }
            ServerMessage::Pong => tracing::debug!("Pong"),
            message => {
                let dispatcher = message
                    .document_id()
                    .and_then(|id| self.routes().rooms.get(id).cloned());
                match dispatcher {
                    Some(dispatcher) => dispatcher.dispatch(message),
                    None => tracing::debug!("Dropping message for a document that is not joined"),
                }
            }
        }
    }

    /// Fail everything waiting on this connection.
    fn close(&self) {
        let mut routes = self.routes();
        routes.closed = true;
        routes.joins.clear();
        for dispatcher in routes.rooms.values() {
            dispatcher.close();
        }
    }
}

/// A WebSocket connection to a sync server.
pub struct SyncClient {
    inner: Arc<ClientInner>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl SyncClient {
    /// Connect to a sync server, e.g. `ws://127.0.0.1:3000`.
    pub async fn connect(url: &str) -> CollabResult<Self> {
        let (ws_stream, _) = connect_async(url).await.map_err(|e| {
            CollabError::Communication(format!("failed to connect to {}: {}", url, e))
        })?;
        tracing::info!("Connected to {}", url);

        let (mut ws_tx, mut ws_rx) = ws_stream.split();
        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<ClientMessage>();

        let inner = Arc::new(ClientInner {
            outgoing,
            routes: Mutex::new(Routes::default()),
        });

        let writer = tokio::spawn(async move {
            while let Some(message) = outgoing_rx.recv().await {
                match message.to_json() {
                    Ok(json) => {
                        if ws_tx.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::error!("Failed to serialize message: {}", e),
                }
            }
            let _ = ws_tx.close().await;
        });

        let reader = {
            let inner = Arc::clone(&inner);
            tokio::spawn(async move {
                while let Some(frame) = ws_rx.next().await {
                    match frame {
                        Ok(Message::Text(text)) => match ServerMessage::from_json(&text) {
                            Ok(message) => inner.route(message),
                            Err(e) => tracing::warn!("Unparseable server message: {}", e),
                        },
                        Ok(Message::Close(_)) => break,
                        Ok(_) => {}
                        Err(e) => {
                            tracing::error!("WebSocket error: {}", e);
                            break;
                        }
                    }
                }
                tracing::debug!("Connection closed");
                inner.close();
            })
        };

        Ok(Self {
            inner,
            reader,
            writer,
        })
    }

    /// Join a document and wait for its initial state.
    pub async fn join(&self, document_id: impl Into<String>) -> CollabResult<RemoteRoom> {
        let document_id = document_id.into();
        if document_id.trim().is_empty() {
            return Err(CollabError::Validation(
                "document id must not be empty".to_string(),
            ));
        }

        let dispatcher = Arc::new(Dispatcher::new());
        let (tx, rx) = oneshot::channel();
        {
            let mut routes = self.inner.routes();
            if routes.closed {
                return Err(CollabError::Communication("connection closed".to_string()));
            }
            routes.rooms.insert(document_id.clone(), Arc::clone(&dispatcher));
            routes.joins.insert(document_id.clone(), tx);
        }

        self.inner.send(ClientMessage::Join {
            document_id: document_id.clone(),
        })?;

        let initial = rx.await.map_err(|_| {
            CollabError::Communication(format!("connection closed while joining {}", document_id))
        })?;
        tracing::debug!("Joined {} at version {}", document_id, initial.last_mutation_id);

        Ok(RemoteRoom {
            client: Arc::clone(&self.inner),
            document_id,
            initial,
            dispatcher,
        })
    }

    /// Send a ping; the pong is only logged.
    pub fn ping(&self) -> CollabResult<()> {
        self.inner.send(ClientMessage::Ping)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.routes().closed
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
        self.inner.close();
    }
}

/// One document joined over a [`SyncClient`] connection.
pub struct RemoteRoom {
    client: Arc<ClientInner>,
    document_id: String,
    initial: RoomState,
    dispatcher: Arc<Dispatcher>,
}

impl RoomChannel for RemoteRoom {
    fn document_id(&self) -> &str {
        &self.document_id
    }

    fn initial_state(&self) -> RoomState {
        self.initial.clone()
    }

    fn on_mutate(&self, handler: MutationHandler) -> Subscription {
        self.dispatcher.subscribe(handler)
    }

    async fn mutate(&self, params: MutateParams) -> bool {
        let (request_id, ack) = self.dispatcher.expect_ack();

        let sent = serde_json::to_value(&params)
            .map_err(CollabError::from)
            .and_then(|payload| {
                self.client.send(ClientMessage::Mutate {
                    document_id: self.document_id.clone(),
                    request_id,
                    params: payload,
                })
            });
        if let Err(err) = sent {
            tracing::error!("Failed to send mutation {}: {}", params.mutation.id, err);
            self.dispatcher.cancel(request_id);
        }

        wait_ack(ack).await
    }

    async fn leave(&self) {
        self.client.routes().rooms.remove(&self.document_id);
        self.dispatcher.close();
        if let Err(err) = self.client.send(ClientMessage::Leave {
            document_id: self.document_id.clone(),
        }) {
            tracing::debug!("Leave not sent: {}", err);
        }
    }
}
