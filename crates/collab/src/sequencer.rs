//! Authoritative mutation sequencer.
//!
//! The sequencer owns the single authoritative [`RoomState`] of every
//! document. A mutation is accepted only when it names the current
//! `lastMutationId` as its predecessor, which gives each document one
//! total order of accepted mutations. Documents are independent: each room
//! sits behind its own lock.
//!
//! Every subscriber has exactly one outgoing channel. Foreign mutations and
//! acknowledgements are pushed into it while the room lock is held, so a
//! subscriber always sees them in acceptance order.

use crate::error::CollabError;
use crate::ids::{MutationId, SubscriberId};
use crate::mutation::{MutateParams, RoomState};
use crate::protocol::ServerMessage;
use doc_model::{DocModelError, Template, TemplateDefaults};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};

/// Outgoing message channel of one subscriber.
pub type Sink = mpsc::UnboundedSender<ServerMessage>;

/// Sequencer configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SequencerConfig {
    /// Value given to documents created on first reference.
    pub defaults: TemplateDefaults,
    /// Documents created at startup.
    pub seed_documents: Vec<String>,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            defaults: TemplateDefaults::default(),
            seed_documents: vec!["test".to_string()],
        }
    }
}

/// Sequencer errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SequencerError {
    /// Malformed request.
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unknown document: {0}")]
    UnknownDocument(String),

    /// The subscriber has not joined the document.
    #[error("Not joined to document: {0}")]
    NotJoined(String),

    /// The request names a stale predecessor.
    #[error("Version conflict: current version is {expected}, request is based on {actual}")]
    VersionConflict {
        expected: MutationId,
        actual: MutationId,
    },

    /// The mutation cannot be applied to the authoritative document.
    #[error("Patch error: {0}")]
    Patch(#[from] DocModelError),
}

impl SequencerError {
    /// Short machine-readable code used in wire error messages.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::UnknownDocument(_) => "unknown_document",
            Self::NotJoined(_) => "not_in_document",
            Self::VersionConflict { .. } => "version_conflict",
            Self::Patch(_) => "patch_failed",
        }
    }

    /// Whether the requester has already been sent a negative acknowledgement.
    ///
    /// Requests that never reached a room cannot be acknowledged through
    /// the room's subscriber channel.
    pub fn was_acknowledged(&self) -> bool {
        !matches!(self, Self::UnknownDocument(_) | Self::NotJoined(_))
    }
}

/// One document and the subscribers following it.
struct Room {
    document_id: String,
    state: RoomState,
    subscribers: HashMap<SubscriberId, Sink>,
}

impl Room {
    fn new(document_id: String, template: Template) -> Self {
        Self {
            document_id,
            state: RoomState::new(template),
            subscribers: HashMap::new(),
        }
    }

    /// Validate and apply a mutate request.
    fn accept(&mut self, payload: serde_json::Value) -> Result<MutateParams, SequencerError> {
        let params = MutateParams::parse(payload)
            .map_err(|e| SequencerError::Validation(e.to_string()))?;

        if params.last_mutation_id != self.state.last_mutation_id {
            return Err(SequencerError::VersionConflict {
                expected: self.state.last_mutation_id,
                actual: params.last_mutation_id,
            });
        }

        self.state = self.state.advance(&params.mutation).map_err(|e| match e {
            CollabError::Patch(err) => SequencerError::Patch(err),
            other => SequencerError::Validation(other.to_string()),
        })?;

        Ok(params)
    }

    /// Send to every subscriber except `origin`, pruning closed channels.
    fn broadcast(&mut self, origin: SubscriberId, message: &ServerMessage) {
        self.subscribers.retain(|subscriber, sink| {
            if *subscriber == origin {
                return true;
            }
            let delivered = sink.send(message.clone()).is_ok();
            if !delivered {
                tracing::debug!("Dropping closed subscriber {}", subscriber);
            }
            delivered
        });
    }
}

/// Sequencer statistics.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SequencerStats {
    pub total_documents: usize,
    pub total_subscriptions: usize,
}

/// The authoritative per-document sequencer.
pub struct Sequencer {
    config: SequencerConfig,
    rooms: RwLock<HashMap<String, Arc<Mutex<Room>>>>,
}

impl Sequencer {
    /// Create a sequencer holding the configured seed documents.
    pub fn new(config: SequencerConfig) -> Self {
        let rooms = config
            .seed_documents
            .iter()
            .map(|id| {
                let template = Template::with_defaults(id.clone(), &config.defaults);
                let room = Room::new(id.clone(), template);
                (id.clone(), Arc::new(Mutex::new(room)))
            })
            .collect::<HashMap<_, _>>();

        tracing::info!("Sequencer initialized with {} seed document(s)", rooms.len());

        Self {
            config,
            rooms: RwLock::new(rooms),
        }
    }

    pub fn config(&self) -> &SequencerConfig {
        &self.config
    }

    async fn room(&self, document_id: &str) -> Option<Arc<Mutex<Room>>> {
        self.rooms.read().await.get(document_id).cloned()
    }

    async fn room_or_create(&self, document_id: &str) -> Arc<Mutex<Room>> {
        if let Some(room) = self.room(document_id).await {
            return room;
        }

        let mut rooms = self.rooms.write().await;
        let room = rooms.entry(document_id.to_string()).or_insert_with(|| {
            tracing::info!("Creating document {}", document_id);
            let template = Template::with_defaults(document_id, &self.config.defaults);
            Arc::new(Mutex::new(Room::new(document_id.to_string(), template)))
        });
        Arc::clone(room)
    }

    /// Subscribe to a document, creating it if unknown.
    ///
    /// The current state is pushed into `sink` before any mutation accepted
    /// later, and also returned.
    pub async fn join(
        &self,
        subscriber: SubscriberId,
        sink: Sink,
        document_id: &str,
    ) -> Result<RoomState, SequencerError> {
        if document_id.trim().is_empty() {
            return Err(SequencerError::Validation(
                "document id must not be empty".to_string(),
            ));
        }

        let room = self.room_or_create(document_id).await;
        let mut room = room.lock().await;
        let state = room.state.clone();

        let _ = sink.send(ServerMessage::State {
            document_id: room.document_id.clone(),
            state: state.clone(),
        });
        room.subscribers.insert(subscriber, sink);

        tracing::debug!(
            "{} joined {} at version {}",
            subscriber,
            document_id,
            state.last_mutation_id
        );
        Ok(state)
    }

    /// Unsubscribe from a document. Returns whether the subscriber was joined.
    pub async fn leave(&self, subscriber: SubscriberId, document_id: &str) -> bool {
        let Some(room) = self.room(document_id).await else {
            return false;
        };
        let removed = room.lock().await.subscribers.remove(&subscriber).is_some();
        if removed {
            tracing::debug!("{} left {}", subscriber, document_id);
        }
        removed
    }

    /// Unsubscribe from every document (used on disconnect).
    pub async fn leave_all(&self, subscriber: SubscriberId) {
        let rooms: Vec<Arc<Mutex<Room>>> = self.rooms.read().await.values().cloned().collect();
        for room in rooms {
            room.lock().await.subscribers.remove(&subscriber);
        }
    }

    /// Handle a mutate request.
    ///
    /// On acceptance the mutation is fanned out to every other subscriber
    /// and the sender is positively acknowledged. A joined sender is sent a
    /// negative acknowledgement for every rejection; see
    /// [`SequencerError::was_acknowledged`].
    pub async fn mutate(
        &self,
        document_id: &str,
        subscriber: SubscriberId,
        request_id: u64,
        payload: serde_json::Value,
    ) -> Result<MutationId, SequencerError> {
        let room = self
            .room(document_id)
            .await
            .ok_or_else(|| SequencerError::UnknownDocument(document_id.to_string()))?;
        let mut room = room.lock().await;

        let Some(sender) = room.subscribers.get(&subscriber).cloned() else {
            return Err(SequencerError::NotJoined(document_id.to_string()));
        };

        let result = room.accept(payload);
        match &result {
            Ok(params) => {
                tracing::debug!(
                    "Accepted mutation {} on {} from {}",
                    params.mutation.id,
                    document_id,
                    subscriber
                );
                let message = ServerMessage::Mutation {
                    document_id: document_id.to_string(),
                    params: params.clone(),
                };
                room.broadcast(subscriber, &message);
            }
            Err(err) => {
                tracing::debug!(
                    "Rejected mutation on {} from {}: {}",
                    document_id,
                    subscriber,
                    err
                );
            }
        }

        let _ = sender.send(ServerMessage::Ack {
            document_id: document_id.to_string(),
            request_id,
            accepted: result.is_ok(),
        });

        result.map(|params| params.mutation.id)
    }

    /// Current authoritative state of a document.
    pub async fn state(&self, document_id: &str) -> Option<RoomState> {
        let room = self.room(document_id).await?;
        let state = room.lock().await.state.clone();
        Some(state)
    }

    pub async fn document_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.rooms.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn subscriber_count(&self, document_id: &str) -> usize {
        match self.room(document_id).await {
            Some(room) => room.lock().await.subscribers.len(),
            None => 0,
        }
    }

    pub async fn stats(&self) -> SequencerStats {
        let rooms: Vec<Arc<Mutex<Room>>> = self.rooms.read().await.values().cloned().collect();
        let mut total_subscriptions = 0;
        for room in &rooms {
            total_subscriptions += room.lock().await.subscribers.len();
        }
        SequencerStats {
            total_documents: rooms.len(),
            total_subscriptions,
        }
    }
}

impl Default for Sequencer {
    fn default() -> Self {
        Self::new(SequencerConfig::default())
    }
}
