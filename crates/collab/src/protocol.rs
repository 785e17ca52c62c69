//! Wire messages exchanged between sync clients and the sequencer.
//!
//! Messages are JSON objects tagged by a snake_case `type` field with
//! camelCase payload fields.

use crate::mutation::{MutateParams, RoomState};
use serde::{Deserialize, Serialize};

/// Messages sent from client to server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Subscribe to a document. Answered with [`ServerMessage::State`].
    Join {
        #[serde(rename = "documentId")]
        document_id: String,
    },

    /// Unsubscribe from a document.
    Leave {
        #[serde(rename = "documentId")]
        document_id: String,
    },

    /// Submit a mutation. `params` is validated by the sequencer, so a
    /// malformed payload is answered with a negative acknowledgement.
    Mutate {
        #[serde(rename = "documentId")]
        document_id: String,
        #[serde(rename = "requestId")]
        request_id: u64,
        params: serde_json::Value,
    },

    /// Ping for connection health.
    Ping,
}

/// Messages sent from server to client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Full room state, sent once on join.
    State {
        #[serde(rename = "documentId")]
        document_id: String,
        state: RoomState,
    },

    /// A mutation accepted from another client.
    Mutation {
        #[serde(rename = "documentId")]
        document_id: String,
        params: MutateParams,
    },

    /// Answer to a mutate request.
    Ack {
        #[serde(rename = "documentId")]
        document_id: String,
        #[serde(rename = "requestId")]
        request_id: u64,
        accepted: bool,
    },

    /// Error message.
    Error { code: String, message: String },

    /// Pong response to ping.
    Pong,
}

impl ClientMessage {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl ServerMessage {
    /// Create an error message.
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// The document this message concerns, if any.
    pub fn document_id(&self) -> Option<&str> {
        match self {
            Self::State { document_id, .. }
            | Self::Mutation { document_id, .. }
            | Self::Ack { document_id, .. } => Some(document_id),
            Self::Error { .. } | Self::Pong => None,
        }
    }
}
