//! Per-connection message handling for the sync server.

use crate::ids::SubscriberId;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::sequencer::{Sequencer, Sink};
use std::collections::HashSet;
use thiserror::Error;

/// Error sending a message to a client.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    /// The client's channel is closed.
    #[error("Channel closed for {0}")]
    ChannelClosed(SubscriberId),
}

/// Message handling errors.
#[derive(Error, Debug)]
pub enum MessageError {
    /// Failed to parse message.
    #[error("Parse error: {0}")]
    ParseError(String),
    /// Failed to send message.
    #[error("Send error: {0}")]
    SendError(#[from] SendError),
}

/// A client connection to the sync server.
pub struct ClientConnection {
    /// Sequencer identity of this connection.
    pub id: SubscriberId,
    /// Channel to send messages to this client.
    tx: Sink,
    /// Documents this client has joined.
    documents: HashSet<String>,
}

impl ClientConnection {
    pub fn new(tx: Sink) -> Self {
        Self {
            id: SubscriberId::next(),
            tx,
            documents: HashSet::new(),
        }
    }

    /// Send a message to this client.
    pub fn send(&self, msg: ServerMessage) -> Result<(), SendError> {
        self.tx
            .send(msg)
            .map_err(|_| SendError::ChannelClosed(self.id))
    }

    /// Send an error message to this client.
    pub fn send_error(
        &self,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Result<(), SendError> {
        self.send(ServerMessage::error(code, message))
    }

    pub fn is_in_document(&self, document_id: &str) -> bool {
        self.documents.contains(document_id)
    }

    pub fn document_count(&self) -> usize {
        self.documents.len()
    }

    /// Handle one text frame from the client.
    pub async fn handle_text(
        &mut self,
        sequencer: &Sequencer,
        text: &str,
    ) -> Result<(), MessageError> {
        let msg =
            ClientMessage::from_json(text).map_err(|e| MessageError::ParseError(e.to_string()))?;

        match msg {
            ClientMessage::Join { document_id } => {
                // The sequencer sends the state message itself.
                match sequencer.join(self.id, self.tx.clone(), &document_id).await {
                    Ok(_) => {
                        self.documents.insert(document_id);
                    }
                    Err(err) => {
                        tracing::debug!("{} failed to join: {}", self.id, err);
                        self.send_error(err.code(), err.to_string())?;
                    }
                }
            }

            ClientMessage::Leave { document_id } => {
                if self.documents.remove(&document_id) {
                    sequencer.leave(self.id, &document_id).await;
                }
            }

            ClientMessage::Mutate {
                document_id,
                request_id,
                params,
            } => {
                if let Err(err) = sequencer
                    .mutate(&document_id, self.id, request_id, params)
                    .await
                {
                    if !err.was_acknowledged() {
                        self.send(ServerMessage::Ack {
                            document_id,
                            request_id,
                            accepted: false,
                        })?;
                        self.send_error(err.code(), err.to_string())?;
                    }
                }
            }

            ClientMessage::Ping => {
                self.send(ServerMessage::Pong)?;
            }
        }

        Ok(())
    }

    /// Leave every joined document.
    pub async fn disconnect(&mut self, sequencer: &Sequencer) {
        sequencer.leave_all(self.id).await;
        self.documents.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_join_and_ping() {
        let sequencer = Sequencer::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut conn = ClientConnection::new(tx);

        conn.handle_text(&sequencer, r#"{"type":"join","documentId":"test"}"#)
            .await
            .unwrap();
        assert!(conn.is_in_document("test"));
        assert!(matches!(rx.recv().await, Some(ServerMessage::State { .. })));

        conn.handle_text(&sequencer, r#"{"type":"ping"}"#).await.unwrap();
        assert_eq!(rx.recv().await, Some(ServerMessage::Pong));
    }

    #[tokio::test]
    async fn test_mutate_without_join_is_nacked() {
        let sequencer = Sequencer::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut conn = ClientConnection::new(tx);

        conn.handle_text(
            &sequencer,
            r#"{"type":"mutate","documentId":"test","requestId":4,"params":{}}"#,
        )
        .await
        .unwrap();

        assert_eq!(
            rx.recv().await,
            Some(ServerMessage::Ack {
                document_id: "test".into(),
                request_id: 4,
                accepted: false
            })
        );
        assert!(matches!(rx.recv().await, Some(ServerMessage::Error { .. })));
    }

    #[tokio::test]
    async fn test_invalid_join_sends_error() {
        let sequencer = Sequencer::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut conn = ClientConnection::new(tx);

        conn.handle_text(&sequencer, r#"{"type":"join","documentId":""}"#)
            .await
            .unwrap();
        assert_eq!(conn.document_count(), 0);
        match rx.recv().await {
            Some(ServerMessage::Error { code, .. }) => assert_eq!(code, "validation"),
            other => panic!("Wrong message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_malformed_frame_is_parse_error() {
        let sequencer = Sequencer::default();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut conn = ClientConnection::new(tx);

        let result = conn.handle_text(&sequencer, "{not json").await;
        assert!(matches!(result, Err(MessageError::ParseError(_))));
    }

    #[tokio::test]
    async fn test_disconnect_leaves_all_rooms() {
        let sequencer = Sequencer::default();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut conn = ClientConnection::new(tx);
        conn.handle_text(&sequencer, r#"{"type":"join","documentId":"a"}"#).await.unwrap();
        conn.handle_text(&sequencer, r#"{"type":"join","documentId":"b"}"#).await.unwrap();

        conn.disconnect(&sequencer).await;
        assert_eq!(sequencer.stats().await.total_subscriptions, 0);
        assert_eq!(conn.document_count(), 0);
    }
}
