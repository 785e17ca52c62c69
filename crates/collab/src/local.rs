//! In-process room channel bound directly to a [`Sequencer`].

use crate::ids::SubscriberId;
use crate::mutation::{MutateParams, RoomState};
use crate::protocol::ServerMessage;
use crate::room::{wait_ack, Dispatcher, MutationHandler, RoomChannel, Subscription};
use crate::sequencer::{Sequencer, SequencerError};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A room channel that talks to a sequencer living in the same process.
///
/// Messages still travel through the subscriber's ordered channel, so the
/// delivery order matches what a networked client observes.
pub struct LocalRoom {
    sequencer: Arc<Sequencer>,
    document_id: String,
    subscriber: SubscriberId,
    initial: RoomState,
    dispatcher: Arc<Dispatcher>,
    reader: JoinHandle<()>,
}

impl LocalRoom {
    /// Join `document_id` on `sequencer`.
    pub async fn join(
        sequencer: Arc<Sequencer>,
        document_id: impl Into<String>,
    ) -> Result<Self, SequencerError> {
        let document_id = document_id.into();
        let subscriber = SubscriberId::next();
        let (tx, rx) = mpsc::unbounded_channel();

        let initial = sequencer.join(subscriber, tx, &document_id).await?;
        let dispatcher = Arc::new(Dispatcher::new());
        let reader = tokio::spawn(pump(rx, Arc::clone(&dispatcher)));

        Ok(Self {
            sequencer,
            document_id,
            subscriber,
            initial,
            dispatcher,
            reader,
        })
    }

    pub fn subscriber(&self) -> SubscriberId {
        self.subscriber
    }
}

async fn pump(mut rx: mpsc::UnboundedReceiver<ServerMessage>, dispatcher: Arc<Dispatcher>) {
    while let Some(message) = rx.recv().await {
        dispatcher.dispatch(message);
    }
    dispatcher.close();
}

impl RoomChannel for LocalRoom {
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

        match serde_json::to_value(&params) {
            Ok(payload) => {
                if let Err(err) = self
                    .sequencer
                    .mutate(&self.document_id, self.subscriber, request_id, payload)
                    .await
                {
                    tracing::debug!("Mutation {} rejected: {}", params.mutation.id, err);
                    if !err.was_acknowledged() {
                        self.dispatcher.cancel(request_id);
                    }
                }
            }
            Err(err) => {
                tracing::error!("Failed to serialize mutation {}: {}", params.mutation.id, err);
                self.dispatcher.cancel(request_id);
            }
        }

        wait_ack(ack).await
    }

    async fn leave(&self) {
        self.sequencer.leave(self.subscriber, &self.document_id).await;
        self.dispatcher.close();
        self.reader.abort();
    }
}

impl Drop for LocalRoom {
    fn drop(&mut self) {
        self.dispatcher.close();
        self.reader.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutation::Mutation;
    use doc_model::Patch;
    use serde_json::json;

    #[tokio::test]
    async fn test_join_delivers_initial_state() {
        let sequencer = Arc::new(Sequencer::default());
        let room = LocalRoom::join(Arc::clone(&sequencer), "test").await.unwrap();

        assert_eq!(room.document_id(), "test");
        assert_eq!(Some(room.initial_state()), sequencer.state("test").await);
        assert_eq!(sequencer.subscriber_count("test").await, 1);
    }

    #[tokio::test]
    async fn test_mutate_resolves_acknowledgement() {
        let sequencer = Arc::new(Sequencer::default());
        let room = LocalRoom::join(Arc::clone(&sequencer), "test").await.unwrap();
        let base = room.initial_state().last_mutation_id;

        let mutation = Mutation::new(vec![Patch::replace(vec!["color".into()], json!("green"))]);
        assert!(room.mutate(MutateParams::new(base, mutation.clone())).await);

        // Same predecessor again: stale.
        let again = Mutation::new(vec![Patch::replace(vec!["color".into()], json!("pink"))]);
        assert!(!room.mutate(MutateParams::new(base, again)).await);

        let state = sequencer.state("test").await.unwrap();
        assert_eq!(state.last_mutation_id, mutation.id);
        assert_eq!(state.template.color, "green");
    }

    #[tokio::test]
    async fn test_mutate_after_leave_is_rejected() {
        let sequencer = Arc::new(Sequencer::default());
        let room = LocalRoom::join(Arc::clone(&sequencer), "test").await.unwrap();
        let base = room.initial_state().last_mutation_id;
        room.leave().await;

        let mutation = Mutation::new(vec![Patch::replace(vec!["color".into()], json!("green"))]);
        assert!(!room.mutate(MutateParams::new(base, mutation)).await);
        assert_eq!(sequencer.subscriber_count("test").await, 0);
    }
}
