//! The room channel contract between an optimistic store and its transport.
//!
//! A room channel delivers the initial snapshot of a document, pushes
//! mutations accepted from other clients, and forwards local mutations to
//! the sequencer for acknowledgement. [`Dispatcher`] is the shared plumbing
//! transports use to route incoming server messages to handlers and to
//! pending acknowledgements.

use crate::mutation::{MutateParams, RoomState};
use crate::protocol::ServerMessage;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::oneshot;

/// Callback invoked for every foreign mutation, in acceptance order.
pub type MutationHandler = Arc<dyn Fn(MutateParams) + Send + Sync>;

/// A per-document subscription to an authoritative sequencer.
#[trait_variant::make(Send)]
pub trait RoomChannel: Send + Sync {
    /// The document this channel is joined to.
    fn document_id(&self) -> &str;

    /// The room state delivered when the channel joined.
    fn initial_state(&self) -> RoomState;

    /// Register a handler for mutations accepted from other clients.
    fn on_mutate(&self, handler: MutationHandler) -> Subscription;

    /// Submit a mutation. Resolves to the server's acknowledgement and
    /// never fails: transport loss resolves to `false`.
    async fn mutate(&self, params: MutateParams) -> bool;

    /// Leave the room.
    async fn leave(&self);
}

/// Guard for a registered handler. Unsubscribes when dropped.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn new<F>(cancel: F) -> Self
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// A subscription with nothing to cancel.
    pub fn detached() -> Self {
        Self { cancel: None }
    }

    pub fn unsubscribe(mut self) {
        self.cancel_now();
    }

    fn cancel_now(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel_now();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

#[derive(Default)]
struct DispatcherState {
    handlers: HashMap<u64, MutationHandler>,
    next_handler: u64,
    acks: HashMap<u64, oneshot::Sender<bool>>,
    next_request: u64,
    closed: bool,
}

/// Routes server messages for one joined document.
///
/// Messages must be dispatched from a single task in the order the server
/// sent them, so that a foreign mutation is always handled before an
/// acknowledgement the server sent after it.
///
/// Acknowledgements only resolve a waiter; the waiting task applies them
/// later. A foreign mutation sent after an acknowledgement can therefore
/// reach the store first. [`SyncEngine::receive`](crate::sync::SyncEngine::receive)
/// accepts that order.
#[derive(Default)]
pub struct Dispatcher {
    state: Mutex<DispatcherState>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DispatcherState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a mutation handler.
    pub fn subscribe(self: &Arc<Self>, handler: MutationHandler) -> Subscription {
        let id = {
            let mut state = self.lock();
            let id = state.next_handler;
            state.next_handler += 1;
            state.handlers.insert(id, handler);
            id
        };

        let dispatcher: Weak<Self> = Arc::downgrade(self);
        Subscription::new(move || {
            if let Some(dispatcher) = dispatcher.upgrade() {
                dispatcher.lock().handlers.remove(&id);
            }
        })
    }

    /// Allocate a request id and the receiver its acknowledgement resolves.
    ///
    /// After [`Dispatcher::close`] the receiver resolves immediately.
    pub fn expect_ack(&self) -> (u64, oneshot::Receiver<bool>) {
        let (tx, rx) = oneshot::channel();
        let mut state = self.lock();
        let request_id = state.next_request;
        state.next_request += 1;
        if !state.closed {
            state.acks.insert(request_id, tx);
        }
        (request_id, rx)
    }

    /// Abandon a request; its receiver resolves as rejected.
    pub fn cancel(&self, request_id: u64) {
        self.lock().acks.remove(&request_id);
    }

    pub fn resolve_ack(&self, request_id: u64, accepted: bool) {
        let waiter = self.lock().acks.remove(&request_id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(accepted);
            }
            None => tracing::debug!("Acknowledgement for unknown request {}", request_id),
        }
    }

    /// Hand a foreign mutation to every registered handler.
    pub fn deliver(&self, params: MutateParams) {
        let handlers: Vec<MutationHandler> = self.lock().handlers.values().cloned().collect();
        for handler in handlers {
            handler(params.clone());
        }
    }

    /// Route one server message.
    pub fn dispatch(&self, message: ServerMessage) {
        match message {
            ServerMessage::Mutation { params, .. } => self.deliver(params),
            ServerMessage::Ack {
                request_id,
                accepted,
                ..
            } => self.resolve_ack(request_id, accepted),
            ServerMessage::State { document_id, .. } => {
                tracing::debug!("Ignoring repeated state for {}", document_id);
            }
            ServerMessage::Error { code, message } => {
                tracing::warn!("Server error [{}]: {}", code, message);
            }
            ServerMessage::Pong => {}
        }
    }

    /// Reject every outstanding and future request.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.acks.clear();
    }

    pub fn pending_acks(&self) -> usize {
        self.lock().acks.len()
    }
}

/// Await an acknowledgement; a dropped sender counts as a rejection.
pub async fn wait_ack(ack: oneshot::Receiver<bool>) -> bool {
    ack.await.unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutation::Mutation;
    use crate::ids::MutationId;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn params() -> MutateParams {
        MutateParams::new(MutationId::new(), Mutation::new(Vec::new()))
    }

    #[tokio::test]
    async fn test_ack_resolution() {
        let dispatcher = Dispatcher::new();
        let (first, first_rx) = dispatcher.expect_ack();
        let (second, second_rx) = dispatcher.expect_ack();
        assert_ne!(first, second);

        dispatcher.resolve_ack(second, false);
        dispatcher.resolve_ack(first, true);
        assert!(wait_ack(first_rx).await);
        assert!(!wait_ack(second_rx).await);
        assert_eq!(dispatcher.pending_acks(), 0);
    }

    #[tokio::test]
    async fn test_close_rejects_outstanding_and_future_requests() {
        let dispatcher = Dispatcher::new();
        let (_, pending) = dispatcher.expect_ack();
        dispatcher.close();
        let (_, later) = dispatcher.expect_ack();

        assert!(!wait_ack(pending).await);
        assert!(!wait_ack(later).await);
    }

    #[tokio::test]
    async fn test_cancel_rejects() {
        let dispatcher = Dispatcher::new();
        let (request_id, rx) = dispatcher.expect_ack();
        dispatcher.cancel(request_id);
        assert!(!wait_ack(rx).await);
    }

    #[test]
    fn test_subscription_drop_unsubscribes() {
        let dispatcher = Arc::new(Dispatcher::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&calls);
        let subscription = dispatcher.subscribe(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        dispatcher.deliver(params());
        drop(subscription);
        dispatcher.deliver(params());

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dispatch_routes_mutations() {
        let dispatcher = Arc::new(Dispatcher::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let _subscription = dispatcher.subscribe(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        dispatcher.dispatch(ServerMessage::Mutation {
            document_id: "doc".into(),
            params: params(),
        });
        dispatcher.dispatch(ServerMessage::Pong);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
