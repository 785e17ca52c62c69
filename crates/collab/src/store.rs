//! Optimistic document store.
//!
//! [`OptimisticStore`] binds a [`SyncEngine`] to a [`RoomChannel`]. Edits
//! are applied to the local template immediately; a background worker sends
//! the pending queue to the sequencer one mutation at a time, in submission
//! order. Foreign mutations delivered by the room rebase the queue.
//!
//! The store must be created inside a Tokio runtime.

use crate::error::{CollabError, CollabResult};
use crate::history::{History, DEFAULT_HISTORY_LIMIT};
use crate::intent::Intent;
use crate::mutation::{MutateParams, RoomState};
use crate::room::{RoomChannel, Subscription};
use crate::sync::{AckOutcome, Applied, RebaseReport, StoreEvent, SyncEngine, SyncStatus};
use doc_model::Template;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

/// Store configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Maximum number of undo entries kept.
    pub history_limit: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

/// Store event callback.
pub type Listener = Arc<dyn Fn(&StoreEvent) + Send + Sync>;

/// Handle returned by [`OptimisticStore::subscribe`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Shared<R> {
    engine: Mutex<SyncEngine>,
    room: R,
    wake: Notify,
    listeners: Mutex<Vec<(ListenerId, Listener)>>,
    next_listener: AtomicU64,
    status: watch::Sender<SyncStatus>,
}

impl<R: RoomChannel> Shared<R> {
    fn engine(&self) -> MutexGuard<'_, SyncEngine> {
        self.engine.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` against the engine, then publish status and events.
    ///
    /// Listeners are called after the engine lock is released.
    fn with_engine<T>(&self, f: impl FnOnce(&mut SyncEngine) -> T) -> T {
        let (result, events) = {
            let mut engine = self.engine();
            let result = f(&mut engine);
            self.status.send_replace(engine.status());
            (result, engine.take_events())
        };
        self.emit(&events);
        result
    }

    fn emit(&self, events: &[StoreEvent]) {
        if events.is_empty() {
            return;
        }
        let listeners: Vec<Listener> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for event in events {
            for listener in &listeners {
                listener(event);
            }
        }
    }

    fn receive(&self, params: MutateParams) {
        let mutation_id = params.mutation.id;
        match self.with_engine(|engine| engine.receive(params)) {
            Ok(report) => tracing::debug!(
                "Folded in foreign mutation {}: {} reapplied, {} absorbed, {} dropped",
                mutation_id,
                report.reapplied,
                report.absorbed.len(),
                report.dropped.len()
            ),
            Err(err) => {
                tracing::warn!("Could not fold in foreign mutation {}: {}", mutation_id, err)
            }
        }
        self.wake.notify_one();
    }
}

/// Send pending mutations one at a time until the store is dropped.
async fn broadcast_loop<R: RoomChannel>(shared: Arc<Shared<R>>) {
    loop {
        let Some(params) = shared.with_engine(|engine| engine.next_request()) else {
            shared.wake.notified().await;
            continue;
        };

        let mutation_id = params.mutation.id;
        tracing::debug!(
            "Sending mutation {} based on {} to {}",
            mutation_id,
            params.last_mutation_id,
            shared.room.document_id()
        );

        let accepted = shared.room.mutate(params).await;
        match shared.with_engine(|engine| engine.acknowledge(mutation_id, accepted)) {
            AckOutcome::Confirmed => tracing::debug!("Mutation {} confirmed", mutation_id),
            AckOutcome::Superseded => {
                tracing::debug!("Mutation {} superseded by rebase", mutation_id)
            }
            AckOutcome::Desynced => {
                tracing::warn!("Broadcast halted on {}: resync required", shared.room.document_id())
            }
            AckOutcome::Ignored => {}
        }
    }
}

/// Client-side optimistic store for one joined document.
pub struct OptimisticStore<R: RoomChannel + 'static> {
    shared: Arc<Shared<R>>,
    subscription: Option<Subscription>,
    worker: JoinHandle<()>,
}

impl<R: RoomChannel + 'static> OptimisticStore<R> {
    pub fn new(room: R) -> Self {
        Self::with_config(room, StoreConfig::default())
    }

    /// Create a store seeded with the room's initial state.
    pub fn with_config(room: R, config: StoreConfig) -> Self {
        let engine = SyncEngine::with_history(
            room.initial_state(),
            History::with_limit(config.history_limit),
        );
        let (status, _) = watch::channel(engine.status());

        let shared = Arc::new(Shared {
            engine: Mutex::new(engine),
            room,
            wake: Notify::new(),
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(1),
            status,
        });

        let weak = Arc::downgrade(&shared);
        let subscription = shared.room.on_mutate(Arc::new(move |params: MutateParams| {
            if let Some(shared) = weak.upgrade() {
                shared.receive(params);
            }
        }));

        let worker = tokio::spawn(broadcast_loop(Arc::clone(&shared)));
        tracing::info!("Optimistic store attached to {}", shared.room.document_id());

        Self {
            shared,
            subscription: Some(subscription),
            worker,
        }
    }

    pub fn room(&self) -> &R {
        &self.shared.room
    }

    pub fn document_id(&self) -> &str {
        self.shared.room.document_id()
    }

    /// Snapshot of the local speculative template.
    pub fn template(&self) -> Template {
        self.shared.engine().template().clone()
    }

    /// Snapshot of the last known authoritative state.
    pub fn server_state(&self) -> RoomState {
        self.shared.engine().server_state().clone()
    }

    pub fn status(&self) -> SyncStatus {
        self.shared.engine().status()
    }

    pub fn pending_len(&self) -> usize {
        self.shared.engine().pending_len()
    }

    pub fn can_undo(&self) -> bool {
        self.shared.engine().can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.shared.engine().can_redo()
    }

    /// Apply an intent optimistically and queue it for the sequencer.
    ///
    /// Returns `None` for a no-op edit.
    pub fn mutate(&self, intent: Intent) -> CollabResult<Option<Applied>> {
        self.submit(|engine| engine.mutate(intent))
    }

    /// Like [`OptimisticStore::mutate`], recording the edit for undo.
    pub fn mutate_with_history(&self, intent: Intent) -> CollabResult<Option<Applied>> {
        self.submit(|engine| engine.mutate_with_history(intent))
    }

    pub fn undo(&self) -> CollabResult<bool> {
        self.submit(SyncEngine::undo)
    }

    pub fn redo(&self) -> CollabResult<bool> {
        self.submit(SyncEngine::redo)
    }

    fn submit<T>(&self, f: impl FnOnce(&mut SyncEngine) -> CollabResult<T>) -> CollabResult<T> {
        let result = self.shared.with_engine(f);
        self.shared.wake.notify_one();
        result
    }

    /// Install a fresh authoritative state and restart broadcasting.
    ///
    /// This is the recovery hook for [`StoreEvent::Desynced`]; obtaining the
    /// state (for example by rejoining the room) is up to the caller.
    pub fn resync(&self, state: RoomState) -> RebaseReport {
        let report = self.shared.with_engine(|engine| engine.resync(state));
        self.shared.wake.notify_one();
        report
    }

    /// Wait until every pending edit is confirmed.
    ///
    /// Fails with [`CollabError::Desynced`] if the store desyncs first.
    pub async fn flush(&self) -> CollabResult<()> {
        let mut status = self.shared.status.subscribe();
        loop {
            let current = *status.borrow_and_update();
            match current {
                SyncStatus::Synced => return Ok(()),
                SyncStatus::Desynced => return Err(CollabError::Desynced),
                SyncStatus::Pending => {}
            }
            if status.changed().await.is_err() {
                return Err(CollabError::Communication("store closed".to_string()));
            }
        }
    }

    /// Register a listener for store events.
    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&StoreEvent) + Send + Sync + 'static,
    {
        let id = ListenerId(self.shared.next_listener.fetch_add(1, Ordering::Relaxed));
        self.shared
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener. Returns whether it was registered.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self
            .shared
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() != before
    }

    /// Stop synchronizing and leave the room.
    ///
    /// Unconfirmed edits are discarded.
    pub async fn leave(mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
        self.worker.abort();
        self.shared.room.leave().await;
        tracing::info!("Left {}", self.shared.room.document_id());
    }
}

impl<R: RoomChannel + 'static> Drop for OptimisticStore<R> {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutation::Mutation;
    use crate::room::{Dispatcher, MutationHandler};
    use doc_model::{Patch, Size, TemplateEdit};
    use serde_json::json;
    use std::sync::atomic::AtomicBool;

    /// Room that acknowledges according to a flag and records requests.
    struct ScriptedRoom {
        initial: RoomState,
        accept: AtomicBool,
        sent: Mutex<Vec<MutateParams>>,
        /// Patches delivered as a foreign mutation built on the next request,
        /// before that request is acknowledged.
        successor: Mutex<Option<Vec<Patch>>>,
        dispatcher: Arc<Dispatcher>,
    }

    impl ScriptedRoom {
        fn new(accept: bool) -> Self {
            Self {
                initial: RoomState::new(Template::new("doc")),
                accept: AtomicBool::new(accept),
                sent: Mutex::new(Vec::new()),
                successor: Mutex::new(None),
                dispatcher: Arc::new(Dispatcher::new()),
            }
        }
    }

    impl RoomChannel for ScriptedRoom {
        fn document_id(&self) -> &str {
            "doc"
        }

        fn initial_state(&self) -> RoomState {
            self.initial.clone()
        }

        fn on_mutate(&self, handler: MutationHandler) -> Subscription {
            self.dispatcher.subscribe(handler)
        }

        async fn mutate(&self, params: MutateParams) -> bool {
            let successor = self.successor.lock().unwrap().take();
            if let Some(patches) = successor {
                self.dispatcher
                    .deliver(MutateParams::new(params.mutation.id, Mutation::new(patches)));
            }
            self.sent.lock().unwrap().push(params);
            self.accept.load(Ordering::SeqCst)
        }

        async fn leave(&self) {
            self.dispatcher.close();
        }
    }

    fn resize(width: u32, height: u32) -> Intent {
        Intent::edit(TemplateEdit::Resize { width, height })
    }

    #[tokio::test]
    async fn test_mutate_then_flush() {
        let store = OptimisticStore::new(ScriptedRoom::new(true));
        let applied = store.mutate_with_history(resize(100, 100)).unwrap().unwrap();

        assert_eq!(store.template().size, Size::new(100, 100));
        store.flush().await.unwrap();

        assert_eq!(store.status(), SyncStatus::Synced);
        assert_eq!(store.server_state().last_mutation_id, applied.mutation.id);
        assert_eq!(store.server_state().template, store.template());
        assert_eq!(store.room().sent.lock().unwrap().len(), 1);
        assert!(store.can_undo());
    }

    #[tokio::test]
    async fn test_flush_reports_desync() {
        let store = OptimisticStore::new(ScriptedRoom::new(false));
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        store.subscribe(move |event| sink.lock().unwrap().push(event.clone()));

        store.mutate(resize(10, 10)).unwrap();
        assert!(matches!(store.flush().await, Err(CollabError::Desynced)));

        let events = events.lock().unwrap();
        assert_eq!(events[0], StoreEvent::Changed);
        assert!(matches!(events.last(), Some(StoreEvent::Desynced { .. })));
    }

    #[tokio::test]
    async fn test_resync_restarts_worker() {
        let store = OptimisticStore::new(ScriptedRoom::new(false));
        store.mutate(resize(10, 10)).unwrap();
        assert!(store.flush().await.is_err());

        store.room().accept.store(true, Ordering::SeqCst);
        let fresh = RoomState::new(Template::new("doc"));
        let report = store.resync(fresh.clone());
        assert_eq!(report.reapplied, 1);

        store.flush().await.unwrap();
        assert_eq!(store.template().size, Size::new(10, 10));
        assert_ne!(store.server_state().last_mutation_id, fresh.last_mutation_id);
    }

    #[tokio::test]
    async fn test_foreign_mutation_notifies_listeners() {
        let store = OptimisticStore::new(ScriptedRoom::new(true));
        let changes = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&changes);
        let id = store.subscribe(move |event| {
            if *event == StoreEvent::Changed {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        let base = store.server_state();
        let produced = doc_model::produce_with_patches(&base.template, |draft: &mut Template| {
            draft.recolor("green");
            Ok::<(), doc_model::DocModelError>(())
        })
        .unwrap();
        let params = MutateParams::new(base.last_mutation_id, Mutation::new(produced.patches));
        store.room().dispatcher.deliver(params);

        assert_eq!(store.template().color, "green");
        assert_eq!(changes.load(Ordering::SeqCst), 1);
        assert!(store.unsubscribe(id));
        assert!(!store.unsubscribe(id));
    }

    #[tokio::test]
    async fn test_leave_stops_delivery() {
        let store = OptimisticStore::new(ScriptedRoom::new(true));
        let dispatcher = Arc::clone(&store.room().dispatcher);
        store.leave().await;

        // Nothing is subscribed anymore.
        dispatcher.deliver(MutateParams::new(
            crate::ids::MutationId::new(),
            Mutation::new(Vec::new()),
        ));
        assert_eq!(dispatcher.pending_acks(), 0);
    }

    #[tokio::test]
    async fn test_noop_edit_is_not_sent() {
        let store = OptimisticStore::new(ScriptedRoom::new(true));
        let same_color = Intent::edit(TemplateEdit::Recolor {
            color: "red".into(),
        });
        assert!(store.mutate_with_history(same_color).unwrap().is_none());
        store.flush().await.unwrap();
        assert!(store.room().sent.lock().unwrap().is_empty());
        assert!(!store.can_undo());
    }

    #[tokio::test]
    async fn test_successor_before_ack_keeps_store_in_sync() {
        let store = OptimisticStore::new(ScriptedRoom::new(true));
        let desyncs = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&desyncs);
        store.subscribe(move |event| {
            if matches!(event, StoreEvent::Desynced { .. }) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        *store.room().successor.lock().unwrap() =
            Some(vec![Patch::replace(vec!["color".into()], json!("green"))]);
        let applied = store.mutate(resize(100, 50)).unwrap().unwrap();
        store.flush().await.unwrap();

        assert_eq!(desyncs.load(Ordering::SeqCst), 0);
        assert_eq!(store.status(), SyncStatus::Synced);
        assert_eq!(store.template().size, Size::new(100, 50));
        assert_eq!(store.template().color, "green");
        assert_eq!(store.server_state().template, store.template());
        assert_ne!(store.server_state().last_mutation_id, applied.mutation.id);
    }
}
