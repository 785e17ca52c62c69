//! Optimistic synchronization of shared templates.
//!
//! Clients edit a local copy of a [`Template`](doc_model::Template)
//! immediately and reconcile against an authoritative, server-ordered
//! mutation log.
//!
//! # Modules
//!
//! - `mutation`: mutations, mutate requests and the authoritative room state
//! - `intent`: re-runnable local edits
//! - `history`: undo/redo stacks built from inverse patches
//! - `sync`: the I/O-free client state machine (queue, rebase, history)
//! - `room`: the room channel contract shared by every transport
//! - `store`: the async optimistic store and its broadcast worker
//! - `sequencer`: the authoritative compare-and-swap acceptor
//! - `protocol`: JSON wire messages
//! - `local`: in-process room channel
//! - `server` / `client`: WebSocket transport (behind features)
//!
//! # Example
//!
//! ```
//! use collab::{Intent, LocalRoom, OptimisticStore, Sequencer};
//! use doc_model::TemplateEdit;
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let sequencer = Arc::new(Sequencer::default());
//! let store = OptimisticStore::new(LocalRoom::join(sequencer.clone(), "test").await.unwrap());
//!
//! store
//!     .mutate_with_history(Intent::edit(TemplateEdit::Resize { width: 100, height: 100 }))
//!     .unwrap();
//! store.flush().await.unwrap();
//!
//! let state = sequencer.state("test").await.unwrap();
//! assert_eq!(state.template.color, "blue");
//! # }
//! ```

pub mod error;
pub mod history;
pub mod ids;
pub mod intent;
pub mod local;
pub mod mutation;
pub mod protocol;
pub mod room;
pub mod sequencer;
pub mod store;
pub mod sync;

/// WebSocket sync server.
///
/// This module is only available when the `server` feature is enabled.
#[cfg(feature = "server")]
pub mod server;

/// WebSocket room channel.
///
/// This module is only available when the `client` feature is enabled.
#[cfg(feature = "client")]
pub mod client;

// Re-export commonly used types
pub use error::{CollabError, CollabResult, IntentError};
pub use history::{History, DEFAULT_HISTORY_LIMIT};
pub use ids::{IntentId, MutationId, SubscriberId};
pub use intent::Intent;
pub use local::LocalRoom;
pub use mutation::{MutateParams, Mutation, RoomState};
pub use protocol::{ClientMessage, ServerMessage};
pub use room::{Dispatcher, MutationHandler, RoomChannel, Subscription};
pub use sequencer::{Sequencer, SequencerConfig, SequencerError, SequencerStats};
pub use store::{ListenerId, OptimisticStore, StoreConfig};
pub use sync::{AckOutcome, Applied, RebaseReport, StoreEvent, SyncEngine, SyncStatus};
