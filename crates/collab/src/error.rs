//! Error types for the collaboration crate.

use crate::ids::MutationId;
use doc_model::DocModelError;
use thiserror::Error;

/// Result type alias for collaboration operations.
pub type CollabResult<T> = Result<T, CollabError>;

/// Error returned by an intent recipe that refuses to apply.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Intent rejected: {0}")]
pub struct IntentError(pub String);

impl IntentError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

impl From<DocModelError> for IntentError {
    fn from(err: DocModelError) -> Self {
        Self(err.to_string())
    }
}

/// Errors that can occur during collaboration operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CollabError {
    /// A patch could not be produced or applied.
    #[error("Patch error: {0}")]
    Patch(#[from] DocModelError),

    /// An intent recipe failed.
    #[error(transparent)]
    Intent(#[from] IntentError),

    /// A foreign mutation did not follow the last known mutation.
    #[error("Client is out of sync: expected predecessor {expected}, got {actual}")]
    OutOfSync {
        expected: MutationId,
        actual: MutationId,
    },

    /// The store lost track of the authoritative state and needs a resync.
    #[error("Store is desynchronized and needs a full resync")]
    Desynced,

    /// A request or payload failed schema validation.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Serialization or deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Network or communication error.
    #[error("Communication error: {0}")]
    Communication(String),
}

impl From<serde_json::Error> for CollabError {
    fn from(err: serde_json::Error) -> Self {
        CollabError::Serialization(err.to_string())
    }
}
