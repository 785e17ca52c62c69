//! Error types for document model operations

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DocModelError {
    #[error("Path not found: {0}")]
    PathNotFound(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Index {index} out of bounds at {path} (length {len})")]
    InvalidIndex {
        path: String,
        index: usize,
        len: usize,
    },

    #[error("Patched value does not match the document shape: {0}")]
    Shape(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, DocModelError>;
