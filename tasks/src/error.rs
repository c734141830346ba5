//! Error types for the task system.

use embedq_embeddings::EmbeddingError;
use thiserror::Error;

/// Result type alias for task operations.
pub type Result<T> = std::result::Result<T, TaskError>;

/// Errors that can occur while coordinating embedding tasks.
///
/// Per-task provider failures are recorded on the document and never surface
/// here; these are failures of the machinery itself.
#[derive(Error, Debug)]
pub enum TaskError {
    /// Embedding layer error.
    #[error("embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    /// Document store operation failed.
    #[error("store error: {0}")]
    Store(String),

    /// Another open store holds the lock on this path.
    #[error("store is in use by another process: {0}")]
    StoreLocked(String),

    /// Document not found.
    #[error("document not found: {0}")]
    NotFound(String),

    /// Document already exists.
    #[error("document already exists: {0}")]
    AlreadyExists(String),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The worker pool stopped handing out slots.
    #[error("worker pool closed")]
    PoolClosed,

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}
