//! Error types for the search engine.

use thiserror::Error;

/// Result type alias for search operations.
pub type Result<T> = std::result::Result<T, SearchError>;

/// Errors that fail a query as a whole.
#[derive(Error, Debug)]
pub enum SearchError {
    /// Provider, cache, index or ranking error.
    #[error("embedding error: {0}")]
    Embedding(#[from] embedq_embeddings::EmbeddingError),

    /// Document store error.
    #[error("task store error: {0}")]
    Task(#[from] embedq_tasks::TaskError),

    /// Malformed request.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}
