//! Error types for the embeddings system.

use std::time::Duration;

use thiserror::Error;

/// Result type alias for embedding operations.
pub type Result<T> = std::result::Result<T, EmbeddingError>;

/// How a failure should be treated by callers that retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Worth retrying after a backoff.
    Transient,
    /// Worth retrying, but the provider asked us to slow down.
    RateLimited,
    /// Retrying will not help.
    Permanent,
}

/// Errors that can occur in the embeddings system.
#[derive(Error, Debug)]
pub enum EmbeddingError {
    /// Provider not configured.
    #[error("embedding provider not configured")]
    ProviderNotConfigured,

    /// The provider did not answer in time.
    #[error("embedding request timed out")]
    Timeout,

    /// Rate limit exceeded.
    #[error("rate limit exceeded (retry after {retry_after_secs:?}s)")]
    RateLimited { retry_after_secs: Option<u64> },

    /// The provider rejected the input.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// API request failed on the provider side (5xx, connection reset).
    #[error("API request failed: {0}")]
    ApiRequest(String),

    /// Invalid response from provider.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Unrecoverable provider failure.
    #[error("provider failure: {0}")]
    Fatal(String),

    /// Dimension mismatch.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Text too long for embedding.
    #[error("text too long: {length} characters, max {max_length}")]
    TextTooLong { length: usize, max_length: usize },

    /// Requested page size outside the configured bounds.
    #[error("invalid page size {requested}: must be between 1 and {max}")]
    InvalidPageSize { requested: usize, max: usize },

    /// Cache error.
    #[error("cache error: {0}")]
    Cache(String),

    /// Vector index error.
    #[error("index error: {0}")]
    Index(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error.
    #[error("http error: {0}")]
    Http(reqwest::Error),
}

impl From<reqwest::Error> for EmbeddingError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_connect() {
            Self::ApiRequest(err.to_string())
        } else if err.is_decode() {
            Self::InvalidResponse(err.to_string())
        } else {
            Self::Http(err)
        }
    }
}

impl EmbeddingError {
    /// Classify this error for retry decisions.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Timeout | Self::ApiRequest(_) | Self::Http(_) | Self::Io(_) => {
                ErrorClass::Transient
            }
            Self::RateLimited { .. } => ErrorClass::RateLimited,
            _ => ErrorClass::Permanent,
        }
    }

    /// Whether a retry may succeed.
    pub fn is_transient(&self) -> bool {
        self.class() != ErrorClass::Permanent
    }

    /// Whether the provider signalled back-pressure.
    pub fn is_rate_limited(&self) -> bool {
        self.class() == ErrorClass::RateLimited
    }

    /// Delay the provider asked for, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited {
                retry_after_secs: Some(secs),
            } => Some(Duration::from_secs(*secs)),
            _ => None,
        }
    }
}
