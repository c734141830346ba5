//! Configuration for the provider adapter and the embedding cache.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::DEFAULT_DIMENSION;
use crate::retry::RetryPolicy;

/// Configuration for the embedding provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Model identifier sent to the provider and recorded on results.
    pub model: String,

    /// Expected vector dimension. Anything else is rejected.
    pub dimension: usize,

    /// API base URL.
    pub base_url: String,

    /// API key. Usually supplied through the environment.
    #[serde(skip_serializing)]
    pub api_key: Option<String>,

    /// Per-request timeout (in seconds).
    pub request_timeout_secs: u64,

    /// Whether to ask the provider for `dimension`-sized output.
    pub request_dimensions: bool,

    /// Retry behaviour for transient failures.
    pub retry: RetryPolicy,
}

impl ProviderConfig {
    /// Create a configuration for the given model and dimension.
    pub fn new(model: impl Into<String>, dimension: usize) -> Self {
        Self {
            model: model.into(),
            dimension,
            ..Self::default()
        }
    }

    /// Set the API key.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Set the base URL.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Per-request timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            model: "text-embedding-3-small".to_string(),
            dimension: DEFAULT_DIMENSION,
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            request_timeout_secs: 30,
            request_dimensions: false,
            retry: RetryPolicy::default(),
        }
    }
}

/// Configuration for the two-tier embedding cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Lifetime of an entry in the persistent tier (in seconds).
    pub ttl_secs: u64,

    /// Capacity of the in-process LRU tier.
    pub capacity: usize,

    /// File backing the persistent tier. In-memory when unset.
    pub path: Option<PathBuf>,
}

impl CacheConfig {
    /// Set the entry lifetime.
    pub fn with_ttl_secs(mut self, ttl_secs: u64) -> Self {
        self.ttl_secs = ttl_secs;
        self
    }

    /// Set the in-process capacity.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Persist the shared tier to a file.
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 7 * 24 * 3600,
            capacity: 10_000,
            path: None,
        }
    }
}
