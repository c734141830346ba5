//! Configuration for query-time search.

use embedq_embeddings::{ATTRIBUTE_OVERLAP, SecondaryWeights, index::DEFAULT_MAX_K};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SearchError};

/// Configuration for the search engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Page size used when a request does not name one.
    pub default_page_size: usize,

    /// Largest page size accepted.
    pub max_page_size: usize,

    /// Candidates requested from the vector index per query.
    pub top_k: usize,

    /// Weights applied when a query carries attributes.
    pub weights: SecondaryWeights,

    /// Document field holding the attributes matched against query
    /// attributes (e.g. `skills`). `None` disables the attribute signal.
    pub attribute_field: Option<String>,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_page_size: 50,
            max_page_size: 200,
            top_k: DEFAULT_MAX_K,
            weights: SecondaryWeights::default()
                .with_semantic(0.8)
                .with_signal(ATTRIBUTE_OVERLAP, 0.2),
            attribute_field: Some("skills".to_string()),
        }
    }
}

impl SearchConfig {
    /// Set the page size bounds.
    pub fn with_page_sizes(mut self, default_page_size: usize, max_page_size: usize) -> Self {
        self.default_page_size = default_page_size;
        self.max_page_size = max_page_size;
        self
    }

    /// Set how many candidates to pull from the index.
    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    /// Set the ranking weights.
    pub fn with_weights(mut self, weights: SecondaryWeights) -> Self {
        self.weights = weights;
        self
    }

    /// Set or clear the attribute field.
    pub fn with_attribute_field(mut self, field: Option<String>) -> Self {
        self.attribute_field = field;
        self
    }

    /// Check that the page bounds are usable.
    pub fn validate(&self) -> Result<()> {
        if self.max_page_size == 0 {
            return Err(SearchError::Config(
                "max_page_size must be positive".to_string(),
            ));
        }
        if self.default_page_size == 0 || self.default_page_size > self.max_page_size {
            return Err(SearchError::Config(format!(
                "default_page_size must be between 1 and {}",
                self.max_page_size
            )));
        }
        if self.top_k == 0 {
            return Err(SearchError::Config("top_k must be positive".to_string()));
        }
        Ok(())
    }
}
