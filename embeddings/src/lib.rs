//! # Embeddings
//!
//! Text-to-vector plumbing shared by the backfill workers and the query path.
//!
//! ## Features
//!
//! - **Provider Adapter**: Retry, backoff and error classification around an
//!   external embedding provider
//! - **Embedding Cache**: Two-tier cache for query-time embeddings
//! - **Similarity Ranking**: Deterministic, paginated ordering with optional
//!   secondary signals
//! - **Vector Index**: Pluggable top-k lookup over stored vectors
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    Embeddings System                            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  EmbeddingProvider ──► ProviderAdapter ──► EmbeddingCache       │
//! │       │                     │                   │               │
//! │       ▼                     ▼                   ▼               │
//! │  OpenAI/Hash           RetryPolicy     LRU tier + CacheStore    │
//! │                                                                 │
//! │  VectorIndex ──► top-k candidates ──► SimilarityRanker          │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod index;
pub mod provider;
pub mod retry;
pub mod similarity;

pub use cache::{
    CacheEntry, CacheSource, CacheStats, CacheStore, CachedEmbedding, EmbeddingCache,
    FileCacheStore, MemoryCacheStore, fingerprint,
};
pub use config::{CacheConfig, ProviderConfig};
pub use error::{EmbeddingError, ErrorClass, Result};
pub use index::{IndexHit, MemoryVectorIndex, MetadataFilter, VectorIndex};
pub use provider::{
    EmbeddingProvider, EmbeddingRequest, EmbeddingResponse, HashProvider, OpenAIProvider,
};
pub use retry::{NoopObserver, ProviderAdapter, RetryObserver, RetryPolicy};
pub use similarity::{
    ATTRIBUTE_OVERLAP, PageRequest, RankCandidate, RankedPage, RankedResult, SecondaryWeights,
    SimilarityRanker, attribute_overlap, cosine_similarity,
};

/// A dense vector embedding.
pub type Embedding = Vec<f32>;

/// Dimension of embeddings (varies by model).
pub const DEFAULT_DIMENSION: usize = 1536; // OpenAI text-embedding-3-small
