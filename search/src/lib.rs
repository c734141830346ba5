//! # Embedding Search
//!
//! Query-time semantic search over documents whose embeddings were produced
//! by `embedq-tasks`.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       Search Engine                             │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  query text ──► EmbeddingCache ──► VectorIndex (top-k)          │
//! │                                         │                       │
//! │                                         ▼                       │
//! │               DocumentStore (ready?) ──► SimilarityRanker       │
//! │                                         │                       │
//! │                                         ▼                       │
//! │                                  SearchResponse                 │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use embedq_search::{SearchEngine, SearchRequest};
//!
//! let engine = SearchEngine::new(config, cache, index, store, "text-embedding-3-small")?;
//! let response = engine
//!     .search(&SearchRequest::new("backend engineer").with_attributes(["rust"]))
//!     .await?;
//! ```

pub mod config;
pub mod engine;
pub mod error;

pub use config::SearchConfig;
pub use engine::{SearchEngine, SearchRequest, SearchResponse, load_ready_documents};
pub use error::{Result, SearchError};
