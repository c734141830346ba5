//! Vector index for nearest-neighbour lookups over stored document vectors.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::Embedding;
use crate::error::{EmbeddingError, Result};
use crate::similarity::{cosine_similarity, normalize};

/// Largest `k` a vector index answers by default.
pub const DEFAULT_MAX_K: usize = 100;

/// Equality filter over document metadata.
///
/// A condition matches when the metadata value equals the expected value, or
/// when the metadata value is an array containing it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetadataFilter {
    conditions: BTreeMap<String, Value>,
}

impl MetadataFilter {
    /// A filter that matches everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `key` to match `value`.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions.insert(key.into(), value.into());
        self
    }

    /// Whether no condition is set.
    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    /// Check the filter against a metadata object.
    pub fn matches(&self, metadata: Option<&Value>) -> bool {
        self.conditions.iter().all(|(key, expected)| {
            match metadata.and_then(|m| m.get(key)) {
                Some(Value::Array(items)) if !expected.is_array() => items.contains(expected),
                Some(actual) => actual == expected,
                None => false,
            }
        })
    }
}

/// A document returned by a vector lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexHit {
    /// Document identifier.
    pub document_id: String,

    /// Cosine similarity to the query.
    pub score: f32,

    /// The stored vector, for re-ranking.
    pub embedding: Embedding,

    /// Associated metadata.
    pub metadata: Option<Value>,
}

/// Nearest-neighbour search over ready document vectors.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Largest `k` honoured; larger requests are clamped.
    fn max_k(&self) -> usize;

    /// Up to `k` documents most similar to `query` that match `filter`.
    async fn top_k(&self, query: &[f32], k: usize, filter: &MetadataFilter)
    -> Result<Vec<IndexHit>>;
}

#[derive(Debug, Clone)]
struct IndexEntry {
    embedding: Embedding,
    metadata: Option<Value>,
}

/// An exhaustive in-memory vector index.
pub struct MemoryVectorIndex {
    entries: RwLock<HashMap<String, IndexEntry>>,
    dimension: usize,
    max_k: usize,
}

impl MemoryVectorIndex {
    /// Create an index for vectors of `dimension`.
    pub fn new(dimension: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            dimension,
            max_k: DEFAULT_MAX_K,
        }
    }

    /// Override the largest `k` answered.
    pub fn with_max_k(mut self, max_k: usize) -> Self {
        self.max_k = max_k.max(1);
        self
    }

    /// Expected vector dimension.
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Insert or replace a document vector.
    pub async fn upsert(
        &self,
        id: impl Into<String>,
        mut embedding: Embedding,
        metadata: Option<Value>,
    ) -> Result<()> {
        let id = id.into();

        if embedding.len() != self.dimension {
            return Err(EmbeddingError::DimensionMismatch {
                expected: self.dimension,
                actual: embedding.len(),
            });
        }

        normalize(&mut embedding);
        self.entries
            .write()
            .await
            .insert(id.clone(), IndexEntry { embedding, metadata });
        debug!("Indexed vector for {id}");

        Ok(())
    }

    /// Remove a document vector. Returns whether it was present.
    pub async fn remove(&self, id: &str) -> bool {
        self.entries.write().await.remove(id).is_some()
    }

    /// Whether a document is indexed.
    pub async fn contains(&self, id: &str) -> bool {
        self.entries.read().await.contains_key(id)
    }

    /// Number of indexed vectors.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether the index is empty.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Drop every vector.
    pub async fn clear(&self) {
        self.entries.write().await.clear();
        info!("Cleared vector index");
    }
}

#[async_trait]
impl VectorIndex for MemoryVectorIndex {
    fn max_k(&self) -> usize {
        self.max_k
    }

    async fn top_k(
        &self,
        query: &[f32],
        k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<IndexHit>> {
        if query.len() != self.dimension {
            return Err(EmbeddingError::DimensionMismatch {
                expected: self.dimension,
                actual: query.len(),
            });
        }

        let k = k.min(self.max_k);
        if k == 0 {
            return Ok(Vec::new());
        }

        let entries = self.entries.read().await;
        let mut hits = Vec::new();
        for (id, entry) in entries.iter() {
            if !filter.matches(entry.metadata.as_ref()) {
                continue;
            }
            hits.push(IndexHit {
                document_id: id.clone(),
                score: cosine_similarity(query, &entry.embedding)?,
                embedding: entry.embedding.clone(),
                metadata: entry.metadata.clone(),
            });
        }
        drop(entries);

        hits.sort_by(|a, b| {
            Reverse(OrderedFloat(a.score))
                .cmp(&Reverse(OrderedFloat(b.score)))
                .then_with(|| a.document_id.cmp(&b.document_id))
        });
        hits.truncate(k);

        Ok(hits)
    }
}
