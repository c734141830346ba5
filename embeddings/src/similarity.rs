//! Similarity computation and result ranking.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::Embedding;
use crate::error::{EmbeddingError, Result};

/// Signal name for attribute overlap between query and document.
pub const ATTRIBUTE_OVERLAP: &str = "attribute_overlap";

/// Compute the cosine similarity between two embeddings.
///
/// Returns a value between -1.0 and 1.0, where:
/// - 1.0 means identical vectors
/// - 0.0 means orthogonal vectors
/// - -1.0 means opposite vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f32> {
    if a.len() != b.len() {
        return Err(EmbeddingError::DimensionMismatch {
            expected: a.len(),
            actual: b.len(),
        });
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let magnitude_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let magnitude_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if magnitude_a == 0.0 || magnitude_b == 0.0 {
        return Ok(0.0);
    }

    Ok((dot_product / (magnitude_a * magnitude_b)).clamp(-1.0, 1.0))
}

/// Normalize an embedding to unit length.
pub fn normalize(embedding: &mut Embedding) {
    let magnitude: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
    if magnitude > 0.0 {
        for x in embedding.iter_mut() {
            *x /= magnitude;
        }
    }
}

/// Jaccard overlap of two attribute sets, in `0.0..=1.0`.
///
/// Comparison is case-insensitive. Two empty sets overlap by 0.
pub fn attribute_overlap(query: &BTreeSet<String>, document: &BTreeSet<String>) -> f32 {
    let query: BTreeSet<String> = query.iter().map(|a| a.trim().to_lowercase()).collect();
    let document: BTreeSet<String> = document.iter().map(|a| a.trim().to_lowercase()).collect();

    let union = query.union(&document).count();
    if union == 0 {
        return 0.0;
    }
    query.intersection(&document).count() as f32 / union as f32
}

/// A document scored by the vector index or loaded for ranking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankCandidate {
    /// Document identifier; also the tie-break key.
    pub document_id: String,

    /// Stored document vector.
    pub embedding: Embedding,

    /// Precomputed secondary signals, by name.
    #[serde(default)]
    pub signals: BTreeMap<String, f32>,
}

impl RankCandidate {
    /// Create a candidate without secondary signals.
    pub fn new(document_id: impl Into<String>, embedding: Embedding) -> Self {
        Self {
            document_id: document_id.into(),
            embedding,
            signals: BTreeMap::new(),
        }
    }

    /// Attach a secondary signal value.
    pub fn with_signal(mut self, name: impl Into<String>, value: f32) -> Self {
        self.signals.insert(name.into(), value);
        self
    }
}

/// Weights for combining the semantic score with secondary signals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecondaryWeights {
    /// Weight of the cosine similarity.
    pub semantic: f32,

    /// Weight per secondary signal name.
    pub signals: BTreeMap<String, f32>,
}

impl Default for SecondaryWeights {
    fn default() -> Self {
        Self {
            semantic: 1.0,
            signals: BTreeMap::new(),
        }
    }
}

impl SecondaryWeights {
    /// Add a weighted secondary signal.
    pub fn with_signal(mut self, name: impl Into<String>, weight: f32) -> Self {
        self.signals.insert(name.into(), weight);
        self
    }

    /// Set the semantic weight.
    pub fn with_semantic(mut self, weight: f32) -> Self {
        self.semantic = weight;
        self
    }

    /// Whether any secondary signal is configured.
    pub fn has_signals(&self) -> bool {
        !self.signals.is_empty()
    }
}

/// One ranked document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedResult {
    /// Document identifier.
    pub document_id: String,

    /// Cosine similarity to the query.
    pub similarity: f32,

    /// Weighted secondary score, when signals are configured.
    pub secondary: Option<f32>,

    /// Score used for ordering.
    pub combined: f32,
}

/// A page request. `page` is zero-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    /// Zero-based page number.
    pub page: usize,

    /// Results per page.
    pub page_size: usize,
}

impl PageRequest {
    /// Create a page request.
    pub fn new(page: usize, page_size: usize) -> Self {
        Self { page, page_size }
    }

    /// Index of the first result on this page.
    pub fn offset(&self) -> usize {
        self.page.saturating_mul(self.page_size)
    }
}

/// One page of ranked results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedPage {
    /// Results on this page, best first.
    pub results: Vec<RankedResult>,

    /// Zero-based page number.
    pub page: usize,

    /// Requested page size.
    pub page_size: usize,

    /// Number of ranked candidates across all pages.
    pub total_matches: usize,
}

/// Turns unordered candidates into a deterministic, paginated ordering.
#[derive(Debug, Clone)]
pub struct SimilarityRanker {
    max_page_size: usize,
}

impl SimilarityRanker {
    /// Create a ranker rejecting pages larger than `max_page_size`.
    pub fn new(max_page_size: usize) -> Self {
        Self { max_page_size }
    }

    /// Largest accepted page size.
    pub fn max_page_size(&self) -> usize {
        self.max_page_size
    }

    /// Score and order every candidate.
    ///
    /// Sorted by combined score descending, then by document id ascending.
    pub fn order(
        &self,
        query: &[f32],
        candidates: &[RankCandidate],
        weights: &SecondaryWeights,
    ) -> Result<Vec<RankedResult>> {
        let mut results = Vec::with_capacity(candidates.len());

        for candidate in candidates {
            let similarity = cosine_similarity(query, &candidate.embedding)?;
            let secondary = weights.has_signals().then(|| {
                weights
                    .signals
                    .iter()
                    .map(|(name, weight)| {
                        weight * candidate.signals.get(name).copied().unwrap_or(0.0)
                    })
                    .sum::<f32>()
            });
            let combined = match secondary {
                Some(secondary) => weights.semantic * similarity + secondary,
                None => similarity,
            };

            results.push(RankedResult {
                document_id: candidate.document_id.clone(),
                similarity,
                secondary,
                combined,
            });
        }

        results.sort_by(|a, b| {
            Reverse(OrderedFloat(a.combined))
                .cmp(&Reverse(OrderedFloat(b.combined)))
                .then_with(|| a.document_id.cmp(&b.document_id))
        });

        Ok(results)
    }

    /// Score, order and paginate the candidates.
    pub fn rank(
        &self,
        query: &[f32],
        candidates: &[RankCandidate],
        weights: &SecondaryWeights,
        page: PageRequest,
    ) -> Result<RankedPage> {
        if page.page_size == 0 || page.page_size > self.max_page_size {
            return Err(EmbeddingError::InvalidPageSize {
                requested: page.page_size,
                max: self.max_page_size,
            });
        }

        let ordered = self.order(query, candidates, weights)?;
        let total_matches = ordered.len();
        let results: Vec<RankedResult> = ordered
            .into_iter()
            .skip(page.offset())
            .take(page.page_size)
            .collect();

        debug!(
            "Ranked {total_matches} candidates, page {} holds {}",
            page.page,
            results.len()
        );

        Ok(RankedPage {
            results,
            page: page.page,
            page_size: page.page_size,
            total_matches,
        })
    }
}
