//! Search engine implementation.

use std::collections::BTreeSet;
use std::sync::Arc;

use embedq_embeddings::{
    ATTRIBUTE_OVERLAP, CacheSource, EmbeddingCache, MemoryVectorIndex, MetadataFilter,
    PageRequest, RankCandidate, RankedResult, SecondaryWeights, SimilarityRanker, VectorIndex,
    attribute_overlap,
};
use embedq_tasks::{Document, DocumentStore, Filter, Projection, TaskStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::SearchConfig;
use crate::error::{Result, SearchError};

/// A query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchRequest {
    /// Free text embedded as the query vector.
    pub text: String,

    /// Attributes compared with each document's attribute field.
    pub attributes: Vec<String>,

    /// Metadata constraints passed to the vector index.
    pub filter: MetadataFilter,

    /// 0-based page number.
    pub page: usize,

    /// Page size; the configured default when absent.
    pub page_size: Option<usize>,
}

impl SearchRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn with_attributes<S: Into<String>>(
        mut self,
        attributes: impl IntoIterator<Item = S>,
    ) -> Self {
        self.attributes = attributes.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_filter(mut self, filter: MetadataFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_page(mut self, page: usize, page_size: usize) -> Self {
        self.page = page;
        self.page_size = Some(page_size);
        self
    }
}

/// One page of results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResponse {
    pub results: Vec<RankedResult>,
    pub page: usize,
    pub page_size: usize,
    /// Documents ranked across all pages.
    pub total_matches: usize,
    /// Which cache tier produced the query vector.
    pub cache_source: CacheSource,
    /// Model the query was embedded with.
    pub model: String,
    /// Requested ids that could not be ranked (scoped search only).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unranked: Vec<String>,
}

/// Embeds queries through the cache and ranks ready documents against them.
pub struct SearchEngine {
    config: SearchConfig,
    cache: Arc<EmbeddingCache>,
    index: Arc<dyn VectorIndex>,
    store: Arc<dyn DocumentStore>,
    ranker: SimilarityRanker,
    semantic_only: SecondaryWeights,
    model: String,
}

impl SearchEngine {
    pub fn new(
        config: SearchConfig,
        cache: Arc<EmbeddingCache>,
        index: Arc<dyn VectorIndex>,
        store: Arc<dyn DocumentStore>,
        model: impl Into<String>,
    ) -> Result<Self> {
        config.validate()?;
        let ranker = SimilarityRanker::new(config.max_page_size);

        Ok(Self {
            config,
            cache,
            index,
            store,
            ranker,
            semantic_only: SecondaryWeights::default(),
            model: model.into(),
        })
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Search every indexed document.
    pub async fn search(&self, request: &SearchRequest) -> Result<SearchResponse> {
        let page = self.page_request(request)?;
        let query = self.cache.get_or_compute(&request.text, &self.model).await?;

        let hits = self
            .index
            .top_k(&query.embedding, self.config.top_k, &request.filter)
            .await?;
        debug!("Index returned {} candidate(s)", hits.len());

        // Index entries can outlive a document's ready state.
        let ids: Vec<String> = hits.iter().map(|hit| hit.document_id.clone()).collect();
        let ready: Vec<Document> = self
            .store
            .find_many(
                &Filter::IdIn(ids).and(Filter::Status(TaskStatus::Ready)),
                Projection::without_vector(),
                None,
            )
            .await?;

        let query_attributes = self.query_attributes(request);
        let candidates: Vec<RankCandidate> = hits
            .into_iter()
            .filter_map(|hit| {
                let doc = ready.iter().find(|doc| doc.id == hit.document_id)?;
                Some(self.candidate(doc, hit.embedding, query_attributes.as_ref()))
            })
            .collect();

        let ranked = self.ranker.rank(
            &query.embedding,
            &candidates,
            self.weights(query_attributes.as_ref()),
            page,
        )?;

        info!(
            "Search matched {} document(s) (query vector from {:?})",
            ranked.total_matches, query.source
        );

        Ok(SearchResponse {
            results: ranked.results,
            page: ranked.page,
            page_size: ranked.page_size,
            total_matches: ranked.total_matches,
            cache_source: query.source,
            model: query.model,
            unranked: Vec::new(),
        })
    }

    /// Rank exactly the listed documents, bypassing the index.
    ///
    /// Listed documents without a usable vector are returned in
    /// [`SearchResponse::unranked`].
    pub async fn search_within(
        &self,
        request: &SearchRequest,
        ids: &[String],
    ) -> Result<SearchResponse> {
        let page = self.page_request(request)?;
        let query = self.cache.get_or_compute(&request.text, &self.model).await?;

        let docs = self
            .store
            .find_many(&Filter::IdIn(ids.to_vec()), Projection::full(), None)
            .await?;

        let query_attributes = self.query_attributes(request);
        let mut candidates = Vec::with_capacity(docs.len());
        for doc in &docs {
            match doc.vector() {
                Some(vector) if vector.len() == query.embedding.len() => {
                    candidates.push(self.candidate(
                        doc,
                        vector.clone(),
                        query_attributes.as_ref(),
                    ));
                }
                Some(vector) => warn!(
                    "Skipping {}: stored vector has {} dimensions, query has {}",
                    doc.id,
                    vector.len(),
                    query.embedding.len()
                ),
                None => debug!("Skipping {}: no ready embedding", doc.id),
            }
        }

        let ranked_ids: BTreeSet<&str> = candidates
            .iter()
            .map(|candidate| candidate.document_id.as_str())
            .collect();
        let mut unranked: Vec<String> = ids
            .iter()
            .filter(|id| !ranked_ids.contains(id.as_str()))
            .cloned()
            .collect();
        unranked.sort();
        unranked.dedup();

        let ranked = self.ranker.rank(
            &query.embedding,
            &candidates,
            self.weights(query_attributes.as_ref()),
            page,
        )?;

        Ok(SearchResponse {
            results: ranked.results,
            page: ranked.page,
            page_size: ranked.page_size,
            total_matches: ranked.total_matches,
            cache_source: query.source,
            model: query.model,
            unranked,
        })
    }

    fn page_request(&self, request: &SearchRequest) -> Result<PageRequest> {
        if request.text.trim().is_empty() {
            return Err(SearchError::InvalidRequest(
                "query text is empty".to_string(),
            ));
        }

        let page_size = request.page_size.unwrap_or(self.config.default_page_size);
        if page_size == 0 || page_size > self.config.max_page_size {
            return Err(SearchError::InvalidRequest(format!(
                "page size {page_size} must be between 1 and {}",
                self.config.max_page_size
            )));
        }

        Ok(PageRequest::new(request.page, page_size))
    }

    /// Lowercased query attributes, when the attribute signal applies.
    fn query_attributes(&self, request: &SearchRequest) -> Option<BTreeSet<String>> {
        if self.config.attribute_field.is_none() {
            return None;
        }
        let attributes: BTreeSet<String> = request
            .attributes
            .iter()
            .map(|a| a.trim().to_lowercase())
            .filter(|a| !a.is_empty())
            .collect();
        (!attributes.is_empty()).then_some(attributes)
    }

    fn weights(&self, query_attributes: Option<&BTreeSet<String>>) -> &SecondaryWeights {
        match query_attributes {
            Some(_) => &self.config.weights,
            None => &self.semantic_only,
        }
    }

    fn candidate(
        &self,
        doc: &Document,
        embedding: Vec<f32>,
        query_attributes: Option<&BTreeSet<String>>,
    ) -> RankCandidate {
        let candidate = RankCandidate::new(doc.id.clone(), embedding);
        match (query_attributes, &self.config.attribute_field) {
            (Some(query), Some(field)) => {
                let overlap = attribute_overlap(query, &document_attributes(doc, field));
                candidate.with_signal(ATTRIBUTE_OVERLAP, overlap)
            }
            _ => candidate,
        }
    }
}

/// Attribute values of `field`: a string or an array of strings.
fn document_attributes(doc: &Document, field: &str) -> BTreeSet<String> {
    match doc.field(field) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect(),
        Some(Value::String(s)) if !s.trim().is_empty() => {
            BTreeSet::from([s.trim().to_lowercase()])
        }
        _ => BTreeSet::new(),
    }
}

/// Fill `index` with every ready document in `store`.
///
/// Returns the number of vectors indexed. Vectors of the wrong dimension are
/// skipped.
pub async fn load_ready_documents(
    store: &dyn DocumentStore,
    index: &MemoryVectorIndex,
) -> Result<usize> {
    let ready = store
        .find_many(&Filter::Status(TaskStatus::Ready), Projection::full(), None)
        .await?;

    let mut loaded = 0;
    for doc in ready {
        let Some(vector) = doc.embedding.vector else {
            continue;
        };
        if vector.len() != index.dimension() {
            warn!(
                "Not indexing {}: {} dimensions, index expects {}",
                doc.id,
                vector.len(),
                index.dimension()
            );
            continue;
        }
        index
            .upsert(doc.id, vector, Some(Value::Object(doc.fields)))
            .await?;
        loaded += 1;
    }

    info!("Indexed {loaded} ready document(s)");
    Ok(loaded)
}
