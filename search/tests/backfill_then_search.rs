//! End-to-end test: backfill a store, index the results and search them.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use embedq_embeddings::{
    CacheConfig, CacheSource, EmbeddingCache, EmbeddingProvider, EmbeddingRequest,
    EmbeddingResponse, FileCacheStore, HashProvider, MemoryVectorIndex, ProviderAdapter,
    RetryPolicy,
};
use embedq_search::{SearchConfig, SearchEngine, SearchRequest, load_ready_documents};
use embedq_tasks::{
    BackfillConfig, BackfillOrchestrator, ClaimConfig, Document, DocumentStore,
    JobListingTemplate, MemoryDocumentStore, TaskCoordinator, WorkerConfig, WorkerPool,
};
use pretty_assertions::assert_eq;
use serde_json::json;

const DIM: usize = 16;

/// Counts calls on top of the deterministic hash provider.
struct CountingProvider {
    inner: HashProvider,
    calls: AtomicUsize,
}

#[async_trait]
impl EmbeddingProvider for CountingProvider {
    fn name(&self) -> &str {
        "counting"
    }

    fn default_model(&self) -> &str {
        self.inner.default_model()
    }

    fn default_dimension(&self) -> usize {
        DIM
    }

    async fn embed(
        &self,
        request: EmbeddingRequest,
    ) -> embedq_embeddings::Result<EmbeddingResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.embed(request).await
    }

    fn is_available(&self) -> bool {
        true
    }
}

#[tokio::test]
async fn test_backfilled_documents_are_searchable() {
    let store = Arc::new(MemoryDocumentStore::new());
    let listings = [
        ("job-1", "Backend Engineer", ["Rust", "Postgres"]),
        ("job-2", "Data Scientist", ["Python", "Pandas"]),
        ("job-3", "Platform Engineer", ["Rust", "Kubernetes"]),
    ];
    for (id, title, skills) in listings {
        store
            .insert(Document::from_value(
                id,
                json!({"title": title, "skillsRequired": skills, "skills": skills}),
                Utc::now(),
            ))
            .await
            .unwrap();
    }

    let provider = Arc::new(CountingProvider {
        inner: HashProvider::new("hash", DIM),
        calls: AtomicUsize::new(0),
    });
    let adapter = Arc::new(ProviderAdapter::new(
        provider.clone(),
        RetryPolicy::immediate(0),
    ));

    let coordinator = Arc::new(TaskCoordinator::new(store.clone(), ClaimConfig::default()));
    let pool = Arc::new(WorkerPool::new(
        coordinator,
        adapter.clone(),
        Arc::new(JobListingTemplate),
        WorkerConfig::default(),
        "hash",
        DIM,
    ));
    let report = BackfillOrchestrator::new(pool, BackfillConfig::default())
        .run()
        .await
        .unwrap();
    assert_eq!(report.succeeded, 3);
    assert_eq!(provider.calls.load(Ordering::SeqCst), 3);

    let index = Arc::new(MemoryVectorIndex::new(DIM));
    assert_eq!(load_ready_documents(store.as_ref(), &index).await.unwrap(), 3);

    let dir = tempfile::tempdir().unwrap();
    let cache_config = CacheConfig::default().with_path(dir.path().join("cache.json"));
    let cache = Arc::new(
        EmbeddingCache::from_config(&cache_config, adapter.clone())
            .await
            .unwrap(),
    );
    let engine = SearchEngine::new(SearchConfig::default(), cache, index, store, "hash").unwrap();

    let request = SearchRequest::new("rust engineer").with_attributes(["Rust"]);
    let first = engine.search(&request).await.unwrap();
    assert_eq!(first.total_matches, 3);
    assert_eq!(first.cache_source, CacheSource::Computed);
    // Both Rust listings get the attribute boost.
    for result in &first.results {
        let expected = if result.document_id == "job-2" { 0.0 } else { 0.1 };
        assert_eq!(result.secondary, Some(expected));
    }

    let second = engine.search(&request).await.unwrap();
    assert_eq!(second.cache_source, CacheSource::Memory);
    assert_eq!(second.results, first.results);
    assert_eq!(provider.calls.load(Ordering::SeqCst), 4);

    // A fresh cache over the same file is served from the persistent tier.
    let reopened = EmbeddingCache::from_config(&cache_config, adapter)
        .await
        .unwrap();
    let again = reopened.get_or_compute("rust engineer", "hash").await.unwrap();
    assert_eq!(again.source, CacheSource::Persistent);
    assert_eq!(provider.calls.load(Ordering::SeqCst), 4);
}
