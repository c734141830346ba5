//! Integration tests for the worker pool and backfill against scripted providers.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use embedq_embeddings::{
    EmbeddingError, EmbeddingProvider, EmbeddingRequest, EmbeddingResponse, ProviderAdapter,
    RetryPolicy,
};
use embedq_tasks::{
    BackfillConfig, BackfillOrchestrator, ClaimConfig, Document, DocumentStore, FieldTemplate,
    MemoryDocumentStore, StopReason, TaskCoordinator, TaskStatus, WorkerConfig, WorkerPool,
};
use pretty_assertions::assert_eq;
use serde_json::json;

/// What the scripted provider does on a given call.
#[derive(Clone, Copy)]
enum Script {
    Ok,
    /// Rate-limit the first `n` calls, then succeed.
    RateLimitFirst(usize),
    AlwaysTimeout,
    WrongDimension,
}

struct ScriptedProvider {
    script: Script,
    dimension: usize,
    latency: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedProvider {
    fn new(script: Script, dimension: usize) -> Self {
        Self {
            script,
            dimension,
            latency: Duration::ZERO,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
}

#[async_trait]
impl EmbeddingProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn default_model(&self) -> &str {
        "scripted-model"
    }

    fn default_dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(
        &self,
        _request: EmbeddingRequest,
    ) -> embedq_embeddings::Result<EmbeddingResponse> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let dimension = match self.script {
            Script::Ok => self.dimension,
            Script::RateLimitFirst(n) if call < n => {
                return Err(EmbeddingError::RateLimited {
                    retry_after_secs: None,
                });
            }
            Script::RateLimitFirst(_) => self.dimension,
            Script::AlwaysTimeout => return Err(EmbeddingError::Timeout),
            Script::WrongDimension => self.dimension + 1,
        };

        Ok(EmbeddingResponse {
            embedding: vec![0.5; dimension],
            model: "scripted-model".to_string(),
            dimension,
            tokens_used: None,
        })
    }

    fn is_available(&self) -> bool {
        true
    }
}

struct Harness {
    store: Arc<MemoryDocumentStore>,
    provider: Arc<ScriptedProvider>,
    pool: Arc<WorkerPool>,
}

async fn harness(
    count: usize,
    provider: ScriptedProvider,
    claim: ClaimConfig,
    worker: WorkerConfig,
    retries: u32,
) -> Harness {
    let store = Arc::new(MemoryDocumentStore::new());
    for i in 0..count {
        store
            .insert(Document::from_value(
                format!("doc-{i:02}"),
                json!({"title": format!("document {i}")}),
                Utc::now(),
            ))
            .await
            .unwrap();
    }

    let dimension = provider.dimension;
    let provider = Arc::new(provider);
    let adapter = Arc::new(ProviderAdapter::new(
        provider.clone(),
        RetryPolicy::immediate(retries),
    ));
    let coordinator = Arc::new(TaskCoordinator::new(store.clone(), claim));
    let pool = Arc::new(WorkerPool::new(
        coordinator,
        adapter,
        Arc::new(FieldTemplate::new(["title"])),
        worker.with_worker_id("w-it"),
        "scripted-model",
        dimension,
    ));

    Harness {
        store,
        provider,
        pool,
    }
}

#[tokio::test]
async fn test_concurrency_limit_bounds_provider_calls() {
    let h = harness(
        8,
        ScriptedProvider::new(Script::Ok, 4).with_latency(Duration::from_millis(20)),
        ClaimConfig::default(),
        WorkerConfig::default(),
        0,
    )
    .await;

    let summary = h.pool.run_cycle(8, 2).await.unwrap();
    assert_eq!(summary.succeeded, 8);
    assert!(
        h.provider.max_in_flight.load(Ordering::SeqCst) <= 2,
        "more than two provider calls ran at once"
    );
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_calls_count_against_later_cycles() {
    let h = harness(
        3,
        ScriptedProvider::new(Script::Ok, 4).with_latency(Duration::from_secs(60)),
        ClaimConfig::default(),
        WorkerConfig::default()
            .with_concurrency_limit(1)
            .with_cycle_timeout_secs(5),
        0,
    )
    .await;

    let backfill = BackfillConfig::default().with_max_cycles(3);
    let report = BackfillOrchestrator::new(h.pool.clone(), backfill)
        .run()
        .await
        .unwrap();
    assert_eq!(report.cycles, 3);
    assert_eq!(report.stop_reason, StopReason::MaxCycles);
    assert_eq!(report.abandoned, 1);
    assert_eq!(report.released, 6);
    assert_eq!(h.provider.calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.provider.max_in_flight.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_rate_limits_shrink_concurrency() {
    let h = harness(
        4,
        ScriptedProvider::new(Script::RateLimitFirst(2), 4),
        ClaimConfig::default(),
        WorkerConfig::default(),
        3,
    )
    .await;

    let summary = h.pool.run_cycle(4, 4).await.unwrap();
    assert_eq!(summary.succeeded, 4);
    assert_eq!(summary.effective_concurrency, 2);
    assert_eq!(h.provider.calls.load(Ordering::SeqCst), 6);
}

#[tokio::test]
async fn test_transient_failures_exhaust_into_error() {
    let h = harness(
        1,
        ScriptedProvider::new(Script::AlwaysTimeout, 4),
        ClaimConfig::default()
            .with_max_claim_attempts(3)
            .with_requeue_delay_secs(0),
        WorkerConfig::default(),
        1,
    )
    .await;

    let first = h.pool.run().await.unwrap();
    assert_eq!(first.retried, 1);
    let second = h.pool.run().await.unwrap();
    assert_eq!(second.retried, 1);
    let third = h.pool.run().await.unwrap();
    assert_eq!(third.failed, 1);
    let fourth = h.pool.run().await.unwrap();
    assert_eq!(fourth.claimed, 0);

    let doc = h.store.get("doc-00").await.unwrap().unwrap();
    assert_eq!(doc.embedding.status, TaskStatus::Error);
    assert_eq!(doc.embedding.claim_attempts, 3);
    assert!(
        doc.embedding
            .last_error
            .unwrap_or_default()
            .contains("attempts exhausted")
    );
    // One retry inside the adapter per claim.
    assert_eq!(h.provider.calls.load(Ordering::SeqCst), 6);
}

#[tokio::test]
async fn test_wrong_dimension_never_becomes_ready() {
    let h = harness(
        2,
        ScriptedProvider::new(Script::WrongDimension, 4),
        ClaimConfig::default(),
        WorkerConfig::default(),
        0,
    )
    .await;

    let report = BackfillOrchestrator::new(h.pool.clone(), BackfillConfig::default())
        .run()
        .await
        .unwrap();
    assert_eq!(report.failed, 2);
    assert_eq!(report.succeeded, 0);
    assert_eq!(report.remaining.error, 2);

    for id in ["doc-00", "doc-01"] {
        let doc = h.store.get(id).await.unwrap().unwrap();
        assert_eq!(doc.embedding.status, TaskStatus::Error);
        assert_eq!(doc.vector(), None);
        assert!(
            doc.embedding
                .last_error
                .unwrap_or_default()
                .contains("dimension mismatch")
        );
    }
}

#[tokio::test]
async fn test_backfill_survives_restart_with_persistent_store() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("documents.json");

    {
        let store = Arc::new(MemoryDocumentStore::with_persistence(&path).await.unwrap());
        for i in 0..5 {
            store
                .insert(Document::from_value(
                    format!("doc-{i}"),
                    json!({"title": format!("persisted {i}")}),
                    Utc::now(),
                ))
                .await
                .unwrap();
        }
    }

    let store = Arc::new(MemoryDocumentStore::with_persistence(&path).await.unwrap());
    assert_eq!(store.len().await, 5);

    let provider = Arc::new(ScriptedProvider::new(Script::Ok, 3));
    let adapter = Arc::new(ProviderAdapter::new(provider, RetryPolicy::immediate(0)));
    let coordinator = Arc::new(TaskCoordinator::new(store.clone(), ClaimConfig::default()));
    let pool = Arc::new(WorkerPool::new(
        coordinator,
        adapter,
        Arc::new(FieldTemplate::new(["title"])),
        WorkerConfig::default().with_batch_size(2),
        "scripted-model",
        3,
    ));

    let report = BackfillOrchestrator::new(pool, BackfillConfig::default())
        .run()
        .await
        .unwrap();
    assert_eq!(report.succeeded, 5);
    assert_eq!(report.stop_reason, StopReason::Idle);

    drop(store);
    let reopened = MemoryDocumentStore::with_persistence(&path).await.unwrap();
    let doc = reopened.get("doc-3").await.unwrap().unwrap();
    assert_eq!(doc.embedding.status, TaskStatus::Ready);
    assert_eq!(doc.vector().map(Vec::len), Some(3));
}
