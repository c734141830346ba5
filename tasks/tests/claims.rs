//! Integration tests for claiming, reclaiming and exhausting tasks.

use std::sync::Arc;

use chrono::{TimeDelta, Utc};
use embedq_embeddings::{HashProvider, ProviderAdapter, RetryPolicy};
use embedq_tasks::{
    ClaimConfig, Document, DocumentStore, FieldTemplate, MemoryDocumentStore, TaskCoordinator,
    TaskStatus, WorkerConfig, WorkerPool,
};
use pretty_assertions::assert_eq;
use serde_json::json;
use tokio::sync::Barrier;

async fn store_with(ids: &[&str]) -> Arc<MemoryDocumentStore> {
    let store = Arc::new(MemoryDocumentStore::new());
    for id in ids {
        store
            .insert(Document::from_value(
                *id,
                json!({"title": format!("title of {id}")}),
                Utc::now(),
            ))
            .await
            .unwrap();
    }
    store
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claims_on_one_document_have_one_winner() {
    let store = store_with(&["contested"]).await;
    let coordinator = Arc::new(TaskCoordinator::new(store.clone(), ClaimConfig::default()));
    let barrier = Arc::new(Barrier::new(16));
    let now = Utc::now();

    let mut handles = Vec::new();
    for i in 0..16 {
        let coordinator = coordinator.clone();
        let barrier = barrier.clone();
        handles.push(tokio::spawn(async move {
            barrier.wait().await;
            coordinator
                .claim_batch(1, &format!("worker-{i}"), now)
                .await
                .unwrap()
                .len()
        }));
    }

    let mut total = 0;
    for handle in handles {
        total += handle.await.unwrap();
    }
    assert_eq!(total, 1);

    let doc = store.get("contested").await.unwrap().unwrap();
    assert_eq!(doc.embedding.status, TaskStatus::InProgress);
    assert_eq!(doc.embedding.claim_attempts, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_batches_partition_the_backlog() {
    let ids: Vec<String> = (0..40).map(|i| format!("doc-{i:02}")).collect();
    let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
    let store = store_with(&id_refs).await;
    let coordinator = Arc::new(TaskCoordinator::new(store.clone(), ClaimConfig::default()));
    let now = Utc::now();

    let mut handles = Vec::new();
    for i in 0..4 {
        let coordinator = coordinator.clone();
        handles.push(tokio::spawn(async move {
            coordinator
                .claim_batch(15, &format!("worker-{i}"), now)
                .await
                .unwrap()
                .into_iter()
                .map(|claim| claim.task_id)
                .collect::<Vec<_>>()
        }));
    }

    let mut claimed = Vec::new();
    for handle in handles {
        claimed.extend(handle.await.unwrap());
    }
    let total = claimed.len();
    claimed.sort();
    claimed.dedup();

    assert_eq!(claimed.len(), total, "a document was claimed twice");
    assert_eq!(total, 40);
}

#[tokio::test]
async fn test_crashed_worker_is_reclaimed_after_lock_ttl() {
    let store = store_with(&["d"]).await;
    let config = ClaimConfig::default().with_lock_ttl_secs(300);
    let coordinator = Arc::new(TaskCoordinator::new(store.clone(), config));

    // W1 claims and then disappears without finalizing.
    let t0 = Utc::now() - TimeDelta::seconds(301);
    let w1 = coordinator.claim_batch(1, "w1", t0).await.unwrap();
    assert_eq!(w1[0].attempt, 1);

    // Still locked just before the TTL runs out.
    let early = coordinator
        .claim_batch(1, "w2", t0 + TimeDelta::seconds(299))
        .await
        .unwrap();
    assert!(early.is_empty());

    let adapter = Arc::new(ProviderAdapter::new(
        Arc::new(HashProvider::new("hash", 6)),
        RetryPolicy::immediate(0),
    ));
    let w2 = WorkerPool::new(
        coordinator.clone(),
        adapter,
        Arc::new(FieldTemplate::new(["title"])),
        WorkerConfig::default().with_worker_id("w2"),
        "hash",
        6,
    );

    let summary = w2.run_cycle(1, 1).await.unwrap();
    assert_eq!(summary.claimed, 1);
    assert_eq!(summary.succeeded, 1);

    let doc = store.get("d").await.unwrap().unwrap();
    assert_eq!(doc.embedding.status, TaskStatus::Ready);
    assert_eq!(doc.embedding.claim_attempts, 2);
    assert_eq!(doc.embedding.dimensions, Some(6));
    assert_eq!(doc.embedding.lock_owner, None);
}

#[tokio::test]
async fn test_exhausted_task_is_never_claimed_again() {
    let store = store_with(&["d"]).await;
    let config = ClaimConfig::default()
        .with_lock_ttl_secs(60)
        .with_max_claim_attempts(2);
    let coordinator = TaskCoordinator::new(store.clone(), config);

    // Two crashed claims use up both attempts.
    let t0 = Utc::now() - TimeDelta::seconds(600);
    assert_eq!(coordinator.claim_batch(1, "w1", t0).await.unwrap().len(), 1);
    let t1 = t0 + TimeDelta::seconds(120);
    assert_eq!(coordinator.claim_batch(1, "w2", t1).await.unwrap().len(), 1);

    let now = Utc::now();
    assert!(coordinator.claim_batch(1, "w3", now).await.unwrap().is_empty());
    assert_eq!(coordinator.expire_exhausted(now).await.unwrap(), 1);

    let doc = store.get("d").await.unwrap().unwrap();
    assert_eq!(doc.embedding.status, TaskStatus::Error);
    assert_eq!(doc.embedding.claim_attempts, 2);
    assert!(coordinator.claim_batch(1, "w3", now).await.unwrap().is_empty());

    // Only a manual re-queue brings it back.
    assert!(coordinator.requeue("d", now).await.unwrap());
    assert_eq!(coordinator.claim_batch(1, "w3", now).await.unwrap().len(), 1);
}
