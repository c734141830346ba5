//! Integration tests for the command handlers against an offline provider.

use std::path::Path;

use embedq_cli::handlers::{
    BackfillOptions, ImportSummary, handle_backfill, handle_import, handle_invalidate,
    handle_requeue, handle_search,
};
use embedq_cli::{AppContext, Config};
use embedq_embeddings::CacheSource;
use embedq_search::SearchRequest;
use embedq_tasks::{DocumentStore, StopReason, TaskStatus, TemplateConfig};
use pretty_assertions::assert_eq;
use serde_json::json;

async fn context(dir: &Path) -> AppContext {
    let mut config = Config::default();
    config.provider.dimension = 12;
    config.provider.model = "offline-test".to_string();
    config.template = TemplateConfig::Fields {
        fields: vec!["title".to_string(), "skills".to_string()],
    };
    AppContext::new(config, dir.join("store").join("documents.json"), true)
        .await
        .unwrap()
}

fn write_json(path: &Path, value: serde_json::Value) {
    std::fs::write(path, serde_json::to_string(&value).unwrap()).unwrap();
}

#[tokio::test]
async fn test_import_backfill_and_search() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = context(dir.path()).await;

    let file = dir.path().join("docs.json");
    write_json(
        &file,
        json!([
            {"id": "a", "title": "Rust engineer", "skills": ["rust"]},
            {"id": "b", "title": "Go engineer", "skills": ["go"]},
            {"id": "c", "title": "Designer", "skills": ["figma"]},
        ]),
    );
    let summary = handle_import(&ctx, &file, false).await.unwrap();
    assert_eq!(summary.inserted, 3);

    let dry = handle_backfill(
        &ctx,
        &BackfillOptions {
            dry_run: true,
            ..BackfillOptions::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(dry.stop_reason, StopReason::DryRun);
    assert_eq!(dry.would_claim, vec!["a", "b", "c"]);

    let report = handle_backfill(
        &ctx,
        &BackfillOptions {
            batch_size: Some(2),
            concurrency: Some(2),
            ..BackfillOptions::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(report.succeeded, 3);
    assert_eq!(report.cycles, 3);
    assert_eq!(report.remaining.ready, 3);

    let request = SearchRequest::new("title: Rust engineer | skills: rust");
    let response = handle_search(&ctx, &request, &[]).await.unwrap();
    assert_eq!(response.total_matches, 3);
    assert_eq!(response.results[0].document_id, "a");
    assert_eq!(response.cache_source, CacheSource::Computed);
    assert_eq!(response.model, "offline-test");

    let scoped = handle_search(&ctx, &request, &["b".to_string(), "zzz".to_string()])
        .await
        .unwrap();
    assert_eq!(scoped.total_matches, 1);
    assert_eq!(scoped.unranked, vec!["zzz"]);
    // The cache file next to the store already holds the query vector.
    assert_eq!(scoped.cache_source, CacheSource::Persistent);
}

#[tokio::test]
async fn test_updates_requeue_only_when_embedded_fields_change() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = context(dir.path()).await;

    let file = dir.path().join("docs.json");
    write_json(
        &file,
        json!([
            {"id": "a", "title": "Rust engineer", "email": "a@example.com"},
            {"id": "b", "title": "Go engineer", "email": "b@example.com"},
        ]),
    );
    handle_import(&ctx, &file, false).await.unwrap();
    handle_backfill(&ctx, &BackfillOptions::default()).await.unwrap();

    write_json(
        &file,
        json!([
            {"id": "a", "title": "Senior Rust engineer"},
            {"id": "b", "email": "new@example.com"},
            {"id": "c", "title": "New"},
        ]),
    );
    let summary = handle_import(&ctx, &file, true).await.unwrap();
    assert_eq!(
        summary,
        ImportSummary {
            inserted: 1,
            updated: 2,
            invalidated: 1,
            unchanged: 0,
            skipped: 0,
        }
    );

    let a = ctx.store.get("a").await.unwrap().unwrap();
    assert_eq!(a.embedding.status, TaskStatus::Queued);
    assert_eq!(a.embedding.vector, None);
    assert_eq!(a.text_field("title"), Some("Senior Rust engineer"));

    let b = ctx.store.get("b").await.unwrap().unwrap();
    assert_eq!(b.embedding.status, TaskStatus::Ready);
    assert_eq!(b.text_field("email"), Some("new@example.com"));

    assert!(!handle_invalidate(&ctx, "b", &["email".to_string()]).await.unwrap());
    assert!(handle_invalidate(&ctx, "b", &["title".to_string()]).await.unwrap());
}

#[tokio::test]
async fn test_requeue_reports_each_id() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = context(dir.path()).await;

    let file = dir.path().join("docs.json");
    // No text for the template, so embedding fails permanently.
    write_json(&file, json!([{"id": "blank", "other": "x"}]));
    handle_import(&ctx, &file, false).await.unwrap();

    let report = handle_backfill(&ctx, &BackfillOptions::default()).await.unwrap();
    assert_eq!(report.failed, 1);

    let results = handle_requeue(&ctx, &["blank".to_string(), "missing".to_string()])
        .await
        .unwrap();
    assert_eq!(
        results,
        vec![("blank".to_string(), true), ("missing".to_string(), false)]
    );

    let doc = ctx.store.get("blank").await.unwrap().unwrap();
    assert_eq!(doc.embedding.status, TaskStatus::Queued);
    assert_eq!(doc.embedding.claim_attempts, 0);
}

#[tokio::test]
async fn test_store_persists_between_contexts() {
    let dir = tempfile::tempdir().unwrap();
    {
        let ctx = context(dir.path()).await;
        let file = dir.path().join("docs.json");
        write_json(&file, json!([{"id": 7, "title": "Numbered"}]));
        handle_import(&ctx, &file, false).await.unwrap();
        handle_backfill(&ctx, &BackfillOptions::default()).await.unwrap();
    }

    let ctx = context(dir.path()).await;
    let doc = ctx.store.get("7").await.unwrap().unwrap();
    assert_eq!(doc.embedding.status, TaskStatus::Ready);
    assert_eq!(doc.embedding.dimensions, Some(12));
}

#[tokio::test]
async fn test_second_context_on_the_same_store_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = context(dir.path()).await;

    let mut config = Config::default();
    config.provider.dimension = 12;
    let second = AppContext::new(config, ctx.store_path.clone(), true).await;
    let err = second.err().unwrap();
    assert!(format!("{err:#}").contains("in use by another process"));
}
