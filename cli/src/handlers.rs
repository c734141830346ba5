//! CLI command handlers.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use embedq_embeddings::{MemoryVectorIndex, MetadataFilter};
use embedq_search::{SearchEngine, SearchRequest, SearchResponse, load_ready_documents};
use embedq_tasks::{
    BackfillOrchestrator, BackfillReport, Document, DocumentStore, Filter, TaskError, Update,
    WorkerPool, touches_embedding_fields,
};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::cli::Commands;
use crate::context::AppContext;
use crate::output::{OutputMode, output_json, print_rows};

/// Run one command.
pub async fn execute(command: &Commands, ctx: &AppContext, mode: OutputMode) -> Result<()> {
    match command {
        Commands::Import { file, update } => {
            let summary = handle_import(ctx, file, *update).await?;
            match mode {
                OutputMode::Json => output_json(&summary)?,
                OutputMode::Human => print_rows(&[
                    ("inserted", summary.inserted.to_string()),
                    ("updated", summary.updated.to_string()),
                    ("re-queued", summary.invalidated.to_string()),
                    ("unchanged", summary.unchanged.to_string()),
                    ("skipped", summary.skipped.to_string()),
                ]),
            }
        }
        Commands::Backfill {
            limit,
            batch_size,
            concurrency,
            max_cycles,
            dry_run,
        } => {
            let options = BackfillOptions {
                limit: *limit,
                batch_size: *batch_size,
                concurrency: *concurrency,
                max_cycles: *max_cycles,
                dry_run: *dry_run,
            };
            let report = handle_backfill(ctx, &options).await?;
            match mode {
                OutputMode::Json => output_json(&report)?,
                OutputMode::Human => print_backfill(&report),
            }
        }
        Commands::Status => {
            let depth = ctx.coordinator.queue_depth().await?;
            match mode {
                OutputMode::Json => output_json(&depth)?,
                OutputMode::Human => print_rows(&[
                    ("queued", depth.queued.to_string()),
                    ("in_progress", depth.in_progress.to_string()),
                    ("ready", depth.ready.to_string()),
                    ("error", depth.error.to_string()),
                    ("total", depth.total().to_string()),
                ]),
            }
        }
        Commands::Requeue { ids } => {
            let requeued = handle_requeue(ctx, ids).await?;
            match mode {
                OutputMode::Json => output_json(&requeued)?,
                OutputMode::Human => {
                    for (id, applied) in &requeued {
                        let state = if *applied { "re-queued" } else { "unchanged" };
                        println!("{id}: {state}");
                    }
                }
            }
        }
        Commands::Invalidate { id, fields } => {
            let applied = handle_invalidate(ctx, id, fields).await?;
            match mode {
                OutputMode::Json => output_json(&serde_json::json!({
                    "id": id,
                    "invalidated": applied,
                }))?,
                OutputMode::Human if applied => println!("{id}: embedding discarded"),
                OutputMode::Human => println!("{id}: unchanged"),
            }
        }
        Commands::Search {
            text,
            page,
            page_size,
            attributes,
            filters,
            within,
        } => {
            let mut request = SearchRequest::new(text.clone()).with_attributes(attributes.clone());
            request.page = *page;
            request.page_size = *page_size;
            request.filter = parse_filters(filters)?;

            let response = handle_search(ctx, &request, within).await?;
            match mode {
                OutputMode::Json => output_json(&response)?,
                OutputMode::Human => print_search(&response),
            }
        }
    }
    Ok(())
}

/// Counts for an import.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub inserted: usize,
    pub updated: usize,
    /// Updated documents whose embedding was discarded.
    pub invalidated: usize,
    pub unchanged: usize,
    /// Existing documents left alone because updates were not requested.
    pub skipped: usize,
}

/// Read `file` and import its documents.
pub async fn handle_import(ctx: &AppContext, file: &Path, update: bool) -> Result<ImportSummary> {
    let content = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("failed to read {}", file.display()))?;
    let records: Vec<Map<String, Value>> = serde_json::from_str(&content)
        .with_context(|| format!("{} must hold a JSON array of objects", file.display()))?;

    import_documents(ctx, records, update).await
}

/// Insert new documents; with `update`, merge fields into existing ones.
pub async fn import_documents(
    ctx: &AppContext,
    records: Vec<Map<String, Value>>,
    update: bool,
) -> Result<ImportSummary> {
    let mut summary = ImportSummary::default();
    let now = Utc::now();

    for (position, mut fields) in records.into_iter().enumerate() {
        let id = match fields.remove("id") {
            Some(Value::String(id)) if !id.trim().is_empty() => id,
            Some(Value::Number(n)) => n.to_string(),
            _ => bail!("record {position} has no usable \"id\""),
        };

        let existing = ctx.store.get(&id).await?;
        let Some(existing) = existing else {
            ctx.store.insert(Document::new(id, fields, now)).await?;
            summary.inserted += 1;
            continue;
        };

        if !update {
            debug!("Skipping existing document {id}");
            summary.skipped += 1;
            continue;
        }

        let changed: Vec<(String, Value)> = fields
            .into_iter()
            .filter(|(name, value)| existing.field(name) != Some(value))
            .collect();
        if changed.is_empty() {
            summary.unchanged += 1;
            continue;
        }

        let names: Vec<&str> = changed.iter().map(|(name, _)| name.as_str()).collect();
        let sensitive = touches_embedding_fields(ctx.template.as_ref(), &names);
        let mut patch = Update::new();
        for (name, value) in &changed {
            patch = patch.field(name.clone(), value.clone());
        }
        ctx.store
            .conditional_update(&Filter::Id(id.clone()), &patch.touch(now))
            .await?;
        summary.updated += 1;

        if sensitive && ctx.coordinator.invalidate(&id, now).await? {
            info!("Re-queued {id}: embedded fields changed ({})", names.join(", "));
            summary.invalidated += 1;
        }
    }

    info!(
        "Imported {} new and {} updated document(s)",
        summary.inserted, summary.updated
    );
    Ok(summary)
}

/// Command-line overrides for a backfill run.
#[derive(Debug, Clone, Default)]
pub struct BackfillOptions {
    pub limit: Option<usize>,
    pub batch_size: Option<usize>,
    pub concurrency: Option<usize>,
    pub max_cycles: Option<usize>,
    pub dry_run: bool,
}

pub async fn handle_backfill(
    ctx: &AppContext,
    options: &BackfillOptions,
) -> Result<BackfillReport> {
    let mut worker = ctx.config.worker.clone();
    if let Some(batch_size) = options.batch_size {
        worker = worker.with_batch_size(batch_size);
    }
    if let Some(concurrency) = options.concurrency {
        worker = worker.with_concurrency_limit(concurrency);
    }
    worker.validate()?;

    let mut backfill = ctx.config.backfill.clone();
    if options.limit.is_some() {
        backfill.limit = options.limit;
    }
    if options.max_cycles.is_some() {
        backfill.max_cycles = options.max_cycles;
    }
    backfill.dry_run |= options.dry_run;

    // A dry run never calls the provider, so it works without credentials.
    let adapter = if backfill.dry_run {
        ctx.offline_adapter()
    } else {
        ctx.adapter()?
    };

    let pool = Arc::new(WorkerPool::new(
        ctx.coordinator.clone(),
        adapter,
        ctx.template.clone(),
        worker,
        ctx.config.provider.model.clone(),
        ctx.config.provider.dimension,
    ));
    info!("Starting backfill as {}", pool.worker_id());

    Ok(BackfillOrchestrator::new(pool, backfill).run().await?)
}

/// Re-queue each id, reporting whether it changed.
pub async fn handle_requeue(ctx: &AppContext, ids: &[String]) -> Result<Vec<(String, bool)>> {
    let now = Utc::now();
    let mut results = Vec::with_capacity(ids.len());
    for id in ids {
        match ctx.coordinator.requeue(id, now).await {
            Ok(applied) => results.push((id.clone(), applied)),
            Err(TaskError::NotFound(_)) => {
                warn!("No document {id}");
                results.push((id.clone(), false));
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(results)
}

/// Discard the embedding of `id` if any of `fields` is embedded (or no
/// fields were named).
pub async fn handle_invalidate(ctx: &AppContext, id: &str, fields: &[String]) -> Result<bool> {
    if !fields.is_empty() && !touches_embedding_fields(ctx.template.as_ref(), fields) {
        info!("None of {} affect the embedding of {id}", fields.join(", "));
        return Ok(false);
    }
    Ok(ctx.coordinator.invalidate(id, Utc::now()).await?)
}

pub async fn handle_search(
    ctx: &AppContext,
    request: &SearchRequest,
    within: &[String],
) -> Result<SearchResponse> {
    let adapter = ctx.adapter()?;
    let cache = Arc::new(ctx.cache(adapter).await?);

    let index = Arc::new(MemoryVectorIndex::new(ctx.config.provider.dimension));
    if within.is_empty() {
        load_ready_documents(ctx.store.as_ref(), &index).await?;
    }

    let engine = SearchEngine::new(
        ctx.config.search.clone(),
        cache,
        index,
        ctx.store.clone(),
        ctx.config.provider.model.clone(),
    )?;

    let response = if within.is_empty() {
        engine.search(request).await?
    } else {
        engine.search_within(request, within).await?
    };
    Ok(response)
}

/// Parse `key=value` constraints. Values that parse as JSON keep their type.
pub fn parse_filters(filters: &[String]) -> Result<MetadataFilter> {
    let mut parsed = MetadataFilter::new();
    for filter in filters {
        let Some((key, value)) = filter.split_once('=') else {
            bail!("filter {filter:?} must look like key=value");
        };
        let value = serde_json::from_str::<Value>(value)
            .unwrap_or_else(|_| Value::String(value.to_string()));
        parsed = parsed.with(key.trim(), value);
    }
    Ok(parsed)
}

fn print_backfill(report: &BackfillReport) {
    if report.dry_run {
        println!("Dry run: {} task(s) would be claimed", report.would_claim.len());
        for id in &report.would_claim {
            println!("  {id}");
        }
        return;
    }

    print_rows(&[
        ("cycles", report.cycles.to_string()),
        ("claimed", report.claimed.to_string()),
        ("succeeded", report.succeeded.to_string()),
        ("failed", report.failed.to_string()),
        ("retried", report.retried.to_string()),
        ("released", report.released.to_string()),
        ("abandoned", report.abandoned.to_string()),
        ("expired", report.expired.to_string()),
        ("pending", report.remaining.pending().to_string()),
        ("stopped", format!("{:?}", report.stop_reason)),
        ("duration", format!("{} ms", report.duration_ms)),
    ]);
}

fn print_search(response: &SearchResponse) {
    println!(
        "{} match(es), page {} (size {}), model {}, query vector from {:?}",
        response.total_matches,
        response.page,
        response.page_size,
        response.model,
        response.cache_source
    );
    for (rank, result) in response.results.iter().enumerate() {
        let position = response.page * response.page_size + rank + 1;
        println!(
            "{position:>4}. {}  score={:.4}  cosine={:.4}",
            result.document_id, result.combined, result.similarity
        );
    }
    if !response.unranked.is_empty() {
        println!("not ranked: {}", response.unranked.join(", "));
    }
}
