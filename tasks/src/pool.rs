//! Bounded-concurrency embedding worker pool.
//!
//! A cycle claims a batch, then hands each claim to its own task once a
//! throttle slot is free. The task renders the input text, calls the provider
//! through the retrying adapter, checks the vector dimension and finalizes the
//! claim. Claims still waiting for a slot at the cycle deadline are released;
//! tasks already calling the provider are left running and counted as
//! abandoned, to be reclaimed through the stale-lock path if they never
//! finish. The throttle belongs to the pool, so an abandoned call keeps its
//! slot into later cycles until it returns.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use embedq_embeddings::{EmbeddingError, ProviderAdapter};
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::coordinator::{Claim, FinalizeResult, TaskCoordinator, TaskOutcome};
use crate::document::{EmbeddingPayload, TaskStatus};
use crate::error::Result;
use crate::text::TextTemplate;
use crate::throttle::{Slot, Throttle};

/// Counts for one cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleSummary {
    /// Tasks claimed at the start of the cycle.
    pub claimed: usize,
    /// Finalized as `ready`.
    pub succeeded: usize,
    /// Finalized as `error`.
    pub failed: usize,
    /// Put back in the queue after a retryable failure.
    pub retried: usize,
    /// Given back unstarted at the deadline.
    pub released: usize,
    /// Still running at the deadline, or left holding their lock.
    pub abandoned: usize,
    /// Claim lost before finalize.
    pub skipped: usize,
    /// Concurrency left after rate-limit reductions.
    pub effective_concurrency: usize,
    pub duration_ms: u64,
}

impl CycleSummary {
    fn record(&mut self, result: TaskResult) {
        match result {
            TaskResult::Succeeded => self.succeeded += 1,
            TaskResult::Failed => self.failed += 1,
            TaskResult::Retried => self.retried += 1,
            TaskResult::Released => self.released += 1,
            TaskResult::Abandoned => self.abandoned += 1,
            TaskResult::Skipped => self.skipped += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskResult {
    Succeeded,
    Failed,
    Retried,
    Released,
    Abandoned,
    Skipped,
}

/// Everything a spawned task needs.
#[derive(Clone)]
struct TaskContext {
    coordinator: Arc<TaskCoordinator>,
    adapter: Arc<ProviderAdapter>,
    template: Arc<dyn TextTemplate>,
    throttle: Arc<Throttle>,
    model: String,
    dimension: usize,
}

/// Claims embedding tasks and runs them against the provider.
pub struct WorkerPool {
    worker_id: String,
    coordinator: Arc<TaskCoordinator>,
    adapter: Arc<ProviderAdapter>,
    template: Arc<dyn TextTemplate>,
    throttle: Arc<Throttle>,
    config: WorkerConfig,
    model: String,
    dimension: usize,
}

impl WorkerPool {
    /// Create a pool producing `dimension`-sized vectors with `model`.
    pub fn new(
        coordinator: Arc<TaskCoordinator>,
        adapter: Arc<ProviderAdapter>,
        template: Arc<dyn TextTemplate>,
        config: WorkerConfig,
        model: impl Into<String>,
        dimension: usize,
    ) -> Self {
        let worker_id = config
            .worker_id
            .clone()
            .unwrap_or_else(|| format!("worker-{}", Uuid::new_v4()));

        Self {
            worker_id,
            coordinator,
            adapter,
            template,
            throttle: Arc::new(Throttle::new(config.concurrency_limit)),
            config,
            model: model.into(),
            dimension,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn coordinator(&self) -> &Arc<TaskCoordinator> {
        &self.coordinator
    }

    /// Run one cycle with the configured batch size and concurrency.
    pub async fn run(&self) -> Result<CycleSummary> {
        self.run_cycle(self.config.batch_size, self.config.concurrency_limit)
            .await
    }

    /// Claim up to `batch_size` tasks and process them with at most
    /// `concurrency_limit` provider calls in flight, counting calls left
    /// running by earlier cycles. Rate-limit reductions from earlier cycles
    /// are undone.
    ///
    /// Only claiming can fail the cycle; every per-task problem ends up in the
    /// summary.
    pub async fn run_cycle(
        &self,
        batch_size: usize,
        concurrency_limit: usize,
    ) -> Result<CycleSummary> {
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + self.config.cycle_timeout();
        let throttle = self.throttle.clone();
        throttle.resize(concurrency_limit);

        let claims = self
            .coordinator
            .claim_batch(batch_size, &self.worker_id, Utc::now())
            .await?;
        let mut summary = CycleSummary {
            claimed: claims.len(),
            ..CycleSummary::default()
        };

        if claims.is_empty() {
            summary.effective_concurrency = throttle.effective();
            summary.duration_ms = elapsed_ms(started);
            debug!("{}: nothing to claim", self.worker_id);
            return Ok(summary);
        }

        let ctx = TaskContext {
            coordinator: self.coordinator.clone(),
            adapter: self.adapter.clone(),
            template: self.template.clone(),
            throttle: throttle.clone(),
            model: self.model.clone(),
            dimension: self.dimension,
        };

        let mut set = JoinSet::new();
        let mut pending = claims.into_iter();
        while let Some(claim) = pending.next() {
            let slot = match tokio::time::timeout_at(deadline, throttle.acquire()).await {
                Ok(Ok(slot)) => slot,
                Ok(Err(e)) => {
                    error!("Worker slot unavailable: {e}");
                    summary.record(self.release(&claim).await);
                    continue;
                }
                Err(_) => {
                    warn!(
                        "{}: cycle deadline reached, releasing unstarted tasks",
                        self.worker_id
                    );
                    summary.record(self.release(&claim).await);
                    for claim in pending.by_ref() {
                        summary.record(self.release(&claim).await);
                    }
                    break;
                }
            };

            let ctx = ctx.clone();
            set.spawn(async move { process(ctx, claim, slot).await });
        }

        loop {
            match tokio::time::timeout_at(deadline, set.join_next()).await {
                Ok(Some(Ok(result))) => summary.record(result),
                Ok(Some(Err(e))) => {
                    error!("Embedding task aborted: {e}");
                    summary.record(TaskResult::Abandoned);
                }
                Ok(None) => break,
                Err(_) => {
                    let in_flight = set.len();
                    warn!(
                        "{}: cycle deadline reached with {in_flight} task(s) in flight",
                        self.worker_id
                    );
                    summary.abandoned += in_flight;
                    set.detach_all();
                    break;
                }
            }
        }

        summary.effective_concurrency = throttle.effective();
        summary.duration_ms = elapsed_ms(started);
        info!(
            "{}: cycle done: claimed={} succeeded={} failed={} retried={} released={} abandoned={} skipped={} concurrency={}",
            self.worker_id,
            summary.claimed,
            summary.succeeded,
            summary.failed,
            summary.retried,
            summary.released,
            summary.abandoned,
            summary.skipped,
            summary.effective_concurrency
        );

        Ok(summary)
    }

    async fn release(&self, claim: &Claim) -> TaskResult {
        match self.coordinator.release(claim, Utc::now()).await {
            Ok(true) => TaskResult::Released,
            Ok(false) => TaskResult::Skipped,
            Err(e) => {
                error!("Failed to release {}: {e}", claim.task_id);
                TaskResult::Abandoned
            }
        }
    }
}

/// Embed one claimed document and record the outcome.
async fn process(ctx: TaskContext, claim: Claim, slot: Slot) -> TaskResult {
    let text = ctx.template.render(&claim.document);
    let response = ctx
        .adapter
        .embed_observed(&text, &ctx.model, ctx.throttle.as_ref())
        .await;
    drop(slot);

    let outcome = match response {
        Ok(response) if response.embedding.len() != ctx.dimension => {
            let mismatch = EmbeddingError::DimensionMismatch {
                expected: ctx.dimension,
                actual: response.embedding.len(),
            };
            warn!("Rejecting vector for {}: {mismatch}", claim.task_id);
            TaskOutcome::Fatal {
                error: mismatch.to_string(),
            }
        }
        Ok(response) => TaskOutcome::Success(EmbeddingPayload {
            vector: response.embedding,
            model_id: ctx.model.clone(),
            generated_at: Utc::now(),
        }),
        Err(e) if e.is_transient() => {
            debug!("Transient failure for {}: {e}", claim.task_id);
            TaskOutcome::Retryable {
                error: e.to_string(),
            }
        }
        Err(e) => {
            warn!("Permanent failure for {}: {e}", claim.task_id);
            TaskOutcome::Fatal {
                error: e.to_string(),
            }
        }
    };

    match ctx.coordinator.finalize(&claim, outcome, Utc::now()).await {
        Ok(FinalizeResult::Applied(TaskStatus::Ready)) => TaskResult::Succeeded,
        Ok(FinalizeResult::Applied(TaskStatus::Queued)) => TaskResult::Retried,
        Ok(FinalizeResult::Applied(TaskStatus::Error)) => TaskResult::Failed,
        Ok(FinalizeResult::Applied(TaskStatus::InProgress)) | Ok(FinalizeResult::Lost) => {
            TaskResult::Skipped
        }
        Err(e) => {
            error!("Failed to finalize {}: {e}", claim.task_id);
            TaskResult::Abandoned
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
