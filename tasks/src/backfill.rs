//! Backfill orchestration.
//!
//! Runs claim → embed → write cycles until nothing is claimable, a task
//! limit is reached or the cycle budget runs out.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::BackfillConfig;
use crate::coordinator::QueueDepth;
use crate::error::Result;
use crate::pool::{CycleSummary, WorkerPool};

/// Why a backfill run ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// A cycle found nothing to claim.
    #[default]
    Idle,
    LimitReached,
    MaxCycles,
    DryRun,
}

/// Totals for a backfill run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackfillReport {
    pub dry_run: bool,
    pub cycles: usize,
    pub claimed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub retried: usize,
    pub released: usize,
    pub abandoned: usize,
    pub skipped: usize,
    /// Abandoned tasks moved to `error` because no attempts were left.
    pub expired: u64,
    /// Ids a dry run would have claimed.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub would_claim: Vec<String>,
    /// Queue state after the run.
    pub remaining: QueueDepth,
    pub stop_reason: StopReason,
    pub duration_ms: u64,
}

impl BackfillReport {
    fn absorb(&mut self, cycle: &CycleSummary) {
        self.cycles += 1;
        self.claimed += cycle.claimed;
        self.succeeded += cycle.succeeded;
        self.failed += cycle.failed;
        self.retried += cycle.retried;
        self.released += cycle.released;
        self.abandoned += cycle.abandoned;
        self.skipped += cycle.skipped;
    }
}

/// Drives a [`WorkerPool`] until the backlog is drained.
pub struct BackfillOrchestrator {
    pool: Arc<WorkerPool>,
    config: BackfillConfig,
}

impl BackfillOrchestrator {
    pub fn new(pool: Arc<WorkerPool>, config: BackfillConfig) -> Self {
        Self { pool, config }
    }

    /// Run cycles until a stop condition holds.
    pub async fn run(&self) -> Result<BackfillReport> {
        let started = Instant::now();
        let coordinator = self.pool.coordinator().clone();
        let mut report = BackfillReport {
            dry_run: self.config.dry_run,
            ..BackfillReport::default()
        };

        if self.config.dry_run {
            let limit = self.config.limit.unwrap_or(usize::MAX);
            report.would_claim = coordinator
                .peek_claimable(limit, Utc::now())
                .await?
                .into_iter()
                .map(|doc| doc.id)
                .collect();
            report.stop_reason = StopReason::DryRun;
            report.remaining = coordinator.queue_depth().await?;
            report.duration_ms = elapsed_ms(started);
            info!("Dry run: {} task(s) claimable", report.would_claim.len());
            return Ok(report);
        }

        let worker = self.pool.config();
        report.stop_reason = loop {
            if self
                .config
                .max_cycles
                .is_some_and(|max| report.cycles >= max)
            {
                break StopReason::MaxCycles;
            }

            let budget = match self.config.limit {
                Some(limit) => limit.saturating_sub(report.claimed),
                None => usize::MAX,
            };
            if budget == 0 {
                break StopReason::LimitReached;
            }

            report.expired += coordinator.expire_exhausted(Utc::now()).await?;

            let batch = worker.batch_size.min(budget);
            let cycle = self
                .pool
                .run_cycle(batch, worker.concurrency_limit)
                .await?;
            report.absorb(&cycle);

            if cycle.claimed == 0 {
                break StopReason::Idle;
            }
        };

        report.remaining = coordinator.queue_depth().await?;
        report.duration_ms = elapsed_ms(started);
        info!(
            "Backfill finished after {} cycle(s) ({:?}): {} succeeded, {} failed, {} retried, {} pending",
            report.cycles,
            report.stop_reason,
            report.succeeded,
            report.failed,
            report.retried,
            report.remaining.pending()
        );

        Ok(report)
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
