//! Task claim coordinator.
//!
//! Turns the document store into a work queue. A task is claimable when it is
//! queued and due, or when its lock is older than `lock_ttl`, and in both
//! cases only while `claim_attempts < max_claim_attempts`. Every transition is
//! a conditional update that restates what the caller observed, so two
//! workers can never both win the same claim and a worker that lost its lock
//! cannot overwrite the new holder's result. No task state is kept here
//! between calls.

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{AttemptResetPolicy, ClaimConfig};
use crate::document::{Document, EmbeddingPayload, TaskStatus};
use crate::error::{Result, TaskError};
use crate::store::{DocumentStore, Filter, Projection, Update};

/// A task held by a worker.
#[derive(Debug, Clone)]
pub struct Claim {
    pub task_id: String,
    pub worker_id: String,
    /// Value of `claim_attempts` after this claim.
    pub attempt: u32,
    pub acquired_at: DateTime<Utc>,
    /// The document as it was when claimed.
    pub document: Document,
    /// Whether this claim took over an abandoned lock.
    pub reclaimed: bool,
}

/// What happened when a worker processed a claim.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Success(EmbeddingPayload),
    /// Worth another claim later.
    Retryable { error: String },
    /// Retrying will not help.
    Fatal { error: String },
}

/// Result of [`TaskCoordinator::finalize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeResult {
    /// The document moved to this status.
    Applied(TaskStatus),
    /// The claim was no longer held; nothing changed.
    Lost,
}

/// Document counts per task status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepth {
    pub queued: u64,
    pub in_progress: u64,
    pub ready: u64,
    pub error: u64,
}

impl QueueDepth {
    pub fn total(&self) -> u64 {
        self.queued + self.in_progress + self.ready + self.error
    }

    /// Tasks not yet in a terminal state.
    pub fn pending(&self) -> u64 {
        self.queued + self.in_progress
    }
}

/// Claim, finalize and reclaim embedding tasks.
pub struct TaskCoordinator {
    store: Arc<dyn DocumentStore>,
    config: ClaimConfig,
}

impl TaskCoordinator {
    /// Create a coordinator over `store`.
    pub fn new(store: Arc<dyn DocumentStore>, config: ClaimConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub fn config(&self) -> &ClaimConfig {
        &self.config
    }

    fn stale_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_sub_signed(self.config.lock_ttl())
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Documents that may be claimed at `now`.
    pub fn claimable_filter(&self, now: DateTime<Utc>) -> Filter {
        let queued = Filter::Status(TaskStatus::Queued).and(Filter::RetryDue(now));
        let abandoned = Filter::Status(TaskStatus::InProgress)
            .and(Filter::LockAcquiredBefore(self.stale_cutoff(now)));

        Filter::And(vec![
            queued.or(abandoned),
            Filter::AttemptsBelow(self.config.max_claim_attempts),
        ])
    }

    /// Filter matching a document still held by `claim`.
    fn held_by(claim: &Claim) -> Filter {
        Filter::And(vec![
            Filter::Id(claim.task_id.clone()),
            Filter::Status(TaskStatus::InProgress),
            Filter::LockOwner(claim.worker_id.clone()),
            Filter::AttemptsEqual(claim.attempt),
        ])
    }

    /// Claim up to `limit` tasks for `worker_id`.
    ///
    /// Only documents whose conditional update applied are returned; a
    /// document another worker claimed first is skipped and the search moves
    /// on to later candidates. If a claim write fails, the claims already won
    /// in this batch are released before the error is returned.
    pub async fn claim_batch(
        &self,
        limit: usize,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Claim>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let claimable = self.claimable_filter(now);
        let mut claims: Vec<Claim> = Vec::with_capacity(limit);
        let mut after: Option<String> = None;

        while claims.len() < limit {
            let page_size = (limit - claims.len()).saturating_mul(2);
            let page_filter = match &after {
                Some(id) => claimable.clone().and(Filter::IdAfter(id.clone())),
                None => claimable.clone(),
            };
            let candidates = match self
                .store
                .find_many(&page_filter, Projection::full(), Some(page_size))
                .await
            {
                Ok(candidates) => candidates,
                Err(e) => return Err(self.abort_batch(&claims, now, e).await),
            };
            let exhausted = candidates.len() < page_size;

            for doc in candidates {
                if claims.len() >= limit {
                    break;
                }
                after = Some(doc.id.clone());
                match self.try_claim(doc, &claimable, worker_id, now).await {
                    Ok(Some(claim)) => claims.push(claim),
                    Ok(None) => {}
                    Err(e) => return Err(self.abort_batch(&claims, now, e).await),
                }
            }

            if exhausted {
                break;
            }
        }

        Ok(claims)
    }

    /// Claim one candidate. `None` when another worker got there first.
    async fn try_claim(
        &self,
        mut doc: Document,
        claimable: &Filter,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Claim>> {
        let observed = doc.embedding.claim_attempts;
        let reclaimed = doc.embedding.status == TaskStatus::InProgress;
        let filter = Filter::Id(doc.id.clone())
            .and(claimable.clone())
            .and(Filter::AttemptsEqual(observed));
        let update = Update::new()
            .status(TaskStatus::InProgress)
            .lock(worker_id, now)
            .increment_attempts()
            .retry_after(None)
            .touch(now);

        if self.store.conditional_update(&filter, &update).await? == 0 {
            debug!("Lost claim race for {}", doc.id);
            return Ok(None);
        }

        if reclaimed {
            info!(
                "Reclaimed abandoned task {} from {} (attempt {})",
                doc.id,
                doc.embedding.lock_owner.as_deref().unwrap_or("unknown"),
                observed + 1
            );
        } else {
            debug!("Claimed task {} (attempt {})", doc.id, observed + 1);
        }

        update.apply(&mut doc);
        Ok(Some(Claim {
            task_id: doc.id.clone(),
            worker_id: worker_id.to_string(),
            attempt: doc.embedding.claim_attempts,
            acquired_at: now,
            document: doc,
            reclaimed,
        }))
    }

    /// Give back `claims` after a failed batch and hand back `error`.
    async fn abort_batch(
        &self,
        claims: &[Claim],
        now: DateTime<Utc>,
        error: TaskError,
    ) -> TaskError {
        warn!(
            "Claiming failed ({error}); releasing {} claim(s) already won",
            claims.len()
        );
        for claim in claims {
            if let Err(e) = self.release(claim, now).await {
                warn!("Could not release {}: {e}", claim.task_id);
            }
        }
        error
    }

    /// Record the outcome of a claim.
    ///
    /// Applies only while the claim is still held; otherwise returns
    /// [`FinalizeResult::Lost`] without error.
    pub async fn finalize(
        &self,
        claim: &Claim,
        outcome: TaskOutcome,
        now: DateTime<Utc>,
    ) -> Result<FinalizeResult> {
        let (status, update) = match outcome {
            TaskOutcome::Success(payload) => (
                TaskStatus::Ready,
                Update::new()
                    .status(TaskStatus::Ready)
                    .payload(payload)
                    .last_error(None)
                    .retry_after(None),
            ),
            TaskOutcome::Retryable { error } if claim.attempt >= self.config.max_claim_attempts => (
                TaskStatus::Error,
                Update::new()
                    .status(TaskStatus::Error)
                    .last_error(Some(format!("attempts exhausted: {error}")))
                    .retry_after(None),
            ),
            TaskOutcome::Retryable { error } => (
                TaskStatus::Queued,
                Update::new()
                    .status(TaskStatus::Queued)
                    .last_error(Some(error))
                    .retry_after(Some(self.retry_at(claim.attempt, now))),
            ),
            TaskOutcome::Fatal { error } => (
                TaskStatus::Error,
                Update::new()
                    .status(TaskStatus::Error)
                    .last_error(Some(error))
                    .retry_after(None),
            ),
        };
        let update = update.clear_lock().touch(now);

        if self.store.conditional_update(&Self::held_by(claim), &update).await? == 0 {
            debug!(
                "Claim on {} (attempt {}) no longer held; skipping finalize",
                claim.task_id, claim.attempt
            );
            return Ok(FinalizeResult::Lost);
        }

        match status {
            TaskStatus::Error => warn!("Task {} failed permanently", claim.task_id),
            _ => debug!("Task {} finalized as {status}", claim.task_id),
        }
        Ok(FinalizeResult::Applied(status))
    }

    /// When a task that failed on `attempt` becomes claimable again.
    fn retry_at(&self, attempt: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        let factor = 1i32 << attempt.saturating_sub(1).min(16);
        let delay = self
            .config
            .requeue_delay()
            .checked_mul(factor)
            .unwrap_or(TimeDelta::MAX)
            .min(self.config.lock_ttl());
        now.checked_add_signed(delay)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Give back a claim that was never started. The attempt still counts.
    pub async fn release(&self, claim: &Claim, now: DateTime<Utc>) -> Result<bool> {
        let update = Update::new()
            .status(TaskStatus::Queued)
            .clear_lock()
            .touch(now);
        let applied = self
            .store
            .conditional_update(&Self::held_by(claim), &update)
            .await?;

        if applied > 0 {
            debug!("Released unstarted task {}", claim.task_id);
        }
        Ok(applied > 0)
    }

    /// Move abandoned tasks that have no attempts left to `error`.
    pub async fn expire_exhausted(&self, now: DateTime<Utc>) -> Result<u64> {
        let filter = Filter::And(vec![
            Filter::Status(TaskStatus::InProgress),
            Filter::LockAcquiredBefore(self.stale_cutoff(now)),
            Filter::AttemptsAtLeast(self.config.max_claim_attempts),
        ]);
        let update = Update::new()
            .status(TaskStatus::Error)
            .clear_lock()
            .last_error(Some("attempts exhausted: lock expired".to_string()))
            .touch(now);

        let expired = self.store.conditional_update(&filter, &update).await?;
        if expired > 0 {
            warn!("Expired {expired} abandoned task(s) with no attempts left");
        }
        Ok(expired)
    }

    /// Attempt count to store after a manual reset.
    fn reset_attempts(&self, observed: u32) -> u32 {
        match self.config.attempt_reset {
            AttemptResetPolicy::Reset => 0,
            AttemptResetPolicy::CarryOver => {
                observed.min(self.config.max_claim_attempts.saturating_sub(1))
            }
        }
    }

    /// Put an `error` or `ready` task back in the queue.
    ///
    /// Returns `false` when the task is queued or in progress.
    pub async fn requeue(&self, id: &str, now: DateTime<Utc>) -> Result<bool> {
        let doc = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| TaskError::NotFound(id.to_string()))?;

        let observed = doc.embedding.status;
        if !matches!(observed, TaskStatus::Error | TaskStatus::Ready) {
            debug!("Not re-queueing {id}: status is {observed}");
            return Ok(false);
        }

        let attempts = doc.embedding.claim_attempts;
        let filter = Filter::And(vec![
            Filter::Id(id.to_string()),
            Filter::Status(observed),
            Filter::AttemptsEqual(attempts),
        ]);
        let update = Self::reset_update(now).attempts(self.reset_attempts(attempts));

        let applied = self.store.conditional_update(&filter, &update).await? > 0;
        if applied {
            info!("Re-queued {id} (was {observed})");
        }
        Ok(applied)
    }

    /// Discard the embedding of a document whose content changed.
    ///
    /// Any current holder loses its claim and its result will be dropped.
    pub async fn invalidate(&self, id: &str, now: DateTime<Utc>) -> Result<bool> {
        let doc = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| TaskError::NotFound(id.to_string()))?;

        let attempts = doc.embedding.claim_attempts;
        let filter = Filter::Id(id.to_string()).and(Filter::AttemptsEqual(attempts));
        let update = Self::reset_update(now).attempts(self.reset_attempts(attempts));

        let applied = self.store.conditional_update(&filter, &update).await? > 0;
        if applied {
            info!("Invalidated embedding for {id}");
        }
        Ok(applied)
    }

    fn reset_update(now: DateTime<Utc>) -> Update {
        Update::new()
            .status(TaskStatus::Queued)
            .clear_lock()
            .clear_result()
            .retry_after(None)
            .last_error(None)
            .touch(now)
    }

    /// Count documents per status.
    pub async fn queue_depth(&self) -> Result<QueueDepth> {
        let mut depth = QueueDepth::default();
        for status in TaskStatus::ALL {
            let count = self.store.count(&Filter::Status(status)).await?;
            match status {
                TaskStatus::Queued => depth.queued = count,
                TaskStatus::InProgress => depth.in_progress = count,
                TaskStatus::Ready => depth.ready = count,
                TaskStatus::Error => depth.error = count,
            }
        }
        Ok(depth)
    }

    /// Documents a claim at `now` would consider, without claiming them.
    pub async fn peek_claimable(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<Document>> {
        self.store
            .find_many(
                &self.claimable_filter(now),
                Projection::status_only(),
                Some(limit),
            )
            .await
    }
}
