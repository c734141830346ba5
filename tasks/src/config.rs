//! Configuration for claiming, workers and backfill runs.

use std::time::Duration;

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TaskError};

/// What happens to `claim_attempts` when a task is manually re-queued.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptResetPolicy {
    /// Start over at zero attempts.
    #[default]
    Reset,
    /// Keep the count; the task gets only the attempts it has left.
    CarryOver,
}

/// Claim and lock configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClaimConfig {
    /// Age after which a lock is considered abandoned (in seconds).
    pub lock_ttl_secs: u64,

    /// Claims allowed per task before it becomes terminal.
    pub max_claim_attempts: u32,

    /// Base delay before a failed task becomes claimable again (in seconds).
    pub requeue_delay_secs: u64,

    /// Attempt handling on manual re-queue and invalidation.
    pub attempt_reset: AttemptResetPolicy,
}

impl Default for ClaimConfig {
    fn default() -> Self {
        Self {
            lock_ttl_secs: 300,
            max_claim_attempts: 5,
            requeue_delay_secs: 30,
            attempt_reset: AttemptResetPolicy::Reset,
        }
    }
}

impl ClaimConfig {
    /// Set the lock TTL.
    pub fn with_lock_ttl_secs(mut self, secs: u64) -> Self {
        self.lock_ttl_secs = secs;
        self
    }

    /// Set the attempt bound.
    pub fn with_max_claim_attempts(mut self, attempts: u32) -> Self {
        self.max_claim_attempts = attempts;
        self
    }

    /// Set the re-queue delay.
    pub fn with_requeue_delay_secs(mut self, secs: u64) -> Self {
        self.requeue_delay_secs = secs;
        self
    }

    /// Set the attempt reset policy.
    pub fn with_attempt_reset(mut self, policy: AttemptResetPolicy) -> Self {
        self.attempt_reset = policy;
        self
    }

    pub fn lock_ttl(&self) -> TimeDelta {
        seconds(self.lock_ttl_secs)
    }

    pub fn requeue_delay(&self) -> TimeDelta {
        seconds(self.requeue_delay_secs)
    }

    /// Check the values make sense.
    pub fn validate(&self) -> Result<()> {
        if self.max_claim_attempts == 0 {
            return Err(TaskError::Config(
                "max_claim_attempts must be at least 1".to_string(),
            ));
        }
        if self.lock_ttl_secs == 0 {
            return Err(TaskError::Config("lock_ttl_secs must be positive".to_string()));
        }
        Ok(())
    }
}

/// Worker pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Tasks claimed per cycle.
    pub batch_size: usize,

    /// Provider calls in flight at once.
    pub concurrency_limit: usize,

    /// Deadline for one cycle (in seconds).
    pub cycle_timeout_secs: u64,

    /// Fixed worker id. A random one is generated when unset.
    pub worker_id: Option<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            concurrency_limit: 4,
            cycle_timeout_secs: 120,
            worker_id: None,
        }
    }
}

impl WorkerConfig {
    /// Set the batch size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the concurrency limit.
    pub fn with_concurrency_limit(mut self, limit: usize) -> Self {
        self.concurrency_limit = limit;
        self
    }

    /// Set the cycle deadline.
    pub fn with_cycle_timeout_secs(mut self, secs: u64) -> Self {
        self.cycle_timeout_secs = secs;
        self
    }

    /// Use a fixed worker id.
    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = Some(id.into());
        self
    }

    pub fn cycle_timeout(&self) -> Duration {
        Duration::from_secs(self.cycle_timeout_secs)
    }

    /// Check the values make sense.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(TaskError::Config("batch_size must be at least 1".to_string()));
        }
        if self.concurrency_limit == 0 {
            return Err(TaskError::Config(
                "concurrency_limit must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Backfill run configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackfillConfig {
    /// Maximum tasks claimed over the whole run.
    pub limit: Option<usize>,

    /// Maximum cycles to run.
    pub max_cycles: Option<usize>,

    /// List what would be claimed without changing anything.
    pub dry_run: bool,
}

impl BackfillConfig {
    /// Cap the number of claimed tasks.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Cap the number of cycles.
    pub fn with_max_cycles(mut self, cycles: usize) -> Self {
        self.max_cycles = Some(cycles);
        self
    }

    /// Only report what would be claimed.
    pub fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }
}

pub(crate) fn seconds(secs: u64) -> TimeDelta {
    i64::try_from(secs)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .unwrap_or(TimeDelta::MAX)
}
