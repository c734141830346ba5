//! Semaphore-backed slot pool with shrinkable concurrency.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use embedq_embeddings::RetryObserver;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::warn;

use crate::error::{Result, TaskError};

/// Bounds concurrent provider calls.
///
/// Each rate-limit signal retires one slot until the next [`Throttle::resize`],
/// never going below one. A slot retired while all slots are in use is taken
/// back from the next slot returned. Slots held by calls that outlive a cycle
/// stay counted against the limit until those calls finish.
pub struct Throttle {
    semaphore: Arc<Semaphore>,
    limit: AtomicUsize,
    effective: AtomicUsize,
    owed: Arc<AtomicUsize>,
}

impl Throttle {
    /// Create a throttle with `limit` slots (at least one).
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            limit: AtomicUsize::new(limit),
            effective: AtomicUsize::new(limit),
            owed: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Set the limit to `limit` slots (at least one) and undo any
    /// rate-limit reductions. Slots currently held are not interrupted.
    pub fn resize(&self, limit: usize) {
        let limit = limit.max(1);
        self.limit.store(limit, Ordering::SeqCst);
        let previous = self.effective.swap(limit, Ordering::SeqCst);

        if limit > previous {
            let mut grow = limit - previous;
            while grow > 0 {
                let cancelled = self
                    .owed
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                if !cancelled {
                    break;
                }
                grow -= 1;
            }
            self.semaphore.add_permits(grow);
        } else {
            for _ in limit..previous {
                self.retire_one();
            }
        }
    }

    fn retire_one(&self) {
        match self.semaphore.try_acquire() {
            Ok(permit) => permit.forget(),
            Err(_) => {
                self.owed.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    /// Wait for a free slot.
    pub async fn acquire(&self) -> Result<Slot> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| TaskError::PoolClosed)?;

        Ok(Slot {
            permit: Some(permit),
            owed: self.owed.clone(),
        })
    }

    /// Retire one slot. Returns `false` when only one is left.
    pub fn reduce(&self) -> bool {
        let reduced = self
            .effective
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                n.checked_sub(1).filter(|left| *left >= 1)
            })
            .is_ok();

        if reduced {
            self.retire_one();
        }
        reduced
    }

    /// Slots currently allowed.
    pub fn effective(&self) -> usize {
        self.effective.load(Ordering::SeqCst)
    }

    /// Slots configured by the last resize.
    pub fn limit(&self) -> usize {
        self.limit.load(Ordering::SeqCst)
    }
}

impl RetryObserver for Throttle {
    fn on_rate_limited(&self) {
        if self.reduce() {
            warn!(
                "Provider rate limited; concurrency reduced to {}/{}",
                self.effective(),
                self.limit()
            );
        }
    }
}

/// A held slot. Returned to the throttle on drop.
pub struct Slot {
    permit: Option<OwnedSemaphorePermit>,
    owed: Arc<AtomicUsize>,
}

impl Drop for Slot {
    fn drop(&mut self) {
        let retire = self
            .owed
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if retire {
            if let Some(permit) = self.permit.take() {
                permit.forget();
            }
        }
    }
}
