//! Retry and backoff around an [`EmbeddingProvider`].
//!
//! The adapter is the only place that decides whether a provider failure is
//! worth another call. Transient failures are retried with exponential backoff
//! plus jitter; rate limits use a longer floor and are reported to a
//! [`RetryObserver`] so callers can shed concurrency.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{EmbeddingError, Result};
use crate::provider::{EmbeddingProvider, EmbeddingRequest, EmbeddingResponse};

/// Backoff parameters for transient provider failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first call (so at most `max_retries + 1` calls).
    pub max_retries: u32,

    /// Base interval; doubles every attempt and bounds the jitter.
    pub base_delay_ms: u64,

    /// Minimum delay after a rate-limit response.
    pub rate_limit_floor_ms: u64,

    /// Upper bound for the exponential part of the delay.
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 500,
            rate_limit_floor_ms: 5_000,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// Policy that never sleeps. Useful in tests.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay_ms: 0,
            rate_limit_floor_ms: 0,
            max_delay_ms: 0,
        }
    }

    /// Delay before retry number `attempt` (1-based) after `error`.
    ///
    /// `base * 2^(attempt-1)` capped at `max_delay`, plus up to one `base` of
    /// jitter. Rate limits never wait less than the floor or the provider's
    /// retry-after hint.
    pub fn backoff_for_attempt(&self, attempt: u32, error: &EmbeddingError) -> Duration {
        let base = self.base_delay_ms;
        let exponent = attempt.saturating_sub(1).min(20);
        let exponential = base
            .saturating_mul(1u64 << exponent)
            .min(self.max_delay_ms);
        let jitter = if base == 0 {
            0
        } else {
            rand::rng().random_range(0..=base)
        };
        let mut delay = Duration::from_millis(exponential.saturating_add(jitter));

        if error.is_rate_limited() {
            delay = delay.max(Duration::from_millis(self.rate_limit_floor_ms));
            if let Some(hint) = error.retry_after() {
                delay = delay.max(hint.min(Duration::from_millis(self.max_delay_ms)));
            }
        }

        delay
    }
}

/// Hooks called by the adapter while it retries.
pub trait RetryObserver: Send + Sync {
    /// The provider answered with a rate-limit signal.
    fn on_rate_limited(&self) {}

    /// A retry is about to happen after `delay`.
    fn on_retry(&self, _attempt: u32, _delay: Duration) {}
}

/// Observer that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl RetryObserver for NoopObserver {}

/// Provider adapter: input checks, retries and backoff.
pub struct ProviderAdapter {
    provider: Arc<dyn EmbeddingProvider>,
    policy: RetryPolicy,
}

impl ProviderAdapter {
    /// Wrap a provider with the given retry policy.
    pub fn new(provider: Arc<dyn EmbeddingProvider>, policy: RetryPolicy) -> Self {
        Self { provider, policy }
    }

    /// The wrapped provider.
    pub fn provider(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.provider
    }

    /// The retry policy in use.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Embed `text` with `model`, retrying transient failures.
    pub async fn embed(&self, text: &str, model: &str) -> Result<EmbeddingResponse> {
        self.embed_observed(text, model, &NoopObserver).await
    }

    /// Like [`Self::embed`], reporting retry events to `observer`.
    pub async fn embed_observed(
        &self,
        text: &str,
        model: &str,
        observer: &dyn RetryObserver,
    ) -> Result<EmbeddingResponse> {
        if text.trim().is_empty() {
            return Err(EmbeddingError::InvalidInput(
                "cannot embed empty text".to_string(),
            ));
        }

        let request = EmbeddingRequest::new(text).with_model(model);
        let mut attempt = 0u32;

        loop {
            let err = match self.provider.embed(request.clone()).await {
                Ok(response) => return Ok(response),
                Err(err) => err,
            };

            if err.is_rate_limited() {
                observer.on_rate_limited();
            }

            if !err.is_transient() || attempt >= self.policy.max_retries {
                debug!(
                    "Giving up on {} after {} attempt(s): {err}",
                    self.provider.name(),
                    attempt + 1
                );
                return Err(err);
            }

            attempt += 1;
            let delay = self.policy.backoff_for_attempt(attempt, &err);
            warn!(
                "Embedding call to {} failed ({err}); retry {attempt}/{} in {delay:?}",
                self.provider.name(),
                self.policy.max_retries
            );
            observer.on_retry(attempt, delay);
            tokio::time::sleep(delay).await;
        }
    }
}
