//! Retry wrapper with exponential backoff for provider calls.
//!
//! The n-th retry waits `multiplier * 2^(n-1)` clamped to `[min_delay, max_delay]`.
//! A rate-limited failure first pauses for `rate_limit_pause` before the backoff.
//! All waits go through a [`Waiter`] so shutdown interrupts them.

use super::{ChatRequest, ChatResponse, Provider, ProviderError};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tender_common::{RetryConfig, Waiter};

/// Backoff policy for a [`RetryingProvider`].
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first call.
    pub max_attempts: u32,
    pub multiplier: Duration,
    pub min_delay: Duration,
    pub max_delay: Duration,
    /// Extra pause after a rate-limited failure.
    pub rate_limit_pause: Duration,
    /// Which failures are worth another attempt.
    pub retryable: fn(&ProviderError) -> bool,
}

fn retry_all(_: &ProviderError) -> bool {
    true
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            multiplier: Duration::from_secs(config.multiplier_secs),
            min_delay: Duration::from_secs(config.min_delay_secs),
            max_delay: Duration::from_secs(config.max_delay_secs),
            rate_limit_pause: Duration::from_secs(config.rate_limit_pause_secs),
            retryable: retry_all,
        }
    }

    /// Replace the retry predicate.
    pub fn with_retryable(mut self, retryable: fn(&ProviderError) -> bool) -> Self {
        self.retryable = retryable;
        self
    }

    /// Backoff before retry number `retry` (1-based).
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        let factor = 2_u32.saturating_pow(retry.saturating_sub(1));
        self.multiplier
            .saturating_mul(factor)
            .max(self.min_delay)
            .min(self.max_delay)
    }

    /// Total wait before retry number `retry` after `error`.
    pub fn delay_for(&self, retry: u32, error: &ProviderError) -> Duration {
        let backoff = self.backoff_delay(retry);
        if error.is_rate_limited() {
            self.rate_limit_pause + backoff
        } else {
            backoff
        }
    }

    fn should_retry(&self, error: &ProviderError) -> bool {
        !error.is_cancelled() && (self.retryable)(error)
    }
}

/// Wraps a provider so failed calls are retried according to a [`RetryPolicy`].
pub struct RetryingProvider<P> {
    inner: P,
    policy: RetryPolicy,
    waiter: Arc<dyn Waiter>,
}

impl<P: Provider> RetryingProvider<P> {
    pub fn new(inner: P, policy: RetryPolicy, waiter: Arc<dyn Waiter>) -> Self {
        Self {
            inner,
            policy,
            waiter,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }
}

#[async_trait]
impl<P: Provider> Provider for RetryingProvider<P> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let error = match self.inner.chat(request.clone()).await {
                Ok(response) => {
                    if attempt > 1 {
                        tracing::info!(
                            provider = self.inner.name(),
                            attempt,
                            "Provider recovered after retries"
                        );
                    }
                    return Ok(response);
                }
                Err(e) => e,
            };

            if attempt >= max_attempts || !self.policy.should_retry(&error) {
                if attempt > 1 {
                    tracing::error!(
                        provider = self.inner.name(),
                        attempts = attempt,
                        error = %error,
                        "Provider call failed after retries"
                    );
                }
                return Err(error);
            }

            let delay = self.policy.delay_for(attempt, &error);
            tracing::warn!(
                provider = self.inner.name(),
                attempt,
                max_attempts,
                rate_limited = error.is_rate_limited(),
                delay_secs = delay.as_secs(),
                error = %error,
                "Provider call failed, retrying"
            );

            if self.waiter.wait(delay).await.is_err() {
                return Err(ProviderError::cancelled(
                    self.inner.name(),
                    request.model.clone(),
                ));
            }
            attempt += 1;
        }
    }
}
