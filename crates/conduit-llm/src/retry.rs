//! Backoff schedule and a generic retry loop

use std::future::Future;
use std::time::Duration;

use conduit_config::{JitterMode, RetryConfig};
use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::classify::classify_error;
use crate::error::LlmError;

/// Exponential backoff with optional jitter
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max: Duration,
    pub multiplier: f64,
    pub jitter: JitterMode,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: JitterMode::Full,
            max_attempts: 3,
        }
    }
}

impl TryFrom<&RetryConfig> for RetryPolicy {
    type Error = anyhow::Error;

    fn try_from(config: &RetryConfig) -> Result<Self, Self::Error> {
        Ok(Self {
            base: config.delay()?,
            max: config.max_delay()?,
            multiplier: config.multiplier,
            jitter: config.jitter,
            max_attempts: config.attempts.max(1),
        })
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, given the previous delay if any
    ///
    /// `attempt` is 1-based: the delay after the first failure is computed
    /// with `attempt = 1`.
    pub fn compute_delay(&self, attempt: u32, previous: Option<Duration>) -> Duration {
        let base = self.base.as_secs_f64();
        let max = self.max.as_secs_f64().max(base);
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let scheduled = (base * self.multiplier.powi(exponent)).min(max);

        let mut rng = rand::rng();
        let secs = match self.jitter {
            JitterMode::None => scheduled,
            JitterMode::Full => rng.random_range(0.0..=scheduled),
            JitterMode::Equal => scheduled / 2.0 + rng.random_range(0.0..=scheduled / 2.0),
            JitterMode::Decorrelated => {
                // Capped before sampling so the range bound is always finite
                let upper = (previous.map_or(base, |p| p.as_secs_f64()) * self.multiplier).min(max);
                if upper <= base { base } else { rng.random_range(base..=upper) }
            }
        };

        Duration::try_from_secs_f64(secs).unwrap_or(self.max)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent
    ///
    /// Backoff sleeps observe `cancel`.
    ///
    /// # Errors
    ///
    /// Returns the last error from `op`, or [`LlmError::Aborted`] if
    /// cancelled while waiting
    pub async fn execute<T, F, Fut>(&self, provider: &str, cancel: &CancellationToken, mut op: F) -> Result<T, LlmError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, LlmError>>,
    {
        let mut previous = None;
        let mut attempt = 1;

        loop {
            let error = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            let classification = classify_error(provider, &error);
            if !classification.retryable || attempt >= self.max_attempts {
                return Err(error);
            }

            let delay = self.compute_delay(attempt, previous);
            previous = Some(delay);

            tracing::warn!(
                provider,
                attempt,
                category = %classification.kind,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "retrying after error: {error}"
            );

            sleep_cancellable(delay, cancel).await?;
            attempt += 1;
        }
    }
}

/// Sleep for `duration` unless `cancel` fires first
pub(crate) async fn sleep_cancellable(duration: Duration, cancel: &CancellationToken) -> Result<(), LlmError> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(LlmError::Aborted),
        () = tokio::time::sleep(duration) => Ok(()),
    }
}
