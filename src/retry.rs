//! Retry policy applied to individual remote calls.
//!
//! A [`RetrySpec`] is attached to a request and threaded into every retryable call
//! made while executing it. Retries stay local to one call; a failed download is
//! retried as a download and never falls back to another restore path.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::errors::BackupError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// Doubling delay capped at `maxDelay`, with jitter.
    #[default]
    Exponential,
    Fixed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetrySpec {
    pub max_attempts: u32,
    #[serde(with = "millis")]
    pub base_delay: Duration,
    #[serde(with = "millis")]
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
}

impl Default for RetrySpec {
    fn default() -> Self {
        RetrySpec {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            strategy: BackoffStrategy::Exponential,
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

impl RetrySpec {
    /// A single attempt, no retries.
    pub fn none() -> Self {
        RetrySpec {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), BackupError> {
        if self.max_attempts < 1 {
            return Err(BackupError::InvalidRequest(
                "retry.maxAttempts must be at least 1".to_string(),
            ));
        }
        if self.max_delay < self.base_delay {
            return Err(BackupError::InvalidRequest(format!(
                "retry.maxDelay ({}ms) is smaller than retry.baseDelay ({}ms)",
                self.max_delay.as_millis(),
                self.base_delay.as_millis()
            )));
        }
        Ok(())
    }

    /// Upper bound of the wait after the `failed_attempts`-th failure.
    pub fn delay_ceiling(&self, failed_attempts: u32) -> Duration {
        match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Exponential => {
                let exponent = failed_attempts.saturating_sub(1).min(31);
                self.base_delay
                    .checked_mul(1u32 << exponent)
                    .unwrap_or(self.max_delay)
                    .min(self.max_delay)
            }
        }
    }

    /// Wait after the `failed_attempts`-th failure. Exponential delays are jittered
    /// uniformly between half the ceiling and the ceiling.
    pub fn delay_for(&self, failed_attempts: u32) -> Duration {
        let ceiling = self.delay_ceiling(failed_attempts);
        match self.strategy {
            BackoffStrategy::Fixed => ceiling,
            BackoffStrategy::Exponential => {
                let ceiling_ms = ceiling.as_millis() as u64;
                if ceiling_ms == 0 {
                    return ceiling;
                }
                let floor_ms = ceiling_ms / 2;
                Duration::from_millis(rand::rng().random_range(floor_ms..=ceiling_ms))
            }
        }
    }
}

/// Runs `operation` until it succeeds, fails with a non-transient error, or the
/// attempts in `spec` are used up. The last error is returned unchanged.
pub async fn retry<T, E, F, Fut>(
    spec: &RetrySpec,
    what: &str,
    is_transient: impl Fn(&E) -> bool,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max_attempts = spec.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) if attempt < max_attempts && is_transient(&error) => {
                let delay = spec.delay_for(attempt);
                tracing::warn!(
                    operation = %what,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}
