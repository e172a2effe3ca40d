//! Retry policy for calls into the key provider.
//!
//! Transient provider failures (timeouts, throttling, temporary outages) are
//! retried with exponential backoff up to a fixed attempt ceiling. Once the
//! ceiling is reached the failure is escalated to
//! [`ErrorKind::ProviderPermanent`]. Permanent failures are never retried.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind, Result};
use crate::key::{ProviderError, ProviderErrorKind};

/// Exponential backoff settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first call
    pub max_attempts: u32,
    /// Delay before the second attempt, in milliseconds
    pub initial_delay_ms: u64,
    /// Upper bound for any single delay, in milliseconds
    pub max_delay_ms: u64,
    /// Growth factor between consecutive delays
    pub multiplier: f64,
    /// Timeout applied to each individual provider call, in milliseconds
    pub call_timeout_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_delay_ms: 50,
            max_delay_ms: 2_000,
            multiplier: 2.0,
            call_timeout_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    /// A policy that makes a single attempt.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Checks the policy for values that would make retries meaningless.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::invalid_config("retry.max_attempts must be at least 1"));
        }
        if self.multiplier < 1.0 || !self.multiplier.is_finite() {
            return Err(Error::invalid_config("retry.multiplier must be >= 1.0"));
        }
        if self.call_timeout_ms == 0 {
            return Err(Error::invalid_config("retry.call_timeout_ms must be positive"));
        }
        Ok(())
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay = (self.initial_delay_ms as f64) * self.multiplier.powi(exponent);
        let delay = delay.min(self.max_delay_ms as f64);
        Duration::from_millis(delay as u64)
    }

    /// Per-call timeout.
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Runs a provider call under this policy.
    ///
    /// Each attempt is bounded by [`call_timeout`](Self::call_timeout); an
    /// elapsed timeout counts as a transient failure.
    pub async fn call_provider<T, F, Fut>(&self, operation: &'static str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, ProviderError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let outcome = match tokio::time::timeout(self.call_timeout(), call()).await {
                Ok(result) => result,
                Err(_) => Err(ProviderError::new(
                    ProviderErrorKind::Timeout,
                    format!("{} exceeded {}ms", operation, self.call_timeout_ms),
                )),
            };

            let err = match outcome {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !err.is_transient() {
                return Err(provider_error(operation, &err));
            }

            if attempt >= self.max_attempts {
                tracing::warn!(
                    operation,
                    attempts = attempt,
                    kind = %err.kind(),
                    "provider retries exhausted"
                );
                return Err(Error::new(
                    ErrorKind::ProviderPermanent,
                    format!(
                        "{} failed after {} attempts: {}",
                        operation,
                        attempt,
                        err.kind()
                    ),
                ));
            }

            let delay = self.delay_for_attempt(attempt);
            tracing::debug!(
                operation,
                attempt,
                delay_ms = delay.as_millis() as u64,
                kind = %err.kind(),
                "transient provider failure, backing off"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

/// Maps a provider error onto the crate taxonomy.
///
/// An integrity failure means the envelope does not authenticate against
/// its field, so it is reported as a malformed envelope.
pub(crate) fn provider_error(operation: &str, err: &ProviderError) -> Error {
    let kind = match err.kind() {
        ProviderErrorKind::IntegrityFailure => ErrorKind::MalformedEnvelope,
        _ if err.is_transient() => ErrorKind::ProviderTransient,
        _ => ErrorKind::ProviderPermanent,
    };
    Error::new(kind, format!("{}: {}", operation, err))
}
