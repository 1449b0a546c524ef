//! Bounded retry with linear backoff.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::config::model::RetryConfig;
use crate::error::{ErrorKind, StorageError, TranscodeError};

/// Errors that know whether retrying could help.
pub trait Classify {
    fn kind(&self) -> ErrorKind;
}

impl Classify for TranscodeError {
    fn kind(&self) -> ErrorKind {
        TranscodeError::kind(self)
    }
}

impl Classify for StorageError {
    fn kind(&self) -> ErrorKind {
        StorageError::kind(self)
    }
}

/// Retry schedule for a single operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Backoff unit. The wait after attempt N is `N * base_delay`.
    pub base_delay: Duration,
    /// Give up on the first permanent error instead of spending the remaining attempts.
    pub short_circuit_permanent: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            short_circuit_permanent: false,
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_millis(config.base_delay_ms),
            short_circuit_permanent: config.short_circuit_permanent,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the given (1-based) failed attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }

    /// Attempts actually made. Zero is treated as one.
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// The last error of an operation that ran out of attempts.
#[derive(Debug)]
pub struct RetryExhausted<E> {
    /// Attempts made before giving up.
    pub attempts: u32,
    /// Error returned by the final attempt.
    pub source: E,
}

impl<E: fmt::Display> fmt::Display for RetryExhausted<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gave up after {} attempt(s): {}", self.attempts, self.source)
    }
}

impl<E: std::error::Error + 'static> std::error::Error for RetryExhausted<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// Runs `operation` until it succeeds or the policy's attempts are used up.
///
/// The closure receives the 1-based attempt number. There is no wait after the
/// final failure.
pub async fn retry<T, E, F, Fut>(policy: &RetryPolicy, mut operation: F) -> Result<T, RetryExhausted<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Classify + fmt::Display,
{
    let max_attempts = policy.attempts();
    let mut attempt = 1;

    loop {
        let error = match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        let permanent = error.kind() == ErrorKind::Permanent;
        if attempt >= max_attempts || (permanent && policy.short_circuit_permanent) {
            return Err(RetryExhausted {
                attempts: attempt,
                source: error,
            });
        }

        // The caller logs the failure itself.
        let delay = policy.delay_for(attempt);
        debug!(
            attempt,
            max_attempts,
            permanent,
            delay_ms = delay.as_millis() as u64,
            "Backing off before next attempt"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}
