//! # Retry Policy
//!
//! Bounded retries with exponential backoff.
//!
//! The first attempt runs immediately. Retry `n` (1-based) waits
//! `base_delay * 2^n`, so with the default one second base the waits are
//! 2s, 4s, 8s, 16s, 32s. Only errors the caller classifies as retryable are
//! retried; anything else, and the error of the final attempt, is returned
//! unchanged.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::DEFAULT_RETRY_COUNT;

/// Why a retried operation gave up.
#[derive(Debug)]
pub enum RetryError<E> {
    /// The last error: non-retryable, or from the final attempt.
    Failed { attempts: u32, error: E },
    /// Cancellation fired during an attempt or a backoff wait.
    Cancelled { attempts: u32 },
}

/// Exponential backoff policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
}

impl RetryPolicy {
    pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

    #[must_use]
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// Default base delay with a custom retry count.
    #[must_use]
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self::new(max_retries, Self::DEFAULT_BASE_DELAY)
    }

    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    #[must_use]
    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    /// Total attempts including the first one.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Wait before retry `retry` (1-based).
    #[must_use]
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(retry))
    }

    /// Run `operation` until it succeeds, fails non-retryably, runs out of
    /// attempts or `cancel` fires.
    ///
    /// `operation` receives the 1-based attempt number.
    pub async fn run<T, E, Op, Fut, R>(
        &self,
        cancel: &CancellationToken,
        mut operation: Op,
        is_retryable: R,
    ) -> Result<T, RetryError<E>>
    where
        Op: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;

            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(RetryError::Cancelled { attempts: attempt }),
                result = operation(attempt) => result,
            };

            let error = match result {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if !is_retryable(&error) || attempt >= self.max_attempts() {
                return Err(RetryError::Failed {
                    attempts: attempt,
                    error,
                });
            }

            let delay = self.delay_for_retry(attempt);
            warn!(
                attempt,
                max_attempts = self.max_attempts(),
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Attempt failed, retrying"
            );

            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(RetryError::Cancelled { attempts: attempt }),
                () = tokio::time::sleep(delay) => {}
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::with_max_retries(DEFAULT_RETRY_COUNT)
    }
}
