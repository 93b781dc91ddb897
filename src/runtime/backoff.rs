//! Bounded retries with doubling delays for calls to remote services.
//!
//! Every wait between attempts watches a shutdown token, so a quit request
//! interrupts a retry sequence instead of waiting it out.

use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Total attempts, the first one included. Never below one.
    pub max_attempts: usize,
}

impl RetryPolicy {
    pub fn new(initial_delay: Duration, max_delay: Duration, max_attempts: usize) -> Self {
        Self {
            initial_delay,
            max_delay,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Delay after the failed `attempt` (1-based).
    pub fn delay_after(&self, attempt: usize) -> Duration {
        let doublings = attempt.saturating_sub(1).min(31) as u32;
        self.initial_delay
            .saturating_mul(1u32 << doublings)
            .min(self.max_delay)
    }
}

pub enum RetryDisposition {
    Retry,
    Abort,
}

#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("interrupted by shutdown after {attempts} attempt(s)")]
    Cancelled { attempts: usize },
    #[error("gave up after {attempts} attempt(s)")]
    Aborted {
        attempts: usize,
        #[source]
        source: E,
    },
    #[error("still failing after {attempts} attempt(s)")]
    Exhausted {
        attempts: usize,
        #[source]
        source: E,
    },
}

impl<E> RetryError<E> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RetryError::Cancelled { .. })
    }
}

/// Runs `operation` until it succeeds, `classify` aborts, the policy runs out
/// of attempts or `shutdown` fires.
///
/// `on_retry` sees every retryable failure with the delay before the next
/// attempt and whether that attempt will happen.
pub async fn retry<T, E, F, Fut, C, L>(
    policy: RetryPolicy,
    shutdown: &CancellationToken,
    mut operation: F,
    mut classify: C,
    mut on_retry: L,
) -> Result<T, RetryError<E>>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: FnMut(&E) -> RetryDisposition,
    L: FnMut(usize, Duration, &E, bool),
{
    let mut attempt = 0;
    loop {
        if shutdown.is_cancelled() {
            return Err(RetryError::Cancelled { attempts: attempt });
        }
        attempt += 1;

        let err = match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        if let RetryDisposition::Abort = classify(&err) {
            return Err(RetryError::Aborted {
                attempts: attempt,
                source: err,
            });
        }

        let delay = policy.delay_after(attempt);
        let will_retry = attempt < policy.max_attempts;
        on_retry(attempt, delay, &err, will_retry);
        if !will_retry {
            return Err(RetryError::Exhausted {
                attempts: attempt,
                source: err,
            });
        }

        if sleep_or_cancel(delay, shutdown).await {
            return Err(RetryError::Cancelled { attempts: attempt });
        }
    }
}

/// Sleeps for `delay`. Returns `true` when `shutdown` fired first.
pub async fn sleep_or_cancel(delay: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => true,
        _ = sleep(delay) => false,
    }
}
