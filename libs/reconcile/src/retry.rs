//! Bounded retry for optimistic concurrency conflicts.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::backoff::BackoffPolicy;
use crate::DEFAULT_CONFLICT_ATTEMPTS;

/// Classifies errors for [`retry_on_conflict`].
pub trait Retryable {
    /// Returns true if the write lost an optimistic concurrency race.
    fn is_conflict(&self) -> bool;
}

/// How many times to retry a conflicting write, and how long to wait between
/// attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub attempts: u32,

    pub backoff: BackoffPolicy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_CONFLICT_ATTEMPTS,
            backoff: BackoffPolicy {
                base: Duration::from_millis(10),
                max: Duration::from_millis(100),
                jitter: 0.1,
            },
        }
    }
}

/// Run a read-modify-write closure, retrying while it fails with a conflict.
///
/// The closure must fetch a fresh copy of the object on every call. Errors
/// that are not conflicts return immediately; once attempts are exhausted
/// the last conflict is returned.
pub async fn retry_on_conflict<T, E, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, E>
where
    E: Retryable,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 0;

    loop {
        match op().await {
            Err(e) if e.is_conflict() && attempt + 1 < attempts => {
                let delay = policy.backoff.delay(attempt);
                debug!(attempt, delay_ms = delay.as_millis() as u64, "Write conflict, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            result => return result,
        }
    }
}
