//! Exponential backoff with jitter.

use std::time::Duration;

use rand::Rng;

use crate::{DEFAULT_QUEUE_BASE_DELAY, DEFAULT_QUEUE_MAX_DELAY};

/// Exponential backoff configuration.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Base delay for first retry.
    pub base: Duration,

    /// Maximum delay.
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: DEFAULT_QUEUE_BASE_DELAY,
            max: DEFAULT_QUEUE_MAX_DELAY,
            jitter: 0.1,
        }
    }
}

impl BackoffPolicy {
    /// Backoff without jitter, mostly useful in tests.
    pub fn fixed_curve(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            jitter: 0.0,
        }
    }

    /// Calculate delay for the given attempt number, starting at zero.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.min(62) as i32;
        let delay = self.base.as_millis() as f64 * 2.0_f64.powi(exp);
        let delay = delay.min(self.max.as_millis() as f64);

        let jitter = if self.jitter > 0.0 {
            let range = delay * self.jitter.min(1.0);
            rand::rng().random_range(-range..=range)
        } else {
            0.0
        };

        Duration::from_millis((delay + jitter).max(0.0) as u64)
    }
}
