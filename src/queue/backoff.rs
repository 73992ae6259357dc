//! Exponential backoff with jitter for failed queue items.

use std::time::Duration;

use rand::Rng;

/// Default delay before the first retry.
pub const DEFAULT_BASE: Duration = Duration::from_secs(2);

/// Upper bound on the exponential part of the delay.
pub const DEFAULT_MAX: Duration = Duration::from_secs(300);

/// Retry delay policy: `min(base * 2^(n-1), max)` plus up to half of that
/// again as random jitter, where `n` is the retry count after the failure.
///
/// The jitter window never overlaps the next step, so for a fixed failure
/// time each retry waits strictly longer than the previous one until the
/// cap is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
    pub jitter: bool,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: DEFAULT_BASE,
            max: DEFAULT_MAX,
            jitter: true,
        }
    }
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            jitter: true,
        }
    }

    /// Deterministic variant (tests, reproducible schedules).
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Delay before the item becomes visible again after its `retry_count`-th failure.
    pub fn delay(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1).min(20);
        let step = self.base.saturating_mul(1u32 << exponent).min(self.max);

        if !self.jitter {
            return step;
        }

        let half_ms = (step.as_millis() / 2) as u64;
        let extra = rand::thread_rng().gen_range(0..=half_ms);
        step + Duration::from_millis(extra)
    }
}
