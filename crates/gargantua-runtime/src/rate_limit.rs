//! Requeue delays for failing work items
//!
//! Two limits combine, and the larger delay wins:
//! - per key, an exponential backoff that doubles with every failure
//! - overall, a token bucket so a burst of failing keys cannot hammer the
//!   API server

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::time::Duration;

use governor::clock::{Clock, DefaultClock};
use governor::{DefaultDirectRateLimiter, Quota};
use parking_lot::Mutex;

/// First retry delay for a failing key
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);
/// Cap on the per-key delay
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);
/// Overall requeue rate
pub const DEFAULT_QPS: u32 = 10;
/// Overall burst
pub const DEFAULT_BURST: u32 = 100;

/// Per-key exponential backoff combined with an overall token bucket
pub struct RateLimiter {
    base_delay: Duration,
    max_delay: Duration,
    failures: Mutex<HashMap<String, u32>>,
    bucket: Option<DefaultDirectRateLimiter>,
    clock: DefaultClock,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY).with_bucket(DEFAULT_QPS, DEFAULT_BURST)
    }
}

impl RateLimiter {
    /// Per-key backoff only
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            failures: Mutex::new(HashMap::new()),
            bucket: None,
            clock: DefaultClock::default(),
        }
    }

    /// Add an overall token bucket of `qps` with `burst`
    pub fn with_bucket(mut self, qps: u32, burst: u32) -> Self {
        let quota = NonZeroU32::new(qps).map(|qps| {
            let quota = Quota::per_second(qps);
            match NonZeroU32::new(burst) {
                Some(burst) => quota.allow_burst(burst),
                None => quota,
            }
        });
        self.bucket = quota.map(DefaultDirectRateLimiter::direct);
        self
    }

    /// Delay before `key` may be retried; counts as one more failure
    pub fn when(&self, key: &str) -> Duration {
        let exponent = {
            let mut failures = self.failures.lock();
            let count = failures.entry(key.to_string()).or_insert(0);
            let exponent = *count;
            *count = count.saturating_add(1);
            exponent
        };

        let backoff = self
            .base_delay
            .checked_mul(2u32.saturating_pow(exponent.min(31)))
            .unwrap_or(self.max_delay)
            .min(self.max_delay);

        let overall = match &self.bucket {
            Some(bucket) => match bucket.check() {
                Ok(()) => Duration::ZERO,
                Err(not_until) => not_until.wait_time_from(self.clock.now()),
            },
            None => Duration::ZERO,
        };

        backoff.max(overall)
    }

    /// Reset the failure count of `key`
    pub fn forget(&self, key: &str) {
        self.failures.lock().remove(key);
    }

    /// Failures recorded for `key` since it was last forgotten
    pub fn retries(&self, key: &str) -> u32 {
        self.failures.lock().get(key).copied().unwrap_or(0)
    }
}
