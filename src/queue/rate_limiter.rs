//! Per-item exponential backoff

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;

/// Default delay after the first failure
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);

/// Default backoff ceiling
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);

/// Exponential backoff tracked per item: `base * 2^failures`, capped at `max`.
///
/// There is no retry limit; an item that keeps failing is retried at the
/// ceiling until it is forgotten.
#[derive(Debug)]
pub struct ItemExponentialRateLimiter {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<String, u32>>,
}

impl ItemExponentialRateLimiter {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Record a failure for `item` and return how long to wait before
    /// retrying it.
    pub fn when(&self, item: &str) -> Duration {
        let exp = {
            let mut failures = self.failures.lock();
            let count = failures.entry(item.to_string()).or_insert(0);
            let exp = *count;
            *count = count.saturating_add(1);
            exp
        };

        2u32.checked_pow(exp)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |delay| delay.min(self.max))
    }

    /// Number of failures recorded for `item` since it was last forgotten
    pub fn num_requeues(&self, item: &str) -> u32 {
        self.failures.lock().get(item).copied().unwrap_or(0)
    }

    /// Clear the failure history of `item`
    pub fn forget(&self, item: &str) {
        self.failures.lock().remove(item);
    }
}

impl Default for ItemExponentialRateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }
}
