//! Requeue delays of failed reconciliations.

use std::{
    collections::HashMap,
    hash::Hash,
    sync::{Mutex, PoisonError},
    time::Duration,
};

use rand::Rng;

/// Exponential backoff: the base delay doubles with every consecutive failure up to
/// `max`, then up to a tenth of the delay is added as jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    base: Duration,
    max: Duration,
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
        }
    }

    /// Delay before retry number `failures` (1 = first failure), without jitter.
    pub fn delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);

        self.base
            .checked_mul(1 << exponent)
            .unwrap_or(self.max)
            .min(self.max)
    }

    pub fn delay_with_jitter(&self, failures: u32) -> Duration {
        let delay = self.delay(failures);
        let jitter_ms = (delay.as_millis() / 10) as u64;

        if jitter_ms == 0 {
            return delay;
        }

        delay + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

/// Consecutive failures per key, reset by the first successful pass.
#[derive(Debug)]
pub struct RetryTracker<K> {
    failures: Mutex<HashMap<K, u32>>,
}

impl<K> Default for RetryTracker<K> {
    fn default() -> Self {
        Self {
            failures: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone> RetryTracker<K> {
    pub fn failures(&self, key: &K) -> u32 {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .copied()
            .unwrap_or_default()
    }

    /// Returns the updated count.
    pub fn record_failure(&self, key: &K) -> u32 {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        let count = failures.entry(key.to_owned()).or_default();
        *count = count.saturating_add(1);

        *count
    }

    pub fn reset(&self, key: &K) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{BackoffPolicy, RetryTracker};

    #[test]
    fn delay_doubles_up_to_the_cap() {
        let policy = BackoffPolicy::new(Duration::from_millis(500), Duration::from_secs(3));

        assert_eq!(policy.delay(1), Duration::from_millis(500));
        assert_eq!(policy.delay(2), Duration::from_millis(1000));
        assert_eq!(policy.delay(3), Duration::from_millis(2000));
        assert_eq!(policy.delay(4), Duration::from_secs(3));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(3));
    }

    #[test]
    fn jitter_stays_within_a_tenth() {
        let policy = BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(60));

        for failures in 1..10 {
            let delay = policy.delay(failures);
            let jittered = policy.delay_with_jitter(failures);

            assert!(jittered >= delay);
            assert!(jittered <= delay + delay / 10);
        }
    }

    #[test]
    fn tracker_counts_until_reset() {
        let tracker = RetryTracker::default();

        assert_eq!(tracker.record_failure(&"edge"), 1);
        assert_eq!(tracker.record_failure(&"edge"), 2);
        assert_eq!(tracker.failures(&"core"), 0);

        tracker.reset(&"edge");

        assert_eq!(tracker.failures(&"edge"), 0);
    }
}
