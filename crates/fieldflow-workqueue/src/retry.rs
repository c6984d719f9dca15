//! Retry policy: exponential backoff between failed attempts.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff applied to failed attempts.
///
/// The delay before the nth retry is
/// `base_delay * multiplier^(n-1)`, capped at `max_delay`. The
/// retry-or-dead-letter decision itself lives with the store's attempt
/// bookkeeping; this type only shapes the wait.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Growth factor per additional failed attempt.
    #[serde(default = "default_multiplier")]
    pub multiplier: u32,

    /// Ceiling on any single delay, in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_base_delay_ms() -> u64 {
    5_000
}

fn default_multiplier() -> u32 {
    2
}

fn default_max_delay_ms() -> u64 {
    300_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryPolicy {
    /// Delay before re-running a task that has failed `attempts` times
    /// (`attempts >= 1`).
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let exp = attempts.saturating_sub(1);
        let factor = u64::from(self.multiplier).checked_pow(exp).unwrap_or(u64::MAX);
        let ms = self
            .base_delay_ms
            .checked_mul(factor)
            .unwrap_or(u64::MAX)
            .min(self.max_delay_ms);
        Duration::from_millis(ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_retry_uses_base_delay() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_millis(5_000));
    }

    #[test]
    fn test_delay_grows_until_cap() {
        let policy = RetryPolicy {
            base_delay_ms: 100,
            multiplier: 2,
            max_delay_ms: 1_000,
        };

        let delays: Vec<Duration> = (1..=6).map(|n| policy.delay_for(n)).collect();
        assert_eq!(delays[0], Duration::from_millis(100));
        assert_eq!(delays[1], Duration::from_millis(200));
        assert_eq!(delays[2], Duration::from_millis(400));
        assert_eq!(delays[3], Duration::from_millis(800));
        assert_eq!(delays[4], Duration::from_millis(1_000));
        assert_eq!(delays[5], Duration::from_millis(1_000));

        for pair in delays.windows(2) {
            assert!(pair[1] >= pair[0]);
        }
    }

    #[test]
    fn test_huge_attempt_counts_do_not_overflow() {
        let policy = RetryPolicy {
            base_delay_ms: u64::MAX,
            multiplier: 10,
            max_delay_ms: 60_000,
        };
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_millis(60_000));
    }
}
