//! Bounded retry for the push transaction.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Backoff strategy between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay before every retry.
    Fixed,
    /// base * retry number
    #[default]
    Linear,
    /// base * 2^(retry number - 1)
    Exponential,
}

/// How often, and how patiently, a conflicting push is retried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt (0 = try once).
    pub max_retries: u32,
    pub base_delay: Duration,
    /// Cap for any single delay.
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::linear(10, Duration::from_millis(5))
    }
}

impl RetryPolicy {
    /// Try once, never retry.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    pub fn linear(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay: Duration::from_secs(1),
            strategy: BackoffStrategy::Linear,
        }
    }

    pub fn exponential(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
        }
    }

    /// Delay before retry number `retry` (1-indexed; 0 means the first attempt).
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }

        let delay = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Linear => self.base_delay.saturating_mul(retry),
            BackoffStrategy::Exponential => {
                let factor = 2u32.saturating_pow(retry - 1);
                self.base_delay.saturating_mul(factor)
            }
        };
        delay.min(self.max_delay)
    }

    /// Whether another attempt is allowed after `retries_done` retries.
    pub fn should_retry(&self, retries_done: u32) -> bool {
        retries_done < self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn default_allows_ten_retries_with_linear_backoff() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(9));
        assert!(!policy.should_retry(10));
        assert_eq!(policy.delay_for_retry(0), Duration::ZERO);
        assert_eq!(policy.delay_for_retry(1), Duration::from_millis(5));
        assert_eq!(policy.delay_for_retry(3), Duration::from_millis(15));
    }

    #[test]
    fn delays_are_capped() {
        let policy = RetryPolicy::exponential(20, Duration::from_millis(10), Duration::from_millis(100));
        assert_eq!(policy.delay_for_retry(2), Duration::from_millis(20));
        assert_eq!(policy.delay_for_retry(10), Duration::from_millis(100));
        assert_eq!(policy.delay_for_retry(40), Duration::from_millis(100));
    }

    #[test]
    fn no_retry_tries_once() {
        assert!(!RetryPolicy::no_retry().should_retry(0));
        assert_eq!(
            RetryPolicy::fixed(3, Duration::from_millis(7)).delay_for_retry(3),
            Duration::from_millis(7)
        );
    }

    proptest! {
        #[test]
        fn delays_never_shrink_and_never_exceed_cap(
            base_ms in 1u64..500,
            cap_ms in 1u64..5_000,
            retry in 1u32..64,
        ) {
            let cap = Duration::from_millis(cap_ms);
            for policy in [
                RetryPolicy::fixed(64, Duration::from_millis(base_ms)),
                RetryPolicy::exponential(64, Duration::from_millis(base_ms), cap),
                RetryPolicy { max_delay: cap, ..RetryPolicy::linear(64, Duration::from_millis(base_ms)) },
            ] {
                let delay = policy.delay_for_retry(retry);
                prop_assert!(delay <= policy.max_delay);
                prop_assert!(delay >= policy.delay_for_retry(retry - 1));
            }
        }
    }
}
