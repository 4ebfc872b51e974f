//! Retry budget and pluggable backoff between failed attempts.

use std::sync::Arc;
use std::time::Duration;

/// Delay before the next attempt, given the number of failed attempts so far.
pub trait Backoff: Send + Sync + std::fmt::Debug {
    /// `attempt` is 1-indexed: the delay after the first failure is `delay(1)`.
    fn delay(&self, attempt: u32) -> Duration;
}

/// Same delay after every failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedBackoff(pub Duration);

impl Backoff for FixedBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 { Duration::ZERO } else { self.0 }
    }
}

/// `base * 2^(attempt - 1)`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialBackoff {
    pub base: Duration,
    pub max: Duration,
}

impl Backoff for ExponentialBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(attempt - 1);
        self.base.saturating_mul(factor).min(self.max)
    }
}

/// `base * attempt`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinearBackoff {
    pub base: Duration,
    pub max: Duration,
}

impl Backoff for LinearBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        self.base.saturating_mul(attempt).min(self.max)
    }
}

/// Retry policy configuration.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Initial `retries_left` of every new job; always at least 1.
    pub max_retries: u32,
    pub backoff: Arc<dyn Backoff>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Arc::new(ExponentialBackoff {
                base: Duration::from_secs(10),
                max: Duration::from_secs(300),
            }),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: impl Backoff + 'static) -> Self {
        Self {
            max_retries: max_retries.max(1),
            backoff: Arc::new(backoff),
        }
    }

    /// Create a policy with fixed delays.
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self::new(max_retries, FixedBackoff(delay))
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(max_retries: u32, base: Duration, max: Duration) -> Self {
        Self::new(max_retries, ExponentialBackoff { base, max })
    }

    /// Retry immediately; mostly useful in tests.
    pub fn immediate(max_retries: u32) -> Self {
        Self::fixed(max_retries, Duration::ZERO)
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.backoff.delay(attempt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let policy = RetryPolicy::exponential(5, Duration::from_millis(100), Duration::from_secs(10));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(800));
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let backoff = ExponentialBackoff {
            base: Duration::from_secs(1),
            max: Duration::from_secs(5),
        };

        assert_eq!(backoff.delay(4), Duration::from_secs(5));
        assert_eq!(backoff.delay(64), Duration::from_secs(5));
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(500));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(500));
    }

    #[test]
    fn linear_backoff_increases_linearly() {
        let backoff = LinearBackoff {
            base: Duration::from_millis(100),
            max: Duration::from_secs(10),
        };

        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(300));
    }

    #[test]
    fn retry_budget_is_at_least_one() {
        assert_eq!(RetryPolicy::immediate(0).max_retries, 1);
    }
}
