// Rate-limit retry policy for scheduler service calls
// Fixed delay, small bounded retry budget

use std::time::Duration;

/// Default number of retries after a rate-limited response
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default wait between rate-limited attempts
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(5);

/// Retry strategy trait for calculating retry delays
pub trait RetryStrategy: Send + Sync {
    /// Calculate the delay before retry number `attempt` (zero-based).
    /// Returns None if the retry budget is exhausted.
    fn next_delay(&self, attempt: u32) -> Option<Duration>;

    /// Get the maximum number of retries
    fn max_retries(&self) -> u32;

    /// Check if more retries are allowed
    fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries()
    }
}

/// Fixed delay retry strategy.
///
/// Callers already pace their own operations, so a constant wait with a
/// small cap is enough to ride out throttling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedDelay {
    delay: Duration,
    max_retries: u32,
}

impl Default for FixedDelay {
    fn default() -> Self {
        Self {
            delay: DEFAULT_BACKOFF,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl FixedDelay {
    pub fn new(delay: Duration, max_retries: u32) -> Self {
        Self { delay, max_retries }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }
}

impl RetryStrategy for FixedDelay {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if !self.should_retry(attempt) {
            return None;
        }
        Some(self.delay)
    }

    fn max_retries(&self) -> u32 {
        self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let strategy = FixedDelay::default();
        assert_eq!(strategy.delay(), Duration::from_secs(5));
        assert_eq!(strategy.max_retries(), 3);
    }

    #[test]
    fn test_fixed_delay_strategy() {
        let delay = Duration::from_secs(10);
        let strategy = FixedDelay::new(delay, 3);

        // Should return the same delay for all attempts within budget
        for attempt in 0..3 {
            assert_eq!(strategy.next_delay(attempt), Some(delay));
        }

        // Should return None once the budget is spent
        assert_eq!(strategy.next_delay(3), None);
        assert_eq!(strategy.next_delay(4), None);
    }

    #[test]
    fn test_zero_budget_never_retries() {
        let strategy = FixedDelay::new(Duration::from_millis(1), 0);
        assert!(!strategy.should_retry(0));
        assert_eq!(strategy.next_delay(0), None);
    }
}
