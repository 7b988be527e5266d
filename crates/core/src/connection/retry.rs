use std::time::Duration;

use crate::config::RetryConfig;

/// Fixed-interval connect retry.
///
/// Every failed attempt waits the same interval before the next one. With no
/// attempt bound the loop only ends on success or cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    interval: Duration,
    max_attempts: Option<u32>,
}

impl RetryPolicy {
    pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(200);

    pub fn new(interval: Duration, max_attempts: Option<u32>) -> Self {
        Self {
            interval,
            max_attempts,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }

    /// Whether another attempt may follow attempt number `attempt` (1-based).
    pub fn allows_retry_after(&self, attempt: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempt < max)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Self::DEFAULT_INTERVAL, None)
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self::new(config.interval(), config.max_attempts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retries_forever_by_default() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.interval(), Duration::from_millis(200));
        assert!(policy.allows_retry_after(1));
        assert!(policy.allows_retry_after(u32::MAX - 1));
    }

    #[test]
    fn honours_attempt_bound() {
        let policy = RetryPolicy::new(Duration::from_millis(10), Some(3));
        assert!(policy.allows_retry_after(2));
        assert!(!policy.allows_retry_after(3));
    }

    #[test]
    fn builds_from_config() {
        let config = RetryConfig {
            interval_ms: 75,
            max_attempts: Some(4),
        };
        let policy = RetryPolicy::from(&config);
        assert_eq!(policy.interval(), Duration::from_millis(75));
        assert_eq!(policy.max_attempts(), Some(4));
    }
}
