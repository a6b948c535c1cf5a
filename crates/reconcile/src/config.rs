//! Configuration for retry loops and reconciliation runs.

use std::time::Duration;

/// Backoff and deadline settings shared by every retry loop.
///
/// Built once at startup and passed by reference into the core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Wall-clock budget for one retry loop, measured from its first attempt
    pub deadline: Duration,
    /// Delay before the first retry; doubles after every retryable failure
    pub base_delay: Duration,
    /// Upper bound of the uniform random jitter added to every sleep
    pub max_jitter: Duration,
    /// Optional cap on the pre-jitter delay; `None` leaves growth uncapped
    pub max_delay: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(5 * 60),
            base_delay: Duration::from_secs(1),
            max_jitter: Duration::from_millis(1000),
            max_delay: None,
        }
    }
}

impl RetryConfig {
    /// Default settings with a deadline of `minutes`.
    pub fn from_timeout_minutes(minutes: u64) -> Self {
        Self {
            deadline: Duration::from_secs(minutes.saturating_mul(60)),
            ..Self::default()
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn with_max_jitter(mut self, max_jitter: Duration) -> Self {
        self.max_jitter = max_jitter;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    /// Calculate the pre-jitter delay for a given retry (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = 2u32
            .checked_pow(attempt)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .unwrap_or(Duration::MAX);
        match self.max_delay {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }
}

/// Options for a reconciliation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileOptions {
    /// Compute and report, but issue no writes
    pub dry_run: bool,
    /// Poll newly created or deleted top-level entities until the change is visible
    pub confirm_visibility: bool,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            confirm_visibility: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_uncapped_by_default() {
        let config = RetryConfig::default();
        assert_eq!(config.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(5), Duration::from_secs(32));
        assert_eq!(config.delay_for_attempt(12), Duration::from_secs(4096));
    }

    #[test]
    fn test_delay_respects_cap() {
        let config = RetryConfig::default().with_max_delay(Duration::from_secs(10));
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(8));
        assert_eq!(config.delay_for_attempt(4), Duration::from_secs(10));
    }

    #[test]
    fn test_delay_saturates_instead_of_overflowing() {
        let config = RetryConfig::default();
        assert_eq!(config.delay_for_attempt(200), Duration::MAX);
    }

    #[test]
    fn test_from_timeout_minutes() {
        let config = RetryConfig::from_timeout_minutes(2);
        assert_eq!(config.deadline, Duration::from_secs(120));
        assert_eq!(config.base_delay, Duration::from_secs(1));
    }
}
