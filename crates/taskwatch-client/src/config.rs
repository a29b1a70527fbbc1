//! Retry and backoff configuration.

use std::time::Duration;

/// Retry configuration for failed reputation requests
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum retries after a network error or timeout
    pub max_retries: u32,

    /// Maximum retries after the provider throttles us
    pub max_throttle_retries: u32,

    /// Initial backoff duration
    pub initial_backoff: Duration,

    /// Maximum backoff duration
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryConfig {
    /// Create a new retry configuration
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_retries: 3,
            max_throttle_retries: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(60),
        }
    }

    /// Set maximum network retries
    #[must_use]
    pub const fn max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }

    /// Set maximum throttle retries
    #[must_use]
    pub const fn max_throttle_retries(mut self, max: u32) -> Self {
        self.max_throttle_retries = max;
        self
    }

    /// Set initial backoff duration
    #[must_use]
    pub const fn initial_backoff(mut self, duration: Duration) -> Self {
        self.initial_backoff = duration;
        self
    }

    /// Set maximum backoff duration
    #[must_use]
    pub const fn max_backoff(mut self, duration: Duration) -> Self {
        self.max_backoff = duration;
        self
    }

    /// Calculate backoff for a given attempt (0-based)
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let initial = self.initial_backoff.as_millis() as u64;
        let backoff = initial.saturating_mul(2u64.saturating_pow(attempt));
        let max = self.max_backoff.as_millis() as u64;
        Duration::from_millis(backoff.min(max))
    }
}
