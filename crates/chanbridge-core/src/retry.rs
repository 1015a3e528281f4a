//! Retry policy with exponential backoff
//!
//! Decides how many delivery attempts a message gets, how long to wait
//! between them and which HTTP statuses count as transient.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for retry behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the second attempt
    #[serde(default = "default_initial_delay", rename = "initial_delay_ms", with = "millis")]
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    #[serde(default = "default_max_delay", rename = "max_delay_ms", with = "millis")]
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Add random jitter to delays
    #[serde(default = "default_true")]
    pub jitter: bool,
    /// 4xx statuses that are retried instead of treated as permanent
    #[serde(default)]
    pub retryable_statuses: Vec<u16>,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_millis(100)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(10)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
            retryable_statuses: Vec::new(),
        }
    }
}

impl RetryConfig {
    /// Create a new retry configuration
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A single attempt, never retried
    #[must_use]
    pub fn single_attempt() -> Self {
        Self::default().with_max_attempts(1)
    }

    /// Set maximum attempts
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Set initial delay
    #[must_use]
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set maximum delay
    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set backoff multiplier
    #[must_use]
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enable or disable jitter
    #[must_use]
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Add 4xx statuses that should be retried
    #[must_use]
    pub fn with_retryable_statuses(mut self, statuses: impl IntoIterator<Item = u16>) -> Self {
        self.retryable_statuses.extend(statuses);
        self
    }

    /// Attempts allowed, never less than one
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    #[must_use]
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let base_delay = self.initial_delay.as_millis() as f64
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);

        let delay_ms = base_delay.min(self.max_delay.as_millis() as f64) as u64;

        let final_delay = if self.jitter {
            // Up to 25% jitter
            let jitter_range = delay_ms / 4;
            if jitter_range == 0 {
                delay_ms
            } else {
                delay_ms + rand::thread_rng().gen_range(0..jitter_range)
            }
        } else {
            delay_ms
        };

        Duration::from_millis(final_delay)
    }

    /// Whether an HTTP status is worth another attempt.
    ///
    /// 5xx, 408 and 429 are transient; other 4xx are permanent unless listed
    /// in `retryable_statuses`.
    #[must_use]
    pub fn is_retryable_status(&self, status: u16) -> bool {
        match status {
            500..=599 | 408 | 429 => true,
            400..=499 => self.retryable_statuses.contains(&status),
            _ => false,
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_config_defaults() {
        let config = RetryConfig::default();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.initial_delay, Duration::from_millis(100));
        assert_eq!(config.backoff_multiplier, 2.0);
        assert!(config.retryable_statuses.is_empty());
    }

    #[test]
    fn test_retry_config_builder() {
        let config = RetryConfig::new()
            .with_max_attempts(5)
            .with_initial_delay(Duration::from_millis(200))
            .with_max_delay(Duration::from_secs(30))
            .with_backoff_multiplier(3.0)
            .with_jitter(false)
            .with_retryable_statuses([404]);

        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.initial_delay, Duration::from_millis(200));
        assert_eq!(config.max_delay, Duration::from_secs(30));
        assert_eq!(config.backoff_multiplier, 3.0);
        assert!(!config.jitter);
        assert_eq!(config.retryable_statuses, vec![404]);
    }

    #[test]
    fn test_zero_attempts_means_one() {
        assert_eq!(RetryConfig::new().with_max_attempts(0).attempts(), 1);
    }

    #[test]
    fn test_delay_after() {
        let config = RetryConfig::new()
            .with_initial_delay(Duration::from_millis(100))
            .with_backoff_multiplier(2.0)
            .with_jitter(false);

        assert_eq!(config.delay_after(1), Duration::from_millis(100));
        assert_eq!(config.delay_after(2), Duration::from_millis(200));
        assert_eq!(config.delay_after(3), Duration::from_millis(400));
    }

    #[test]
    fn test_delay_respects_max() {
        let config = RetryConfig::new()
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(5))
            .with_backoff_multiplier(10.0)
            .with_jitter(false);

        assert_eq!(config.delay_after(3), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_stays_within_quarter() {
        let config = RetryConfig::new()
            .with_initial_delay(Duration::from_millis(400))
            .with_jitter(true);

        for _ in 0..50 {
            let delay = config.delay_after(1);
            assert!(delay >= Duration::from_millis(400));
            assert!(delay < Duration::from_millis(500));
        }
    }

    #[test]
    fn test_status_classification() {
        let config = RetryConfig::new().with_retryable_statuses([404]);

        assert!(config.is_retryable_status(500));
        assert!(config.is_retryable_status(503));
        assert!(config.is_retryable_status(408));
        assert!(config.is_retryable_status(429));
        assert!(config.is_retryable_status(404));
        assert!(!config.is_retryable_status(400));
        assert!(!config.is_retryable_status(403));
        assert!(!config.is_retryable_status(200));
    }

    #[test]
    fn test_deserialize_millis() {
        let config: RetryConfig =
            serde_json::from_str(r#"{"max_attempts": 4, "initial_delay_ms": 5}"#).unwrap();
        assert_eq!(config.max_attempts, 4);
        assert_eq!(config.initial_delay, Duration::from_millis(5));
        assert_eq!(config.max_delay, Duration::from_secs(10));
        assert!(config.jitter);
    }
}
