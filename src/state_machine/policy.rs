use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for transport-level retry of a queued stage item.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total deliveries allowed before the stage is failed with `TransportError`.
    pub max_attempts: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub base_delay_ms: u64,
    /// Upper bound for a single backoff delay.
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
        }
    }
}

impl RetryConfig {
    /// Calculate the delay before redelivering after the given failed attempt.
    /// delay = base_delay_ms * 2^(attempt - 1), capped at `max_delay_ms`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms))
    }

    /// Whether another delivery is allowed after `attempt` failed.
    pub fn allows_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Re-poll schedule for providers without a configured callback.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    pub interval_ms: u64,
    /// Multiplier applied per attempt. `1.0` gives a fixed interval.
    pub backoff_factor: f64,
    pub max_interval_ms: u64,
    /// Polls allowed before the job fails with `PollExhausted`.
    pub max_attempts: u32,
    /// Interval of the backstop polls for tasks that report through a webhook.
    pub webhook_fallback_ms: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_ms: 10_000,
            backoff_factor: 1.5,
            max_interval_ms: 60_000,
            max_attempts: 60,
            webhook_fallback_ms: 600_000,
        }
    }
}

impl PollConfig {
    /// Delay before poll number `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let scaled = self.interval_ms as f64 * self.backoff_factor.max(1.0).powi(exponent);
        Duration::from_millis(scaled.min(self.max_interval_ms as f64) as u64)
    }

    /// Delay before poll number `attempt`; webhook-backed tasks use the slow backstop interval.
    pub fn delay_for(&self, attempt: u32, webhook: bool) -> Duration {
        if webhook {
            Duration::from_millis(self.webhook_fallback_ms)
        } else {
            self.delay_for_attempt(attempt)
        }
    }

    pub fn is_exhausted(&self, attempt: u32) -> bool {
        attempt > self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_config_exponential_backoff() {
        let config = RetryConfig {
            max_attempts: 5,
            base_delay_ms: 1000,
            max_delay_ms: 5000,
        };
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(4000));
        assert_eq!(config.delay_for_attempt(4), Duration::from_millis(5000));
    }

    #[test]
    fn retry_bound_counts_total_attempts() {
        let config = RetryConfig::default();
        assert!(config.allows_retry(1));
        assert!(config.allows_retry(2));
        assert!(!config.allows_retry(3));
    }

    #[test]
    fn fixed_poll_interval() {
        let config = PollConfig {
            interval_ms: 500,
            backoff_factor: 1.0,
            max_interval_ms: 10_000,
            max_attempts: 3,
            webhook_fallback_ms: 60_000,
        };
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(config.delay_for_attempt(7), Duration::from_millis(500));
        assert!(!config.is_exhausted(3));
        assert!(config.is_exhausted(4));
    }

    #[test]
    fn poll_backoff_is_capped() {
        let config = PollConfig {
            interval_ms: 1000,
            backoff_factor: 2.0,
            max_interval_ms: 3000,
            max_attempts: 10,
            ..PollConfig::default()
        };
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(3000));
        assert_eq!(config.delay_for_attempt(30), Duration::from_millis(3000));
    }

    #[test]
    fn webhook_tasks_use_the_backstop_interval() {
        let config = PollConfig::default();
        assert_eq!(config.delay_for(1, true), Duration::from_secs(600));
        assert_eq!(config.delay_for(1, false), config.delay_for_attempt(1));
    }
}
