//! Exponential backoff with jitter for version-conflict retries

use crate::config::RetryConfig;
use std::time::Duration;

/// Bounded retry schedule
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    /// Create from configuration
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Total attempts including the first
    pub fn max_attempts(&self) -> u32 {
        self.config.max_retries + 1
    }

    /// Whether another attempt is allowed after `attempt` (0-based) failed
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.config.max_retries
    }

    /// Delay before retry number `retry` (0-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let base_delay = self.config.initial_delay_ms as f64
            * self.config.backoff_multiplier.powi(retry as i32);

        let capped_delay = base_delay.min(self.config.max_delay_ms as f64);

        // Spread contenders on a hot account
        let jitter_range = capped_delay * self.config.jitter_factor;
        let jitter = (rand::random::<f64>() - 0.5) * jitter_range * 2.0;
        let final_delay = (capped_delay + jitter).max(0.0);

        Duration::from_micros((final_delay * 1000.0) as u64)
    }

    /// Sleep before retry number `retry`
    pub async fn backoff(&self, retry: u32) {
        let delay = self.delay_for(retry);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter(max_retries: u32, initial: u64, max: u64) -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            max_retries,
            initial_delay_ms: initial,
            max_delay_ms: max,
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
        })
    }

    #[test]
    fn test_exponential_backoff() {
        let policy = no_jitter(3, 10, 1_000);

        assert_eq!(policy.delay_for(0).as_millis(), 10);
        assert_eq!(policy.delay_for(1).as_millis(), 20);
        assert_eq!(policy.delay_for(2).as_millis(), 40);
    }

    #[test]
    fn test_max_delay_cap() {
        let policy = no_jitter(10, 10, 50);
        assert_eq!(policy.delay_for(10).as_millis(), 50);
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = RetryPolicy::new(RetryConfig {
            max_retries: 3,
            initial_delay_ms: 100,
            max_delay_ms: 100,
            backoff_multiplier: 2.0,
            jitter_factor: 0.5,
        });

        for _ in 0..100 {
            let delay = policy.delay_for(0).as_millis();
            assert!((50..=150).contains(&delay), "delay {} out of range", delay);
        }
    }

    #[test]
    fn test_attempt_bound() {
        let policy = no_jitter(2, 1, 1);
        assert_eq!(policy.max_attempts(), 3);
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(1));
        assert!(!policy.should_retry(2));
    }
}
