//! Exponential backoff helper used between failover candidates.

use std::time::Duration;

use tracing::warn;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub retry_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_retries: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retry_delay_ms: 250,
            backoff_multiplier: 2.0,
            max_retries: 3,
        }
    }
}

impl RetryConfig {
    /// Delay before attempt number `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        let ms = (self.retry_delay_ms as f64 * factor) as u64;
        Duration::from_millis(ms)
    }
}

/// Sleep for the configured backoff before trying candidate `attempt`.
pub async fn backoff_sleep(cfg: &RetryConfig, attempt: u32) {
    let delay = cfg.delay_for_attempt(attempt);
    warn!(attempt, delay_ms = delay.as_millis() as u64, "backing off before retry");
    tokio::time::sleep(delay).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_exponentially() {
        let cfg = RetryConfig {
            retry_delay_ms: 100,
            backoff_multiplier: 2.0,
            max_retries: 5,
        };
        assert_eq!(cfg.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(cfg.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(cfg.delay_for_attempt(3), Duration::from_millis(400));
    }

    #[tokio::test]
    async fn backoff_sleep_respects_configured_delay() {
        let cfg = RetryConfig {
            retry_delay_ms: 5,
            backoff_multiplier: 1.0,
            max_retries: 1,
        };
        let start = tokio::time::Instant::now();
        backoff_sleep(&cfg, 1).await;
        assert!(start.elapsed() >= Duration::from_millis(5));
    }
}
