//! Retry decisions and backoff intervals for REST attempts.

use std::collections::BTreeSet;
use std::time::Duration;

use rand::Rng;

use crate::error::{Error, Result};

/// How the wait between attempts grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStrategy {
    /// `min_backoff + attempt * delta`
    Linear,
    /// `min_backoff + (2^attempt - 1) * delta * jitter`
    Exponential,
}

/// Retry policy shared read-only by every operation of a client.
///
/// `max_attempts` counts physical attempts, the first one included. A
/// connection-level failure (no status) is always retryable; an HTTP status
/// is retryable only when it is in `retryable_statuses`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    min_backoff: Duration,
    max_backoff: Duration,
    delta_backoff: Duration,
    strategy: BackoffStrategy,
    jitter: bool,
    retryable_statuses: BTreeSet<u16>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 30,
            min_backoff: Duration::from_secs(3),
            max_backoff: Duration::from_secs(30),
            delta_backoff: Duration::from_secs(3),
            strategy: BackoffStrategy::Exponential,
            jitter: true,
            retryable_statuses: [408, 429, 500, 502, 503, 504].into_iter().collect(),
        }
    }
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Policy that never retries.
    pub fn no_retry() -> Self {
        Self::default().with_max_attempts(1)
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_min_backoff(mut self, min_backoff: Duration) -> Self {
        self.min_backoff = min_backoff;
        self
    }

    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff;
        self
    }

    pub fn with_delta_backoff(mut self, delta_backoff: Duration) -> Self {
        self.delta_backoff = delta_backoff;
        self
    }

    pub fn with_strategy(mut self, strategy: BackoffStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Replace the set of HTTP statuses that are retried.
    pub fn with_retryable_statuses(mut self, statuses: impl IntoIterator<Item = u16>) -> Self {
        self.retryable_statuses = statuses.into_iter().collect();
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn strategy(&self) -> BackoffStrategy {
        self.strategy
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::Config("max_attempts must be at least 1".into()));
        }
        if self.min_backoff > self.max_backoff {
            return Err(Error::Config(format!(
                "min_backoff {:?} exceeds max_backoff {:?}",
                self.min_backoff, self.max_backoff
            )));
        }
        Ok(())
    }

    pub fn is_retryable_status(&self, status: u16) -> bool {
        self.retryable_statuses.contains(&status)
    }

    /// Decide whether another attempt follows attempt number `attempt`
    /// (1-based) which ended with `status`, or with no response at all.
    pub fn should_retry(&self, attempt: u32, status: Option<u16>) -> bool {
        if attempt >= self.max_attempts {
            return false;
        }
        match status {
            None => true,
            Some(s) => self.is_retryable_status(s),
        }
    }

    /// Wait before the attempt that follows attempt number `attempt`.
    pub fn retry_interval(&self, attempt: u32) -> Duration {
        let delta_ms = self.delta_backoff.as_millis() as f64;
        let increment_ms = match self.strategy {
            BackoffStrategy::Linear => delta_ms * attempt as f64,
            BackoffStrategy::Exponential => {
                let factor = 2f64.powi(attempt.min(32) as i32) - 1.0;
                let scale = if self.jitter {
                    rand::thread_rng().gen_range(0.8..=1.2)
                } else {
                    1.0
                };
                factor * delta_ms * scale
            }
        };

        let total_ms = self.min_backoff.as_millis() as f64 + increment_ms;
        let capped_ms = total_ms.min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(capped_ms.max(0.0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::new()
            .with_max_attempts(3)
            .with_min_backoff(Duration::from_millis(10))
            .with_delta_backoff(Duration::from_millis(10))
            .with_max_backoff(Duration::from_millis(100))
            .with_jitter(false)
    }

    #[test]
    fn test_network_failure_retried_until_max_attempts() {
        let policy = fast_policy();
        assert!(policy.should_retry(1, None));
        assert!(policy.should_retry(2, None));
        assert!(!policy.should_retry(3, None));
    }

    #[test]
    fn test_status_classification() {
        let policy = fast_policy();
        assert!(policy.should_retry(1, Some(503)));
        assert!(policy.should_retry(1, Some(429)));
        assert!(policy.should_retry(1, Some(500)));
        assert!(!policy.should_retry(1, Some(404)));
        assert!(!policy.should_retry(1, Some(403)));
        assert!(!policy.should_retry(1, Some(501)));
        assert!(!policy.should_retry(1, Some(206)));
    }

    #[test]
    fn test_custom_retryable_statuses() {
        let policy = fast_policy().with_retryable_statuses([409]);
        assert!(policy.should_retry(1, Some(409)));
        assert!(!policy.should_retry(1, Some(503)));
    }

    #[test]
    fn test_exponential_interval_grows_and_caps() {
        let policy = fast_policy();
        assert_eq!(policy.retry_interval(1), Duration::from_millis(20));
        assert_eq!(policy.retry_interval(2), Duration::from_millis(40));
        assert_eq!(policy.retry_interval(3), Duration::from_millis(80));
        assert_eq!(policy.retry_interval(4), Duration::from_millis(100));
        assert_eq!(policy.retry_interval(40), Duration::from_millis(100));
    }

    #[test]
    fn test_linear_interval() {
        let policy = fast_policy().with_strategy(BackoffStrategy::Linear);
        assert_eq!(policy.retry_interval(1), Duration::from_millis(20));
        assert_eq!(policy.retry_interval(2), Duration::from_millis(30));
        assert_eq!(policy.retry_interval(9), Duration::from_millis(100));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let policy = fast_policy().with_jitter(true);
        for _ in 0..50 {
            let ms = policy.retry_interval(2).as_millis() as u64;
            // 10 + 3 * 10 * [0.8, 1.2]
            assert!((33..=46).contains(&ms), "interval {ms} out of band");
        }
    }

    #[test]
    fn test_validate() {
        assert!(RetryPolicy::default().validate().is_ok());
        assert!(RetryPolicy::default().with_max_attempts(0).validate().is_err());
        assert!(
            fast_policy()
                .with_min_backoff(Duration::from_secs(5))
                .validate()
                .is_err()
        );
    }
}
