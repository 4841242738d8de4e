//! Configuration for the read-ahead cache and the REST client.

use reqwest::Url;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::rest::{AuthType, RetryPolicy};

/// Default bytes per read-ahead window (4 MiB)
pub const DEFAULT_READ_BUFFER_SIZE: usize = 4 * 1024 * 1024;
/// Default number of pooled buffers
pub const DEFAULT_BUFFER_POOL_SIZE: usize = 16;
/// Default number of read-ahead workers
pub const DEFAULT_WORKER_POOL_SIZE: usize = 8;
/// Default age after which a completed buffer may be evicted
pub const DEFAULT_BUFFER_AGE_THRESHOLD: Duration = Duration::from_millis(3000);
/// Default bound on waiting for an in-flight buffer
pub const DEFAULT_BLOCK_WAIT_TIMEOUT: Duration = Duration::from_secs(30);
/// Default random-read queue depth
pub const DEFAULT_RANDOM_READ_QUEUE_DEPTH: usize = 2;

fn default_queue_depth() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2)
}

/// Read-side tuning shared by the buffer pool, the workers and every
/// stream opened on the same context.
#[derive(Debug, Clone)]
pub struct ReadAheadConfig {
    /// Bytes per read-ahead window; also the capacity of each pooled buffer
    pub read_buffer_size: usize,
    /// Maximum windows queued ahead of a sequential reader
    pub read_ahead_queue_depth: usize,
    /// Maximum windows queued ahead of a random reader
    pub read_ahead_queue_depth_for_random_read: usize,
    /// Snap small reads up to full, aligned windows
    pub always_read_buffer_size: bool,
    /// Queue read-ahead for non-sequential reads at all
    pub enable_read_ahead_for_random_read: bool,
    /// Number of pooled buffers
    pub buffer_pool_size: usize,
    /// Number of worker tasks filling buffers
    pub worker_pool_size: usize,
    /// Completed buffers become evictable, and failures stale, past this age
    pub buffer_age_threshold: Duration,
    /// Longest a reader waits for a queued or in-flight buffer
    pub block_wait_timeout: Duration,
    /// Skip `If-Match` so reads tolerate concurrent appends
    pub tolerate_oob_appends: bool,
}

impl Default for ReadAheadConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            read_ahead_queue_depth: default_queue_depth(),
            read_ahead_queue_depth_for_random_read: DEFAULT_RANDOM_READ_QUEUE_DEPTH,
            always_read_buffer_size: false,
            enable_read_ahead_for_random_read: false,
            buffer_pool_size: DEFAULT_BUFFER_POOL_SIZE,
            worker_pool_size: DEFAULT_WORKER_POOL_SIZE,
            buffer_age_threshold: DEFAULT_BUFFER_AGE_THRESHOLD,
            block_wait_timeout: DEFAULT_BLOCK_WAIT_TIMEOUT,
            tolerate_oob_appends: false,
        }
    }
}

impl ReadAheadConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    pub fn with_read_ahead_queue_depth(mut self, depth: usize) -> Self {
        self.read_ahead_queue_depth = depth;
        self
    }

    pub fn with_read_ahead_queue_depth_for_random_read(mut self, depth: usize) -> Self {
        self.read_ahead_queue_depth_for_random_read = depth;
        self
    }

    pub fn with_always_read_buffer_size(mut self, enabled: bool) -> Self {
        self.always_read_buffer_size = enabled;
        self
    }

    pub fn with_read_ahead_for_random_read(mut self, enabled: bool) -> Self {
        self.enable_read_ahead_for_random_read = enabled;
        self
    }

    pub fn with_buffer_pool_size(mut self, count: usize) -> Self {
        self.buffer_pool_size = count;
        self
    }

    pub fn with_worker_pool_size(mut self, count: usize) -> Self {
        self.worker_pool_size = count;
        self
    }

    pub fn with_buffer_age_threshold(mut self, age: Duration) -> Self {
        self.buffer_age_threshold = age;
        self
    }

    pub fn with_block_wait_timeout(mut self, timeout: Duration) -> Self {
        self.block_wait_timeout = timeout;
        self
    }

    pub fn with_tolerate_oob_appends(mut self, enabled: bool) -> Self {
        self.tolerate_oob_appends = enabled;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.read_buffer_size == 0 {
            return Err(Error::Config("read_buffer_size must be positive".into()));
        }
        if self.buffer_pool_size == 0 {
            return Err(Error::Config("buffer_pool_size must be positive".into()));
        }
        if self.worker_pool_size == 0 {
            return Err(Error::Config("worker_pool_size must be positive".into()));
        }
        Ok(())
    }
}

/// Everything needed to reach one account.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Root URL; object paths are appended to it
    pub base_url: Url,
    pub auth: AuthType,
    pub retry_policy: RetryPolicy,
    /// Per-attempt HTTP timeout
    pub request_timeout: Duration,
}

impl ClientConfig {
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            auth: AuthType::Anonymous,
            retry_policy: RetryPolicy::default(),
            request_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_auth(mut self, auth: AuthType) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !matches!(self.base_url.scheme(), "http" | "https") {
            return Err(Error::Config(format!(
                "unsupported URL scheme: {}",
                self.base_url.scheme()
            )));
        }
        if self.request_timeout.is_zero() {
            return Err(Error::Config("request_timeout must be positive".into()));
        }
        self.retry_policy.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_ahead_defaults() {
        let config = ReadAheadConfig::default();
        assert_eq!(config.read_buffer_size, DEFAULT_READ_BUFFER_SIZE);
        assert_eq!(config.buffer_pool_size, 16);
        assert_eq!(config.worker_pool_size, 8);
        assert_eq!(config.buffer_age_threshold, Duration::from_millis(3000));
        assert!(config.read_ahead_queue_depth >= 1);
        assert!(!config.always_read_buffer_size);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_read_ahead_builder() {
        let config = ReadAheadConfig::new()
            .with_read_buffer_size(1024)
            .with_read_ahead_queue_depth(10)
            .with_read_ahead_queue_depth_for_random_read(4)
            .with_always_read_buffer_size(true)
            .with_read_ahead_for_random_read(true)
            .with_buffer_pool_size(4);

        assert_eq!(config.read_buffer_size, 1024);
        assert_eq!(config.read_ahead_queue_depth, 10);
        assert_eq!(config.read_ahead_queue_depth_for_random_read, 4);
        assert!(config.always_read_buffer_size);
        assert!(config.enable_read_ahead_for_random_read);
        assert_eq!(config.buffer_pool_size, 4);
    }

    #[test]
    fn test_read_ahead_validation() {
        assert!(ReadAheadConfig::new().with_read_buffer_size(0).validate().is_err());
        assert!(ReadAheadConfig::new().with_buffer_pool_size(0).validate().is_err());
        assert!(ReadAheadConfig::new().with_worker_pool_size(0).validate().is_err());
    }

    #[test]
    fn test_client_config_validation() {
        let url = Url::parse("https://acct.example.net/fs").unwrap();
        assert!(ClientConfig::new(url).validate().is_ok());

        let ftp = Url::parse("ftp://acct.example.net/fs").unwrap();
        assert!(ClientConfig::new(ftp).validate().is_err());
    }
}
