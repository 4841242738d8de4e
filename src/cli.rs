use clap::{ArgGroup, Parser};
use reqwest::Url;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{ClientConfig, ReadAheadConfig};
use crate::error::Result;
use crate::rest::{AuthType, RetryPolicy, SharedKeyCredentials, StaticTokenProvider};

#[derive(Parser, Debug)]
#[command(name = "rangefetch")]
#[command(version)]
#[command(about = "Stream a remote object through a read-ahead cache", long_about = None)]
#[command(after_help = "Examples:\n  \
  rangefetch https://acct.example.net/fs/data.bin > data.bin\n  \
  rangefetch --offset 1048576 --length 4096 https://acct.example.net/fs/data.bin | xxd\n  \
  rangefetch --sas-token 'sv=2020-02-10&sig=...' https://acct.example.net/fs/data.bin")]
#[command(group(ArgGroup::new("credentials").args(["bearer_token", "sas_token", "shared_key"])))]
pub struct Cli {
    /// Object URL
    #[arg(value_name = "URL")]
    pub url: String,

    /// First byte to read
    #[arg(long, default_value_t = 0)]
    pub offset: u64,

    /// Bytes to read (default: to the end)
    #[arg(long)]
    pub length: Option<u64>,

    /// OAuth bearer token
    #[arg(long, env = "RANGEFETCH_BEARER_TOKEN", hide_env_values = true)]
    pub bearer_token: Option<String>,

    /// SAS token appended to every request
    #[arg(long, env = "RANGEFETCH_SAS_TOKEN", hide_env_values = true)]
    pub sas_token: Option<String>,

    /// Base64 shared account key
    #[arg(long, env = "RANGEFETCH_SHARED_KEY", hide_env_values = true, requires = "account")]
    pub shared_key: Option<String>,

    /// Account name for shared key signing
    #[arg(long, env = "RANGEFETCH_ACCOUNT")]
    pub account: Option<String>,

    /// Read-ahead buffer size in bytes
    #[arg(long, env = "RANGEFETCH_BUFFER_SIZE", default_value_t = crate::config::DEFAULT_READ_BUFFER_SIZE)]
    pub buffer_size: usize,

    /// Windows queued ahead of a sequential reader
    #[arg(long, env = "RANGEFETCH_QUEUE_DEPTH")]
    pub queue_depth: Option<usize>,

    /// Number of pooled buffers
    #[arg(long, env = "RANGEFETCH_BUFFERS", default_value_t = crate::config::DEFAULT_BUFFER_POOL_SIZE)]
    pub buffers: usize,

    /// Number of read-ahead workers
    #[arg(long, env = "RANGEFETCH_WORKERS", default_value_t = crate::config::DEFAULT_WORKER_POOL_SIZE)]
    pub workers: usize,

    /// Attempts per REST operation, including the first
    #[arg(long, env = "RANGEFETCH_MAX_ATTEMPTS", default_value_t = 30)]
    pub max_attempts: u32,

    /// Per-request timeout in seconds
    #[arg(long, env = "RANGEFETCH_TIMEOUT", default_value_t = 30)]
    pub timeout: u64,

    /// Do not pin reads to the object's ETag
    #[arg(long)]
    pub tolerate_appends: bool,

    /// Increase log verbosity (-v, -vv)
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Quiet mode, no summary
    #[arg(short = 'q')]
    pub quiet: bool,
}

impl Cli {
    pub fn is_quiet(&self) -> bool {
        self.quiet
    }

    /// Default log filter when `RUST_LOG` is unset.
    pub fn log_filter(&self) -> &'static str {
        match (self.quiet, self.verbose) {
            (true, _) => "error",
            (false, 0) => "warn",
            (false, 1) => "rangefetch=debug",
            (false, _) => "rangefetch=trace",
        }
    }

    fn auth(&self) -> Result<AuthType> {
        if let Some(token) = &self.bearer_token {
            return Ok(AuthType::Bearer(Arc::new(StaticTokenProvider::new(token.clone()))));
        }
        if let Some(token) = &self.sas_token {
            return Ok(AuthType::Sas(token.trim_start_matches('?').to_string()));
        }
        if let (Some(key), Some(account)) = (&self.shared_key, &self.account) {
            return Ok(AuthType::SharedKey(SharedKeyCredentials::new(account.clone(), key)?));
        }
        Ok(AuthType::Anonymous)
    }

    /// Client settings for the object's URL.
    pub fn client_config(&self, url: Url) -> Result<ClientConfig> {
        let config = ClientConfig::new(url)
            .with_auth(self.auth()?)
            .with_retry_policy(RetryPolicy::new().with_max_attempts(self.max_attempts))
            .with_request_timeout(Duration::from_secs(self.timeout));
        config.validate()?;
        Ok(config)
    }

    pub fn read_ahead_config(&self) -> ReadAheadConfig {
        let mut config = ReadAheadConfig::new()
            .with_read_buffer_size(self.buffer_size)
            .with_buffer_pool_size(self.buffers)
            .with_worker_pool_size(self.workers)
            .with_tolerate_oob_appends(self.tolerate_appends);
        if let Some(depth) = self.queue_depth {
            config = config.with_read_ahead_queue_depth(depth);
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("rangefetch").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_defaults() {
        let cli = parse(&["https://acct.example.net/fs/a.bin"]);
        assert_eq!(cli.offset, 0);
        assert!(cli.length.is_none());
        assert_eq!(cli.log_filter(), "warn");

        let config = cli.read_ahead_config();
        assert_eq!(config.buffer_pool_size, crate::config::DEFAULT_BUFFER_POOL_SIZE);
        assert!(!config.tolerate_oob_appends);
    }

    #[test]
    fn test_tuning_flags() {
        let cli = parse(&[
            "--buffer-size",
            "1024",
            "--queue-depth",
            "3",
            "--workers",
            "2",
            "--tolerate-appends",
            "-vv",
            "https://acct.example.net/fs/a.bin",
        ]);
        let config = cli.read_ahead_config();
        assert_eq!(config.read_buffer_size, 1024);
        assert_eq!(config.read_ahead_queue_depth, 3);
        assert_eq!(config.worker_pool_size, 2);
        assert!(config.tolerate_oob_appends);
        assert_eq!(cli.log_filter(), "rangefetch=trace");
    }

    #[test]
    fn test_sas_auth() {
        let cli = parse(&["--sas-token", "?sv=1&sig=x", "https://acct.example.net/fs/a.bin"]);
        let url = Url::parse(&cli.url).unwrap();
        let config = cli.client_config(url).unwrap();
        assert!(matches!(config.auth, AuthType::Sas(ref t) if t == "sv=1&sig=x"));
    }

    #[test]
    fn test_conflicting_credentials_rejected() {
        let result = Cli::try_parse_from([
            "rangefetch",
            "--sas-token",
            "sv=1",
            "--bearer-token",
            "t",
            "https://acct.example.net/fs/a.bin",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_shared_key_requires_account() {
        let result = Cli::try_parse_from([
            "rangefetch",
            "--shared-key",
            "a2V5",
            "https://acct.example.net/fs/a.bin",
        ]);
        assert!(result.is_err());
    }
}
