//! # rangefetch
//!
//! Read-ahead buffer cache and retrying REST executor for range-addressable
//! remote object storage.
//!
//! Streams opened from a shared [`ReadAheadContext`] serve reads from a
//! bounded pool of buffers that background workers fill with ranged GETs
//! ahead of the reader. Every remote call goes through a
//! [`RestOperationExecutor`](rest::RestOperationExecutor) that authorizes,
//! retries with backoff and classifies failures.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use rangefetch::{ClientConfig, ReadAheadConfig, ReadAheadContext, RestClient};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let url = "https://acct.example.net/fs".parse()?;
//!     let client = Arc::new(RestClient::new(&ClientConfig::new(url))?);
//!
//!     let context = ReadAheadContext::start(ReadAheadConfig::default())?;
//!     let mut stream = context.open_rest_stream(client, "dir/data.bin").await?;
//!
//!     let mut buf = vec![0u8; 64 * 1024];
//!     let n = stream.read(&mut buf).await?;
//!     println!("read {n} of {} bytes", stream.len());
//!
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod config;
pub mod error;
pub mod io;
pub mod metrics;
pub mod readahead;
pub mod rest;
pub mod stream;

pub use cli::Cli;
pub use config::{ClientConfig, ReadAheadConfig};
pub use error::{Error, NetworkErrorKind, Result};
pub use io::{FastpathRangeReader, RemoteReader, RestRangeReader};
pub use readahead::{ReadAheadContext, ReadBufferPool};
pub use rest::{AuthType, RestClient, RetryPolicy};
pub use stream::InputStream;
