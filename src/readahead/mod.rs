//! Shared read-ahead cache.
//!
//! A [`ReadAheadContext`] owns one [`ReadBufferPool`] and the
//! [`ReadAheadScheduler`] workers that fill it. Every [`InputStream`] opened
//! from the same context shares both; buffers are keyed by stream so data
//! never crosses streams.

mod buffer;
mod pool;
mod scheduler;

pub use buffer::{BufferStatus, StreamId};
pub use pool::{PoolStatus, ReadBufferPool};
pub use scheduler::ReadAheadScheduler;

use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

use crate::config::ReadAheadConfig;
use crate::error::Result;
use crate::io::{FastpathRangeReader, RemoteReader, RestRangeReader};
use crate::rest::RestClient;
use crate::stream::InputStream;

/// Pool, workers and stream id allocation for a set of streams.
pub struct ReadAheadContext {
    config: ReadAheadConfig,
    pool: Arc<ReadBufferPool>,
    scheduler: Mutex<Option<ReadAheadScheduler>>,
    next_stream_id: AtomicU64,
}

impl ReadAheadContext {
    /// Allocate the pool and spawn the workers. Must run inside a tokio
    /// runtime.
    pub fn start(config: ReadAheadConfig) -> Result<Arc<Self>> {
        config.validate()?;

        let pool = Arc::new(ReadBufferPool::new(&config));
        let scheduler = ReadAheadScheduler::start(Arc::clone(&pool), config.worker_pool_size);
        info!(
            buffers = config.buffer_pool_size,
            buffer_size = config.read_buffer_size,
            workers = config.worker_pool_size,
            "Read-ahead started"
        );

        Ok(Arc::new(Self {
            config,
            pool,
            scheduler: Mutex::new(Some(scheduler)),
            next_stream_id: AtomicU64::new(1),
        }))
    }

    pub fn config(&self) -> &ReadAheadConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<ReadBufferPool> {
        &self.pool
    }

    /// Open a stream over any ranged source.
    pub fn open_stream(self: &Arc<Self>, source: Arc<dyn RemoteReader>) -> InputStream {
        let id = self.next_stream_id.fetch_add(1, Ordering::Relaxed);
        InputStream::new(id, Arc::clone(self), source)
    }

    /// Open a stream over a remote object, learning its length first.
    ///
    /// When the client has a usable fastpath transport the stream reads
    /// through a fastpath handle and falls back to REST on failure.
    pub async fn open_rest_stream(
        self: &Arc<Self>,
        client: Arc<RestClient>,
        path: &str,
    ) -> Result<InputStream> {
        let fastpath = client.context().fastpath_enabled();
        let mut reader = RestRangeReader::open(client, path).await?;
        if self.config.tolerate_oob_appends {
            reader = reader.without_etag();
        }
        let source: Arc<dyn RemoteReader> = if fastpath {
            Arc::new(FastpathRangeReader::open(reader).await)
        } else {
            Arc::new(reader)
        };
        Ok(self.open_stream(source))
    }

    /// Stop the workers once their current fills finish. Later queue
    /// requests are accepted but never filled, so reads fall back to
    /// direct remote reads after the block wait timeout.
    pub async fn shutdown(&self) {
        let scheduler = self.scheduler.lock().take();
        if let Some(scheduler) = scheduler {
            scheduler.shutdown().await;
            info!("Read-ahead stopped");
        }
    }
}
