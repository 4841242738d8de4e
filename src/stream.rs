//! Per-stream read path over the shared read-ahead cache.

use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::io::RemoteReader;
use crate::metrics::StreamStatistics;
use crate::readahead::{ReadAheadContext, StreamId};

/// Read-only stream over one remote object.
///
/// Each read first asks the pool for cached bytes, queueing read-ahead
/// windows when the access pattern warrants it, and falls back to a direct
/// remote read whenever the cache has nothing usable. A fresh read-ahead
/// failure covering the requested position is returned as the read's error.
pub struct InputStream {
    id: StreamId,
    context: Arc<ReadAheadContext>,
    source: Arc<dyn RemoteReader>,
    content_length: u64,
    position: u64,
    first_read: bool,
    last_read_end: Option<u64>,
    closed: bool,
    statistics: Arc<StreamStatistics>,
}

impl InputStream {
    pub(crate) fn new(id: StreamId, context: Arc<ReadAheadContext>, source: Arc<dyn RemoteReader>) -> Self {
        let content_length = source.size();
        debug!(stream = id, content_length, "Opened stream");
        Self {
            id,
            context,
            source,
            content_length,
            position: 0,
            first_read: true,
            last_read_end: None,
            closed: false,
            statistics: Arc::new(StreamStatistics::new()),
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn len(&self) -> u64 {
        self.content_length
    }

    pub fn is_empty(&self) -> bool {
        self.content_length == 0
    }

    /// Current cursor used by [`read`](Self::read).
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn statistics(&self) -> Arc<StreamStatistics> {
        Arc::clone(&self.statistics)
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Move the cursor. Seeking to the end is allowed; past it is not.
    pub fn seek(&mut self, position: u64) -> Result<u64> {
        self.ensure_open()?;
        if position > self.content_length {
            return Err(Error::InvalidArgument(format!(
                "cannot seek to {position}, stream length is {}",
                self.content_length
            )));
        }
        self.statistics.seek(position, self.position);
        self.position = position;
        Ok(position)
    }

    /// Read at the cursor and advance it.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = self.read_at(self.position, buf).await?;
        self.position += n as u64;
        Ok(n)
    }

    /// Read up to `buf.len()` bytes at `position`. Returns 0 at end of
    /// stream; may return fewer bytes than asked.
    pub async fn read_at(&mut self, position: u64, buf: &mut [u8]) -> Result<usize> {
        self.ensure_open()?;
        if buf.is_empty() || position >= self.content_length {
            return Ok(0);
        }
        let len = (self.content_length - position).min(buf.len() as u64) as usize;
        let buf = &mut buf[..len];

        self.statistics.read_operation_started();
        let sequential = self.first_read || self.last_read_end == Some(position);
        self.first_read = false;
        self.queue_read_ahead(position, len, sequential);

        let mut n = self
            .context
            .pool()
            .get_block(self.id, position, buf)
            .await?;
        if n > 0 {
            self.statistics.bytes_read_from_buffer(n as u64);
        } else {
            trace!(stream = self.id, position, len, "Reading directly from remote");
            n = self.source.read_at(position, buf).await?;
            self.statistics.remote_read_operation();
        }

        self.statistics.bytes_read(n as u64);
        self.last_read_end = Some(position + n as u64);
        Ok(n)
    }

    /// Queue the read-ahead windows for a read at `position`.
    fn queue_read_ahead(&self, position: u64, len: usize, sequential: bool) {
        let config = self.context.config();
        let buffer_size = config.read_buffer_size as u64;
        let aligned = position - position % buffer_size;

        let (depth, start, window) = if sequential {
            let start = if config.always_read_buffer_size {
                aligned
            } else {
                position
            };
            (config.read_ahead_queue_depth, start, buffer_size)
        } else if config.enable_read_ahead_for_random_read {
            if config.always_read_buffer_size {
                (config.read_ahead_queue_depth_for_random_read, aligned, buffer_size)
            } else {
                let window = (len as u64).min(buffer_size);
                (config.read_ahead_queue_depth_for_random_read, position, window)
            }
        } else {
            return;
        };

        let pool = self.context.pool();
        let mut offset = start;
        for _ in 0..depth {
            if offset >= self.content_length {
                break;
            }
            let length = window.min(self.content_length - offset) as usize;
            if pool.queue_read_ahead(self.id, &self.source, offset, length) {
                self.statistics.read_ahead_queued();
            }
            offset += window;
        }
    }

    /// Release this stream's cached buffers. Further reads fail.
    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.context.pool().purge_stream(self.id);
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                let source = Arc::clone(&self.source);
                runtime.spawn(async move { source.release().await });
            }
            debug!(stream = self.id, statistics = %self.statistics, "Closed stream");
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(Error::StreamClosed(self.id))
        } else {
            Ok(())
        }
    }
}

impl Drop for InputStream {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for InputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputStream")
            .field("id", &self.id)
            .field("content_length", &self.content_length)
            .field("position", &self.position)
            .field("closed", &self.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReadAheadConfig;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Counting {
        data: Vec<u8>,
        calls: AtomicUsize,
    }

    impl Counting {
        fn new(len: usize) -> Arc<Self> {
            Arc::new(Self {
                data: (0..len).map(|i| (i % 251) as u8).collect(),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl RemoteReader for Counting {
        async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let start = (offset as usize).min(self.data.len());
            let n = (self.data.len() - start).min(buf.len());
            buf[..n].copy_from_slice(&self.data[start..start + n]);
            Ok(n)
        }

        fn size(&self) -> u64 {
            self.data.len() as u64
        }
    }

    fn context(config: ReadAheadConfig) -> Arc<ReadAheadContext> {
        ReadAheadContext::start(
            config
                .with_read_buffer_size(1024)
                .with_buffer_pool_size(8)
                .with_worker_pool_size(2)
                .with_block_wait_timeout(Duration::from_secs(5)),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_sequential_read_whole_object() {
        let ctx = context(ReadAheadConfig::new().with_read_ahead_queue_depth(4));
        let source = Counting::new(5000);
        let mut stream = ctx.open_stream(source.clone());

        let mut out = Vec::new();
        let mut buf = vec![0u8; 700];
        loop {
            let n = stream.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }

        assert_eq!(out, source.data);
        assert_eq!(stream.position(), 5000);
        let stats = stream.statistics();
        assert_eq!(stats.total_bytes_read(), 5000);
        assert_eq!(stats.remote_read_operations(), 0);
    }

    #[tokio::test]
    async fn test_read_clamped_at_end_of_stream() {
        let ctx = context(ReadAheadConfig::new());
        let source = Counting::new(100);
        let mut stream = ctx.open_stream(source);

        let mut buf = vec![0u8; 64];
        assert_eq!(stream.read_at(90, &mut buf).await.unwrap(), 10);
        assert_eq!(stream.read_at(100, &mut buf).await.unwrap(), 0);
        assert_eq!(stream.read_at(5000, &mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_random_read_without_read_ahead_goes_direct() {
        let ctx = context(ReadAheadConfig::new().with_read_ahead_queue_depth(2));
        let source = Counting::new(8192);
        let mut stream = ctx.open_stream(source.clone());

        let mut buf = vec![0u8; 100];
        stream.read_at(0, &mut buf).await.unwrap();
        let queued = stream.statistics().read_ahead_requests();

        // jump far away: not sequential, random read-ahead is off
        assert_eq!(stream.read_at(6000, &mut buf).await.unwrap(), 100);
        assert_eq!(&buf[..], &source.data[6000..6100]);
        let stats = stream.statistics();
        assert_eq!(stats.read_ahead_requests(), queued);
        assert_eq!(stats.remote_read_operations(), 1);
    }

    #[tokio::test]
    async fn test_random_read_ahead_aligned_windows() {
        let ctx = context(
            ReadAheadConfig::new()
                .with_read_ahead_queue_depth(1)
                .with_read_ahead_for_random_read(true)
                .with_always_read_buffer_size(true)
                .with_read_ahead_queue_depth_for_random_read(2),
        );
        let source = Counting::new(8192);
        let mut stream = ctx.open_stream(source.clone());

        let mut buf = vec![0u8; 10];
        stream.read_at(0, &mut buf).await.unwrap();
        let before = stream.statistics().read_ahead_requests();

        assert_eq!(stream.read_at(5000, &mut buf).await.unwrap(), 10);
        assert_eq!(&buf[..], &source.data[5000..5010]);
        // windows at 4096 and 5120
        assert_eq!(stream.statistics().read_ahead_requests(), before + 2);
        assert_eq!(stream.statistics().remote_read_operations(), 0);
    }

    #[tokio::test]
    async fn test_first_read_aligns_sequential_windows() {
        let ctx = context(
            ReadAheadConfig::new()
                .with_read_ahead_queue_depth(2)
                .with_always_read_buffer_size(true),
        );
        let source = Counting::new(4096);
        let mut stream = ctx.open_stream(source.clone());

        let mut buf = vec![0u8; 10];
        assert_eq!(stream.read_at(700, &mut buf).await.unwrap(), 10);
        assert_eq!(&buf[..], &source.data[700..710]);
        assert_eq!(stream.statistics().read_ahead_requests(), 2);
        assert_eq!(stream.statistics().remote_read_operations(), 0);

        // windows cover 0..1024 and 1024..2048, nothing past them
        let pool = ctx.pool();
        assert!(!pool.queue_read_ahead(stream.id(), &stream.source, 0, 600));
        assert!(!pool.queue_read_ahead(stream.id(), &stream.source, 1900, 100));
        assert!(pool.queue_read_ahead(stream.id(), &stream.source, 2048, 1024));
    }

    #[tokio::test]
    async fn test_seek_then_read() {
        let ctx = context(ReadAheadConfig::new());
        let source = Counting::new(4096);
        let mut stream = ctx.open_stream(source.clone());

        assert_eq!(stream.seek(2000).unwrap(), 2000);
        let mut buf = vec![0u8; 50];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 50);
        assert_eq!(&buf[..], &source.data[2000..2050]);
        assert_eq!(stream.position(), 2050);
        assert_eq!(stream.statistics().seek_operations(), 1);

        assert!(stream.seek(4096).is_ok());
        assert!(stream.seek(4097).is_err());
    }

    #[tokio::test]
    async fn test_close_purges_and_rejects_reads() {
        let ctx = context(ReadAheadConfig::new().with_read_ahead_queue_depth(4));
        let source = Counting::new(4096);
        let mut stream = ctx.open_stream(source);

        let mut buf = vec![0u8; 1024];
        stream.read(&mut buf).await.unwrap();
        stream.close();

        assert!(matches!(
            stream.read(&mut buf).await,
            Err(Error::StreamClosed(id)) if id == stream.id()
        ));
        assert!(stream.seek(0).is_err());

        ctx.shutdown().await;
        assert_eq!(ctx.pool().status().free, 8);
    }

    #[tokio::test]
    async fn test_streams_get_distinct_ids() {
        let ctx = context(ReadAheadConfig::new());
        let a = ctx.open_stream(Counting::new(10));
        let b = ctx.open_stream(Counting::new(10));
        assert_ne!(a.id(), b.id());
    }
}
