use std::fmt;
use std::sync::Arc;
use tokio::time::Instant;

use crate::error::Error;
use crate::io::RemoteReader;

/// Identity of an open stream within one read-ahead context.
pub type StreamId = u64;

/// Fill state of a pooled buffer.
#[derive(Debug, Clone)]
pub enum BufferStatus {
    /// Queued, waiting for a worker
    Pending,
    /// A worker is filling it
    InProgress,
    /// Filled; `bytes_filled` bytes are valid
    Available,
    /// The fill failed with this error
    Failed(Error),
}

/// One pooled slot and the range it was asked to fill.
///
/// `data` is allocated once at pool construction and only ever moves
/// between the pool and the worker filling it.
pub(crate) struct ReadBuffer {
    pub(crate) id: u64,
    pub(crate) stream: StreamId,
    pub(crate) source: Arc<dyn RemoteReader>,
    pub(crate) offset: u64,
    pub(crate) requested_len: usize,
    pub(crate) data: Vec<u8>,
    pub(crate) status: BufferStatus,
    pub(crate) bytes_filled: usize,
    pub(crate) completed_at: Option<Instant>,
    /// Set when the owning stream closed while the fill was in flight
    pub(crate) orphaned: bool,
}

impl ReadBuffer {
    pub(crate) fn new(
        id: u64,
        stream: StreamId,
        source: Arc<dyn RemoteReader>,
        offset: u64,
        requested_len: usize,
        data: Vec<u8>,
    ) -> Self {
        Self {
            id,
            stream,
            source,
            offset,
            requested_len,
            data,
            status: BufferStatus::Pending,
            bytes_filled: 0,
            completed_at: None,
            orphaned: false,
        }
    }

    pub(crate) fn end(&self) -> u64 {
        self.offset.saturating_add(self.requested_len as u64)
    }

    /// Whether `position` falls in the range this buffer was queued for.
    pub(crate) fn covers(&self, stream: StreamId, position: u64) -> bool {
        self.stream == stream && position >= self.offset && position < self.end()
    }

    pub(crate) fn overlaps(&self, stream: StreamId, offset: u64, len: usize) -> bool {
        self.stream == stream && offset < self.end() && self.offset < offset.saturating_add(len as u64)
    }

    /// Time since completion; zero for buffers still in flight.
    pub(crate) fn age(&self, now: Instant) -> std::time::Duration {
        self.completed_at
            .map(|t| now.saturating_duration_since(t))
            .unwrap_or_default()
    }

    /// Copy the bytes at `position..` into `out`; 0 when `position` lies
    /// past what the fill actually returned.
    pub(crate) fn copy_to(&self, position: u64, out: &mut [u8]) -> usize {
        let start = (position - self.offset) as usize;
        if start >= self.bytes_filled {
            return 0;
        }
        let n = (self.bytes_filled - start).min(out.len());
        out[..n].copy_from_slice(&self.data[start..start + n]);
        n
    }

    /// Strip the slot back to its storage for the free list.
    pub(crate) fn into_storage(self) -> Vec<u8> {
        self.data
    }
}

impl fmt::Debug for ReadBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadBuffer")
            .field("id", &self.id)
            .field("stream", &self.stream)
            .field("offset", &self.offset)
            .field("requested_len", &self.requested_len)
            .field("status", &self.status)
            .field("bytes_filled", &self.bytes_filled)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use async_trait::async_trait;

    struct Empty;

    #[async_trait]
    impl RemoteReader for Empty {
        async fn read_at(&self, _offset: u64, _buf: &mut [u8]) -> Result<usize> {
            Ok(0)
        }

        fn size(&self) -> u64 {
            0
        }
    }

    fn buffer(offset: u64, len: usize) -> ReadBuffer {
        ReadBuffer::new(1, 7, Arc::new(Empty), offset, len, vec![0u8; 1024])
    }

    #[test]
    fn test_covers_and_overlaps() {
        let buf = buffer(1024, 1024);
        assert!(buf.covers(7, 1024));
        assert!(buf.covers(7, 2047));
        assert!(!buf.covers(7, 2048));
        assert!(!buf.covers(8, 1024));

        assert!(buf.overlaps(7, 512, 1024));
        assert!(buf.overlaps(7, 2000, 10));
        assert!(!buf.overlaps(7, 0, 1024));
        assert!(!buf.overlaps(7, 2048, 1024));
        assert!(!buf.overlaps(8, 1024, 1024));
    }

    #[test]
    fn test_copy_respects_bytes_filled() {
        let mut buf = buffer(100, 1024);
        buf.data[..10].copy_from_slice(b"0123456789");
        buf.bytes_filled = 10;
        buf.status = BufferStatus::Available;

        let mut out = [0u8; 4];
        assert_eq!(buf.copy_to(103, &mut out), 4);
        assert_eq!(&out, b"3456");

        let mut out = [0u8; 16];
        assert_eq!(buf.copy_to(108, &mut out), 2);
        assert_eq!(&out[..2], b"89");

        assert_eq!(buf.copy_to(110, &mut out), 0);
    }

    #[test]
    fn test_ranges_near_end_of_offset_space() {
        let buf = buffer(u64::MAX - 100, 1024);
        assert_eq!(buf.end(), u64::MAX);
        assert!(buf.covers(7, u64::MAX - 1));
        assert!(!buf.covers(7, u64::MAX - 101));

        assert!(buf.overlaps(7, u64::MAX - 10, 4096));
        assert!(!buf.overlaps(7, 0, 1024));

        let low = buffer(0, 1024);
        assert!(!low.overlaps(7, u64::MAX - 10, 4096));
        assert!(low.overlaps(7, 1023, usize::MAX));
    }
}
