mod fastpath;
mod http;

pub use fastpath::FastpathRangeReader;
pub use http::RestRangeReader;

use async_trait::async_trait;

use crate::error::Result;

/// Ranged reads against one remote object.
///
/// Used both by read-ahead workers and by the direct fallback path of a
/// stream, so one call must be one synchronous (from the caller's view)
/// remote read.
#[async_trait]
pub trait RemoteReader: Send + Sync {
    /// Read up to `buf.len()` bytes at `offset`; returns bytes read.
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Total size of the object
    fn size(&self) -> u64;

    /// Give back any server-side resource held for the object. Called once
    /// when the owning stream closes.
    async fn release(&self) {}
}
