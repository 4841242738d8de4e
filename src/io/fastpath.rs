use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

use super::{RemoteReader, RestRangeReader};
use crate::error::Result;

/// Ranged reader that prefers a fastpath file handle and falls back to REST.
///
/// The handle comes from one fastpath open. Once any fastpath call fails the
/// reader stays on REST for the rest of its life, and every REST read it
/// makes is tagged as a fallback.
pub struct FastpathRangeReader {
    rest: RestRangeReader,
    handle: Mutex<Option<String>>,
    fell_back: AtomicBool,
}

impl FastpathRangeReader {
    /// Open a fastpath handle for the object behind `rest`.
    ///
    /// A failed open is not an error: the reader then serves every read
    /// over REST.
    pub async fn open(rest: RestRangeReader) -> Self {
        let rest = rest.as_fastpath_fallback();
        let handle = match rest.client().fastpath_open(rest.path(), rest.etag()).await {
            Ok(handle) => {
                debug!(path = rest.path(), "Opened fastpath handle");
                Some(handle)
            }
            Err(e) => {
                warn!(path = rest.path(), error = %e, "Fastpath open failed; reading over REST");
                None
            }
        };

        Self {
            fell_back: AtomicBool::new(handle.is_none()),
            handle: Mutex::new(handle),
            rest,
        }
    }

    /// Whether reads currently go over fastpath.
    pub fn is_fastpath(&self) -> bool {
        !self.fell_back.load(Ordering::Acquire) && self.handle.lock().is_some()
    }

    fn current_handle(&self) -> Option<String> {
        if self.fell_back.load(Ordering::Acquire) {
            return None;
        }
        self.handle.lock().clone()
    }
}

#[async_trait]
impl RemoteReader for FastpathRangeReader {
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let size = self.rest.size();
        if buf.is_empty() || offset >= size {
            return Ok(0);
        }
        let Some(handle) = self.current_handle() else {
            return self.rest.read_at(offset, buf).await;
        };

        let expected_size = (size - offset).min(buf.len() as u64) as usize;
        let client = self.rest.client();
        let mut received = 0;
        while received < expected_size {
            let current = offset + received as u64;
            match client
                .fastpath_read(self.rest.path(), &handle, current, &mut buf[received..expected_size])
                .await
            {
                Ok(0) => break,
                Ok(n) => received += n,
                Err(e) => {
                    warn!(
                        path = self.rest.path(),
                        offset = current,
                        error = %e,
                        "Fastpath read failed; falling back to REST"
                    );
                    self.fell_back.store(true, Ordering::Release);
                    let n = self
                        .rest
                        .read_at(current, &mut buf[received..expected_size])
                        .await?;
                    return Ok(received + n);
                }
            }
        }

        Ok(received)
    }

    fn size(&self) -> u64 {
        self.rest.size()
    }

    async fn release(&self) {
        let handle = self.handle.lock().take();
        let Some(handle) = handle else {
            return;
        };
        if let Err(e) = self.rest.client().fastpath_close(self.rest.path(), &handle).await {
            warn!(path = self.rest.path(), error = %e, "Fastpath close failed");
        }
    }
}
