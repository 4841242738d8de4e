use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use super::RemoteReader;
use crate::error::Result;
use crate::rest::RestClient;

/// Ranged reader for one remote object over the REST client
pub struct RestRangeReader {
    client: Arc<RestClient>,
    path: String,
    size: u64,
    etag: Option<String>,
    rest_fallback: bool,
}

impl RestRangeReader {
    /// Open a reader for `path`.
    ///
    /// This sends a HEAD request to learn the object size and version.
    pub async fn open(client: Arc<RestClient>, path: impl Into<String>) -> Result<Self> {
        let path = path.into();
        let props = client.get_path_status(&path).await?;
        debug!(path = %path, size = props.content_length, etag = ?props.etag, "Opened remote object");

        Ok(Self {
            client,
            path,
            size: props.content_length,
            etag: props.etag,
            rest_fallback: false,
        })
    }

    /// Stop pinning reads to the version seen at open time.
    pub fn without_etag(mut self) -> Self {
        self.etag = None;
        self
    }

    /// Tag every read as a REST fallback for a failed fastpath read.
    pub(crate) fn as_fastpath_fallback(mut self) -> Self {
        self.rest_fallback = true;
        self
    }

    pub fn client(&self) -> &Arc<RestClient> {
        &self.client
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn etag(&self) -> Option<&str> {
        self.etag.as_deref()
    }
}

#[async_trait]
impl RemoteReader for RestRangeReader {
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() || offset >= self.size {
            return Ok(0);
        }

        let expected_size = (self.size - offset).min(buf.len() as u64) as usize;
        let mut received = 0;

        // The server may return fewer bytes than asked; keep going until
        // the range is complete or it has nothing more to give.
        while received < expected_size {
            let current = offset + received as u64;
            let target = &mut buf[received..expected_size];
            let etag = self.etag.as_deref();
            let n = if self.rest_fallback {
                self.client
                    .read_after_fastpath_failure(&self.path, current, target, etag)
                    .await?
            } else {
                self.client.read(&self.path, current, target, etag).await?
            };
            if n == 0 {
                break;
            }
            received += n;
        }

        Ok(received)
    }

    fn size(&self) -> u64 {
        self.size
    }
}
