//! REST access to the remote store.
//!
//! [`RestClient`] builds the requests for each supported operation and runs
//! them through a [`RestOperationExecutor`]. The transport, credentials,
//! retry policy and metrics sink live in a [`ClientContext`] that every
//! executor borrows read-only.
//!
//! A context may also carry a [`FastpathTransport`]. Reads of files opened
//! over fastpath then go through it, and fall back to a tagged REST read
//! when it fails.

mod auth;
mod operation;
mod retry;
mod transport;

pub use auth::{
    AccessToken, AccessTokenProvider, AuthType, CustomTokenProvider, CustomTokenProviderAdapter,
    SERVICE_VERSION, SharedKeyCredentials, StaticTokenProvider,
};
pub use operation::{
    CLIENT_REQUEST_ID, HttpResult, OperationState, OperationType, REST_FALLBACK_SUFFIX,
    RestOperation, RestOperationExecutor, RetryState,
};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use transport::{
    FASTPATH_HANDLE, FastpathRequest, FastpathTransport, HttpRequest, HttpResponse, HttpTransport,
    ReqwestTransport, TransportError,
};

use bytes::Bytes;
use reqwest::header::{CONTENT_LENGTH, ETAG, HeaderValue, IF_MATCH, RANGE};
use reqwest::{Method, Url};
use std::sync::Arc;
use tracing::trace;

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::metrics::{MetricsSink, NoopMetrics};

/// Shared, read-only state beneath every executor of a client.
pub struct ClientContext {
    pub(crate) transport: Arc<dyn HttpTransport>,
    pub(crate) auth: AuthType,
    pub(crate) retry_policy: RetryPolicy,
    pub(crate) metrics: Arc<dyn MetricsSink>,
    pub(crate) fastpath: Option<Arc<dyn FastpathTransport>>,
}

impl ClientContext {
    pub fn new(transport: Arc<dyn HttpTransport>, auth: AuthType, retry_policy: RetryPolicy) -> Self {
        Self {
            transport,
            auth,
            retry_policy,
            metrics: Arc::new(NoopMetrics),
            fastpath: None,
        }
    }

    pub fn with_fastpath(mut self, fastpath: Arc<dyn FastpathTransport>) -> Self {
        self.fastpath = Some(fastpath);
        self
    }

    /// Whether fastpath calls can be made with this context.
    pub fn fastpath_enabled(&self) -> bool {
        self.fastpath.is_some() && self.auth.supports_fastpath()
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }
}

/// Length and version of a remote object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathProperties {
    pub content_length: u64,
    pub etag: Option<String>,
}

/// Client for one account / filesystem root.
pub struct RestClient {
    base_url: Url,
    context: ClientContext,
}

impl RestClient {
    /// Build a client with the reqwest transport.
    pub fn new(config: &ClientConfig) -> Result<Self> {
        config.validate()?;
        let transport = ReqwestTransport::new(config.request_timeout)?;
        let context = ClientContext::new(
            Arc::new(transport),
            config.auth.clone(),
            config.retry_policy.clone(),
        );
        Ok(Self {
            base_url: config.base_url.clone(),
            context,
        })
    }

    pub fn with_context(base_url: Url, context: ClientContext) -> Self {
        Self { base_url, context }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.context.metrics = metrics;
        self
    }

    pub fn context(&self) -> &ClientContext {
        &self.context
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Execute an arbitrary logical operation.
    pub async fn execute(&self, operation: RestOperation) -> Result<HttpResult> {
        let mut executor = RestOperationExecutor::new(&self.context, operation);
        executor.execute().await
    }

    fn url_for(&self, path: &str, query: &[(&str, String)]) -> Result<Url> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| Error::Config(format!("base URL {} cannot be a base", self.base_url)))?;
            segments.pop_if_empty();
            segments.extend(path.split('/').filter(|s| !s.is_empty()));
        }
        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (name, value) in query {
                pairs.append_pair(name, value);
            }
        }
        Ok(url)
    }

    /// HEAD the object for its length and ETag.
    pub async fn get_path_status(&self, path: &str) -> Result<PathProperties> {
        let url = self.url_for(path, &[])?;
        let result = self
            .execute(RestOperation::new(OperationType::GetPathStatus, Method::HEAD, url))
            .await?;

        let content_length = result
            .header(CONTENT_LENGTH.as_str())
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| Error::InvalidArgument(format!("{path}: no Content-Length in response")))?;
        let etag = result.header(ETAG.as_str()).map(str::to_string);

        Ok(PathProperties {
            content_length,
            etag,
        })
    }

    /// Ranged read of `buf.len()` bytes at `position`.
    ///
    /// When `etag` is given the read is pinned to that object version with
    /// `If-Match`. Returns the number of bytes copied into `buf`.
    pub async fn read(
        &self,
        path: &str,
        position: u64,
        buf: &mut [u8],
        etag: Option<&str>,
    ) -> Result<usize> {
        self.read_inner(path, position, buf, etag, false).await
    }

    /// [`read`](Self::read) standing in for a failed fastpath read; the
    /// client request id carries [`REST_FALLBACK_SUFFIX`].
    pub async fn read_after_fastpath_failure(
        &self,
        path: &str,
        position: u64,
        buf: &mut [u8],
        etag: Option<&str>,
    ) -> Result<usize> {
        self.read_inner(path, position, buf, etag, true).await
    }

    async fn read_inner(
        &self,
        path: &str,
        position: u64,
        buf: &mut [u8],
        etag: Option<&str>,
        rest_fallback: bool,
    ) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let url = self.url_for(path, &[])?;
        let mut op = RestOperation::new(OperationType::ReadFile, Method::GET, url)
            .with_header(RANGE, header_value(&range_header(position, buf.len()))?);
        if let Some(etag) = etag {
            op = op.with_header(IF_MATCH, header_value(etag)?);
        }
        if rest_fallback {
            op = op.with_rest_fallback();
        }

        let result = self.execute(op).await?;

        // A server that ignores Range answers 200 with the whole object.
        let body = if result.status == 200 {
            let start = (position as usize).min(result.body.len());
            result.body.slice(start..)
        } else {
            result.body
        };

        let n = body.len().min(buf.len());
        buf[..n].copy_from_slice(&body[..n]);
        trace!(path, position, requested = buf.len(), received = n, "Ranged read complete");
        Ok(n)
    }

    /// Open `path` over fastpath and return its file handle.
    pub async fn fastpath_open(&self, path: &str, etag: Option<&str>) -> Result<String> {
        let url = self.url_for(path, &[])?;
        let mut op = RestOperation::new(OperationType::FastpathOpen, Method::GET, url);
        if let Some(etag) = etag {
            op = op.with_header(IF_MATCH, header_value(etag)?);
        }
        let result = self.execute(op).await?;
        result
            .header(FASTPATH_HANDLE)
            .filter(|h| !h.is_empty())
            .map(str::to_string)
            .ok_or_else(|| Error::InvalidArgument(format!("{path}: fastpath open returned no handle")))
    }

    /// Ranged read of an open fastpath handle.
    pub async fn fastpath_read(
        &self,
        path: &str,
        handle: &str,
        position: u64,
        buf: &mut [u8],
    ) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let url = self.url_for(path, &[])?;
        let op = RestOperation::new(OperationType::FastpathRead, Method::GET, url)
            .with_header(RANGE, header_value(&range_header(position, buf.len()))?)
            .with_fastpath_handle(handle);
        let result = self.execute(op).await?;

        let n = result.body.len().min(buf.len());
        buf[..n].copy_from_slice(&result.body[..n]);
        trace!(path, position, received = n, "Fastpath read complete");
        Ok(n)
    }

    /// Release a fastpath handle.
    pub async fn fastpath_close(&self, path: &str, handle: &str) -> Result<()> {
        let url = self.url_for(path, &[])?;
        let op = RestOperation::new(OperationType::FastpathClose, Method::DELETE, url)
            .with_fastpath_handle(handle);
        self.execute(op).await?;
        Ok(())
    }

    /// Upload `data` at `position` of an existing file.
    pub async fn append(&self, path: &str, position: u64, data: Bytes) -> Result<HttpResult> {
        let url = self.url_for(
            path,
            &[("action", "append".to_string()), ("position", position.to_string())],
        )?;
        self.execute(RestOperation::new(OperationType::Append, Method::PATCH, url).with_body(data))
            .await
    }

    /// Commit appended data up to `position`.
    pub async fn flush(&self, path: &str, position: u64, close: bool) -> Result<HttpResult> {
        let url = self.url_for(
            path,
            &[
                ("action", "flush".to_string()),
                ("position", position.to_string()),
                ("close", close.to_string()),
            ],
        )?;
        self.execute(
            RestOperation::new(OperationType::Flush, Method::PATCH, url).with_body(Bytes::new()),
        )
        .await
    }
}

fn range_header(position: u64, len: usize) -> String {
    let end = position.saturating_add(len as u64 - 1);
    format!("bytes={}-{}", position, end)
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| Error::InvalidArgument(format!("invalid header value {value:?}: {e}")))
}
