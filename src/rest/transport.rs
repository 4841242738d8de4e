use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::HeaderMap;
use reqwest::{Client, Method, Url};
use std::error::Error as _;
use std::time::Duration;

use super::operation::OperationType;
use crate::error::{Error, NetworkErrorKind, Result};

/// One physical HTTP request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

impl HttpRequest {
    pub fn content_length(&self) -> u64 {
        self.body.as_ref().map(|b| b.len() as u64).unwrap_or(0)
    }
}

/// Response to one physical HTTP request, body fully buffered.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Failure that produced no HTTP response.
#[derive(Debug, Clone)]
pub struct TransportError {
    pub kind: NetworkErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: NetworkErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Sends a single request and returns whatever the server answered.
///
/// Implementations never retry; that is the executor's job.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> std::result::Result<HttpResponse, TransportError>;
}

/// Response header carrying the file handle returned by a fastpath open.
pub const FASTPATH_HANDLE: &str = "x-ms-fastpath-file-handle";

/// One fastpath call: the authorized request plus the open file handle it
/// refers to (none for an open).
#[derive(Debug, Clone)]
pub struct FastpathRequest {
    pub operation: OperationType,
    pub request: HttpRequest,
    pub handle: Option<String>,
}

/// Low-latency side channel for reads of already-open files.
///
/// Answers use the same status codes and error bodies as REST, so the
/// executor retries and classifies them the same way. An open answers with
/// the handle in [`FASTPATH_HANDLE`]; a read answers with the bytes.
#[async_trait]
pub trait FastpathTransport: Send + Sync {
    async fn send(&self, request: FastpathRequest) -> std::result::Result<HttpResponse, TransportError>;
}

/// reqwest-backed transport
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("cannot build HTTP client: {e}")))?;
        Ok(Self { client })
    }

    fn classify(err: &reqwest::Error) -> NetworkErrorKind {
        if err.is_timeout() {
            return NetworkErrorKind::Timeout;
        }
        if err.is_connect() {
            // hyper reports resolver failures as connect errors; the cause
            // chain carries the "dns error" text.
            let mut source = err.source();
            while let Some(cause) = source {
                let text = cause.to_string();
                if text.contains("dns error") || text.contains("failed to lookup address") {
                    return NetworkErrorKind::UnknownHost;
                }
                source = cause.source();
            }
            return NetworkErrorKind::Connect;
        }
        if err.is_body() || err.is_decode() {
            return NetworkErrorKind::Body;
        }
        NetworkErrorKind::Other
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> std::result::Result<HttpResponse, TransportError> {
        let mut builder = self
            .client
            .request(request.method, request.url)
            .headers(request.headers);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let resp = builder
            .send()
            .await
            .map_err(|e| TransportError::new(Self::classify(&e), e.to_string()))?;

        let status = resp.status().as_u16();
        let headers = resp.headers().clone();
        let body = resp
            .bytes()
            .await
            .map_err(|e| TransportError::new(Self::classify(&e), e.to_string()))?;

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}
