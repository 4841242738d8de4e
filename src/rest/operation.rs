//! One logical REST call executed as one or more physical HTTP attempts.
//!
//! ## Attempt loop
//!
//! ```text
//! NotStarted ──► Attempting ──► Succeeded
//!                  │  ▲   └──► Failed
//!                  └──┘ (retry after backoff)
//! ```
//!
//! Each attempt authorizes the request afresh, sends it, and classifies the
//! outcome as a connection failure (no status), an HTTP failure
//! (any status outside 2xx) or success. The client's [`RetryPolicy`] decides whether
//! another attempt follows. A fatal auth error is escalated immediately.

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode, Url};
use serde::Deserialize;
use std::fmt;
use std::time::Instant;
use tracing::{debug, trace, warn};

use super::ClientContext;
use super::transport::{FastpathRequest, HttpRequest, HttpResponse, TransportError};
use crate::error::{Error, Result};
use crate::metrics::Statistic;

/// Header carrying a per-attempt correlation id.
pub const CLIENT_REQUEST_ID: &str = "x-ms-client-request-id";

/// Suffix on the client request id of a REST read that replaces a failed
/// fastpath read.
pub const REST_FALLBACK_SUFFIX: &str = "_RF";

/// Kind of logical operation, used for logging, metrics and errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationType {
    ReadFile,
    Append,
    Flush,
    GetPathStatus,
    FastpathOpen,
    FastpathRead,
    FastpathClose,
}

impl OperationType {
    /// Whether the operation goes over the fastpath transport.
    pub fn is_fastpath(&self) -> bool {
        matches!(
            self,
            OperationType::FastpathOpen | OperationType::FastpathRead | OperationType::FastpathClose
        )
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OperationType::ReadFile => "ReadFile",
            OperationType::Append => "Append",
            OperationType::Flush => "Flush",
            OperationType::GetPathStatus => "GetPathStatus",
            OperationType::FastpathOpen => "FastpathOpen",
            OperationType::FastpathRead => "FastpathRead",
            OperationType::FastpathClose => "FastpathClose",
        };
        f.write_str(s)
    }
}

/// Lifecycle of a logical operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    NotStarted,
    Attempting,
    Succeeded,
    Failed,
}

/// Attempt bookkeeping for one `execute()` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryState {
    /// Physical attempts started so far
    pub attempts: u32,
    /// Status of the last response, `None` after a connection failure
    pub last_status: Option<u16>,
}

/// Description of a logical REST call.
#[derive(Debug, Clone)]
pub struct RestOperation {
    operation_type: OperationType,
    method: Method,
    url: Url,
    headers: HeaderMap,
    body: Option<Bytes>,
    expected_status: Option<u16>,
    fastpath_handle: Option<String>,
    rest_fallback: bool,
}

impl RestOperation {
    pub fn new(operation_type: OperationType, method: Method, url: Url) -> Self {
        Self {
            operation_type,
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
            expected_status: None,
            fastpath_handle: None,
            rest_fallback: false,
        }
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Request entity for upload operations.
    pub fn with_body(mut self, body: Bytes) -> Self {
        self.body = Some(body);
        self
    }

    /// Treat `status` as a terminal success even outside 2xx, for checks
    /// where e.g. 404 is an expected answer.
    pub fn with_expected_status(mut self, status: u16) -> Self {
        self.expected_status = Some(status);
        self
    }

    /// File handle from a fastpath open, sent with fastpath reads and closes.
    pub fn with_fastpath_handle(mut self, handle: impl Into<String>) -> Self {
        self.fastpath_handle = Some(handle.into());
        self
    }

    /// Mark a REST call that stands in for a failed fastpath call.
    pub fn with_rest_fallback(mut self) -> Self {
        self.rest_fallback = true;
        self
    }

    pub fn operation_type(&self) -> OperationType {
        self.operation_type
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    fn build_request(&self) -> HttpRequest {
        HttpRequest {
            method: self.method.clone(),
            url: self.url.clone(),
            headers: self.headers.clone(),
            body: self.body.clone(),
        }
    }
}

/// Terminal HTTP result of a logical operation.
#[derive(Debug, Clone)]
pub struct HttpResult {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub request_id: String,
    pub error_code: String,
    pub error_message: String,
}

impl HttpResult {
    fn from_response(response: HttpResponse, method: &Method, bytes_sent: u64) -> Self {
        let request_id = response
            .header("x-ms-request-id")
            .unwrap_or_default()
            .to_string();

        let failed = !(200..300).contains(&response.status);
        let (error_code, error_message) = if failed && *method != Method::HEAD {
            parse_storage_error(response.status, &response.body)
        } else {
            (String::new(), String::new())
        };

        Self {
            status: response.status,
            bytes_received: response.body.len() as u64,
            headers: response.headers,
            body: response.body,
            bytes_sent,
            request_id,
            error_code,
            error_message,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, Deserialize)]
struct StorageErrorResponse {
    #[serde(default)]
    error: Option<StorageErrorBody>,
    #[serde(default, alias = "Code")]
    code: Option<String>,
    #[serde(default, alias = "Message")]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StorageErrorBody {
    #[serde(default, alias = "Code")]
    code: Option<String>,
    #[serde(default, alias = "Message")]
    message: Option<String>,
}

/// Extract `code` / `message` from an error body of the form
/// `{"error": {"code": .., "message": ..}}` (or the same fields at top
/// level). Unparseable bodies fall back to the status reason.
fn parse_storage_error(status: u16, body: &[u8]) -> (String, String) {
    let reason = StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("")
        .to_string();

    match serde_json::from_slice::<StorageErrorResponse>(body) {
        Ok(parsed) => {
            let (code, message) = match parsed.error {
                Some(inner) => (inner.code, inner.message),
                None => (parsed.code, parsed.message),
            };
            (code.unwrap_or_default(), message.unwrap_or(reason))
        }
        Err(e) => {
            trace!(error = %e, "Error response body is not JSON");
            (String::new(), reason)
        }
    }
}

enum AttemptOutcome {
    Done(HttpResult),
    Retry,
}

/// Drives one [`RestOperation`] to a terminal result.
///
/// An executor is built per logical call and runs it once; afterwards
/// [`state`](Self::state) and [`retry_state`](Self::retry_state) describe how
/// it ended. Only the [`ClientContext`] beneath it is shared between calls.
pub struct RestOperationExecutor<'a> {
    context: &'a ClientContext,
    operation: RestOperation,
    state: OperationState,
    retry: RetryState,
}

impl<'a> RestOperationExecutor<'a> {
    pub fn new(context: &'a ClientContext, operation: RestOperation) -> Self {
        Self {
            context,
            operation,
            state: OperationState::NotStarted,
            retry: RetryState::default(),
        }
    }

    pub fn state(&self) -> OperationState {
        self.state
    }

    pub fn retry_state(&self) -> RetryState {
        self.retry
    }

    /// Run attempts until success, a non-retryable outcome, or the retry
    /// budget is spent.
    pub async fn execute(&mut self) -> Result<HttpResult> {
        if self.state != OperationState::NotStarted {
            return Err(Error::InvalidArgument(format!(
                "{} operation already executed",
                self.operation.operation_type
            )));
        }
        let op = self.operation.operation_type;
        debug!(operation = %op, auth = self.context.auth.name(), "First execution of REST operation");

        let mut result = loop {
            self.state = OperationState::Attempting;
            self.retry.attempts += 1;
            let attempt = self.retry.attempts;

            match self.attempt(attempt).await {
                Ok(AttemptOutcome::Done(result)) => break result,
                Ok(AttemptOutcome::Retry) => {
                    self.context
                        .metrics
                        .increment_counter(Statistic::RetriedRequests, 1);
                    let wait = self.context.retry_policy.retry_interval(attempt);
                    debug!(
                        operation = %op,
                        attempt,
                        last_status = ?self.retry.last_status,
                        wait_ms = wait.as_millis() as u64,
                        "Retrying REST operation"
                    );
                    tokio::time::sleep(wait).await;
                }
                Err(e) => {
                    self.state = OperationState::Failed;
                    return Err(e.with_attempts(attempt));
                }
            }
        };

        let expected = self.operation.expected_status == Some(result.status);
        if !result.is_success() && !expected {
            self.state = OperationState::Failed;
            return Err(Error::Http {
                operation: op,
                status: result.status,
                code: std::mem::take(&mut result.error_code),
                message: std::mem::take(&mut result.error_message),
                attempts: self.retry.attempts,
            });
        }

        self.state = OperationState::Succeeded;
        trace!(operation = %op, status = result.status, "REST operation complete");
        Ok(result)
    }

    async fn attempt(&mut self, attempt: u32) -> Result<AttemptOutcome> {
        let op = self.operation.operation_type;
        let policy = &self.context.retry_policy;
        let metrics = &self.context.metrics;

        let fastpath = op.is_fastpath();
        if fastpath {
            if self.context.fastpath.is_none() {
                return Err(Error::Config(format!("{op} needs a fastpath transport")));
            }
            if !self.context.auth.supports_fastpath() {
                return Err(Error::Config(format!(
                    "{op} needs bearer authentication, not {}",
                    self.context.auth.name()
                )));
            }
        }

        let mut request = self.operation.build_request();
        let mut request_id = uuid::Uuid::new_v4().to_string();
        if self.operation.rest_fallback {
            request_id.push_str(REST_FALLBACK_SUFFIX);
        }
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            request.headers.insert(CLIENT_REQUEST_ID, value);
        }

        if let Err(e) = self.context.auth.authorize(&mut request).await {
            if e.is_fatal_auth() {
                warn!(operation = %op, attempt, error = %e, "Auth provider gave up; not retrying");
                return Err(e);
            }
            self.retry.last_status = None;
            if policy.should_retry(attempt, None) {
                warn!(operation = %op, attempt, error = %e, "Auth failed; will retry");
                return Ok(AttemptOutcome::Retry);
            }
            return Err(e);
        }

        let bytes_sent = request.content_length();
        if !fastpath {
            metrics.increment_counter(Statistic::ConnectionsMade, 1);
            if request.body.is_some() {
                metrics.increment_counter(Statistic::SendRequests, 1);
                metrics.increment_counter(Statistic::BytesSent, bytes_sent);
            }
        }

        let started = Instant::now();
        let outcome = self.send(request).await;
        metrics.record_latency(op, started.elapsed());

        let response = match outcome {
            Ok(response) => response,
            Err(e) => {
                self.retry.last_status = None;
                if policy.should_retry(attempt, None) {
                    warn!(operation = %op, attempt, kind = %e.kind, error = %e.message, "HTTP request failed; will retry");
                    return Ok(AttemptOutcome::Retry);
                }
                debug!(operation = %op, attempt, error = %e, "HTTP request failed; retries exhausted");
                return Err(Error::Network {
                    operation: op,
                    kind: e.kind,
                    message: e.message,
                    attempts: attempt,
                });
            }
        };

        metrics.increment_counter(Statistic::GetResponses, 1);
        match response.status {
            200..=299 => {
                metrics.increment_counter(Statistic::BytesReceived, response.body.len() as u64)
            }
            429 => metrics.increment_counter(Statistic::Throttled, 1),
            503 => metrics.increment_counter(Statistic::ServerUnavailable, 1),
            _ => {}
        }

        let result = HttpResult::from_response(response, &self.operation.method, bytes_sent);
        self.retry.last_status = Some(result.status);
        debug!(
            operation = %op,
            attempt,
            status = result.status,
            request_id = %result.request_id,
            "HTTP request complete"
        );

        if self.operation.expected_status == Some(result.status) {
            return Ok(AttemptOutcome::Done(result));
        }
        if policy.should_retry(attempt, Some(result.status)) {
            return Ok(AttemptOutcome::Retry);
        }
        Ok(AttemptOutcome::Done(result))
    }

    async fn send(&self, request: HttpRequest) -> std::result::Result<HttpResponse, TransportError> {
        match &self.context.fastpath {
            Some(fastpath) if self.operation.operation_type.is_fastpath() => {
                fastpath
                    .send(FastpathRequest {
                        operation: self.operation.operation_type,
                        request,
                        handle: self.operation.fastpath_handle.clone(),
                    })
                    .await
            }
            _ => self.context.transport.send(request).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rest::auth::AuthType;
    use crate::rest::retry::RetryPolicy;
    use crate::rest::transport::HttpTransport;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::time::Duration;

    struct Statuses(Mutex<VecDeque<u16>>);

    #[async_trait]
    impl HttpTransport for Statuses {
        async fn send(&self, _request: HttpRequest) -> std::result::Result<HttpResponse, TransportError> {
            let status = self.0.lock().pop_front().unwrap_or(500);
            Ok(HttpResponse {
                status,
                headers: HeaderMap::new(),
                body: Bytes::new(),
            })
        }
    }

    fn context(statuses: &[u16]) -> ClientContext {
        let transport = Arc::new(Statuses(Mutex::new(statuses.iter().copied().collect())));
        let policy = RetryPolicy::new()
            .with_max_attempts(3)
            .with_min_backoff(Duration::from_millis(10))
            .with_max_backoff(Duration::from_millis(10))
            .with_delta_backoff(Duration::from_millis(10));
        ClientContext::new(transport, AuthType::Anonymous, policy)
    }

    fn read_op() -> RestOperation {
        let url = Url::parse("https://acct.example.net/fs/file").unwrap();
        RestOperation::new(OperationType::ReadFile, Method::GET, url)
    }

    #[tokio::test(start_paused = true)]
    async fn test_executor_reports_terminal_state_on_success() {
        let context = context(&[503, 206]);
        let mut executor = RestOperationExecutor::new(&context, read_op());
        assert_eq!(executor.state(), OperationState::NotStarted);

        let result = executor.execute().await.unwrap();
        assert_eq!(result.status, 206);
        assert_eq!(executor.state(), OperationState::Succeeded);
        assert_eq!(executor.retry_state().attempts, 2);
        assert_eq!(executor.retry_state().last_status, Some(206));

        // one execution per executor
        assert!(matches!(executor.execute().await, Err(Error::InvalidArgument(_))));
        assert_eq!(executor.retry_state().attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_executor_reports_terminal_state_on_failure() {
        let context = context(&[503, 503, 503]);
        let mut executor = RestOperationExecutor::new(&context, read_op());

        assert!(executor.execute().await.is_err());
        assert_eq!(executor.state(), OperationState::Failed);
        assert_eq!(executor.retry_state().attempts, 3);
        assert_eq!(executor.retry_state().last_status, Some(503));
    }

    #[tokio::test(start_paused = true)]
    async fn test_redirect_is_failure_not_success() {
        let context = context(&[302]);
        let mut executor = RestOperationExecutor::new(&context, read_op());

        let err = executor.execute().await.unwrap_err();
        assert_eq!(err.status(), Some(302));
        assert_eq!(executor.state(), OperationState::Failed);
        assert_eq!(executor.retry_state().attempts, 1);
    }

    #[tokio::test]
    async fn test_fastpath_needs_transport() {
        let context = context(&[200]);
        let url = Url::parse("https://acct.example.net/fs/file").unwrap();
        let op = RestOperation::new(OperationType::FastpathOpen, Method::GET, url);
        let mut executor = RestOperationExecutor::new(&context, op);

        assert!(matches!(executor.execute().await, Err(Error::Config(_))));
        assert_eq!(executor.state(), OperationState::Failed);
        assert_eq!(executor.retry_state().attempts, 1);
    }

    #[test]
    fn test_parse_nested_error_body() {
        let body = br#"{"error":{"code":"PathNotFound","message":"The specified path does not exist."}}"#;
        let (code, message) = parse_storage_error(404, body);
        assert_eq!(code, "PathNotFound");
        assert_eq!(message, "The specified path does not exist.");
    }

    #[test]
    fn test_parse_flat_error_body() {
        let body = br#"{"code":"ServerBusy","message":"slow down"}"#;
        let (code, message) = parse_storage_error(503, body);
        assert_eq!(code, "ServerBusy");
        assert_eq!(message, "slow down");
    }

    #[test]
    fn test_parse_non_json_error_body() {
        let (code, message) = parse_storage_error(502, b"<html>bad gateway</html>");
        assert_eq!(code, "");
        assert_eq!(message, "Bad Gateway");
    }

    #[test]
    fn test_operation_builder() {
        let url = Url::parse("https://acct.example.net/fs/file").unwrap();
        let op = RestOperation::new(OperationType::GetPathStatus, Method::HEAD, url)
            .with_expected_status(404);
        assert_eq!(op.operation_type(), OperationType::GetPathStatus);
        assert_eq!(op.method(), Method::HEAD);
        assert_eq!(op.build_request().content_length(), 0);
    }
}
