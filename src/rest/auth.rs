//! Request authentication.
//!
//! A client is configured with exactly one [`AuthType`]; the executor calls
//! [`AuthType::authorize`] once per physical attempt so every retry carries
//! fresh credentials (a new token or a new signature date).

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::Url;
use reqwest::header::{AUTHORIZATION, HeaderValue};
use sha2::Sha256;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use super::transport::HttpRequest;
use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// Service version sent with shared-key signed requests.
pub const SERVICE_VERSION: &str = "2019-12-12";

/// Bearer token with optional expiry.
#[derive(Debug, Clone)]
pub struct AccessToken {
    pub token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Supplies bearer tokens. Refresh and caching are the provider's business.
#[async_trait]
pub trait AccessTokenProvider: Send + Sync {
    async fn get_access_token(&self) -> Result<AccessToken>;
}

/// Provider returning a fixed token.
#[derive(Clone)]
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl AccessTokenProvider for StaticTokenProvider {
    async fn get_access_token(&self) -> Result<AccessToken> {
        Ok(AccessToken {
            token: self.token.clone(),
            expires_at: None,
        })
    }
}

/// Externally implemented token source plugged in by the user.
#[async_trait]
pub trait CustomTokenProvider: Send + Sync {
    async fn get_access_token(&self) -> anyhow::Result<String>;

    fn expiry_time(&self) -> Option<DateTime<Utc>> {
        None
    }
}

/// Wraps a [`CustomTokenProvider`] with its own linear retry loop.
///
/// Once the loop is exhausted the adapter returns a non-retryable
/// [`Error::Auth`]; the executor escalates it instead of retrying again.
pub struct CustomTokenProviderAdapter {
    adaptee: Arc<dyn CustomTokenProvider>,
    fetch_retry_count: u32,
    retry_delay: Duration,
}

impl CustomTokenProviderAdapter {
    pub fn new(adaptee: Arc<dyn CustomTokenProvider>, fetch_retry_count: u32) -> Self {
        Self {
            adaptee,
            fetch_retry_count,
            retry_delay: Duration::ZERO,
        }
    }

    /// Wait `delay * n` before the n-th retry.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }
}

#[async_trait]
impl AccessTokenProvider for CustomTokenProviderAdapter {
    async fn get_access_token(&self) -> Result<AccessToken> {
        debug!("Refreshing token from custom provider");

        let mut last_error = None;
        for retry in 0..=self.fetch_retry_count {
            if retry > 0 && !self.retry_delay.is_zero() {
                tokio::time::sleep(self.retry_delay * retry).await;
            }
            match self.adaptee.get_access_token().await {
                Ok(token) => {
                    trace!(retry, "Custom token fetch succeeded");
                    return Ok(AccessToken {
                        token,
                        expires_at: self.adaptee.expiry_time(),
                    });
                }
                Err(e) => {
                    debug!(retry, error = %e, "Custom token fetch failed");
                    last_error = Some(e);
                }
            }
        }

        let detail = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no attempt made".to_string());
        Err(Error::fatal_auth(format!(
            "custom token provider failed after {} attempt(s): {}",
            self.fetch_retry_count + 1,
            detail
        )))
    }
}

/// Account name plus decoded account key.
#[derive(Clone)]
pub struct SharedKeyCredentials {
    account: String,
    key: Vec<u8>,
}

impl SharedKeyCredentials {
    /// `key` is the base64 account key as issued by the service.
    pub fn new(account: impl Into<String>, key: &str) -> Result<Self> {
        let key = BASE64
            .decode(key.trim())
            .map_err(|e| Error::Config(format!("account key is not valid base64: {e}")))?;
        Ok(Self {
            account: account.into(),
            key,
        })
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    /// Sign `request` in place, adding `x-ms-date` and `x-ms-version` when
    /// the caller has not set them.
    pub fn sign_request(&self, request: &mut HttpRequest, content_length: u64) -> Result<()> {
        if !request.headers.contains_key("x-ms-date") {
            let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
            request
                .headers
                .insert("x-ms-date", header_value(&date)?);
        }
        if !request.headers.contains_key("x-ms-version") {
            request
                .headers
                .insert("x-ms-version", HeaderValue::from_static(SERVICE_VERSION));
        }

        let string_to_sign = self.string_to_sign(request, content_length);
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|e| Error::fatal_auth(format!("invalid account key: {e}")))?;
        mac.update(string_to_sign.as_bytes());
        let signature = BASE64.encode(mac.finalize().into_bytes());

        request.headers.insert(
            AUTHORIZATION,
            header_value(&format!("SharedKey {}:{}", self.account, signature))?,
        );
        Ok(())
    }

    pub(crate) fn string_to_sign(&self, request: &HttpRequest, content_length: u64) -> String {
        let header = |name: &str| {
            request
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string()
        };
        let length = if content_length > 0 {
            content_length.to_string()
        } else {
            String::new()
        };

        let mut out = String::new();
        out.push_str(request.method.as_str());
        out.push('\n');
        for value in [
            header("content-encoding"),
            header("content-language"),
            length,
            header("content-md5"),
            header("content-type"),
            header("date"),
            header("if-modified-since"),
            header("if-match"),
            header("if-none-match"),
            header("if-unmodified-since"),
            header("range"),
        ] {
            out.push_str(&value);
            out.push('\n');
        }

        let mut ms_headers: Vec<(String, String)> = request
            .headers
            .iter()
            .filter(|(name, _)| name.as_str().starts_with("x-ms-"))
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    value.to_str().unwrap_or("").trim().to_string(),
                )
            })
            .collect();
        ms_headers.sort();
        for (name, value) in ms_headers {
            out.push_str(&name);
            out.push(':');
            out.push_str(&value);
            out.push('\n');
        }

        out.push_str(&self.canonical_resource(&request.url));
        out
    }

    fn canonical_resource(&self, url: &Url) -> String {
        let mut out = format!("/{}{}", self.account, url.path());

        let mut params: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, value) in url.query_pairs() {
            params
                .entry(name.to_lowercase())
                .or_default()
                .push(value.into_owned());
        }
        for (name, mut values) in params {
            values.sort();
            out.push('\n');
            out.push_str(&name);
            out.push(':');
            out.push_str(&values.join(","));
        }
        out
    }
}

/// Authentication mechanism of a client.
#[derive(Clone)]
pub enum AuthType {
    /// No credentials; for public objects.
    Anonymous,
    /// OAuth bearer token.
    Bearer(Arc<dyn AccessTokenProvider>),
    /// Bearer token from a user-supplied provider with its own retry loop.
    Custom(Arc<CustomTokenProviderAdapter>),
    /// Request signed with the account key.
    SharedKey(SharedKeyCredentials),
    /// Pre-signed query token.
    Sas(String),
}

impl AuthType {
    pub fn name(&self) -> &'static str {
        match self {
            AuthType::Anonymous => "anonymous",
            AuthType::Bearer(_) => "bearer",
            AuthType::Custom(_) => "custom",
            AuthType::SharedKey(_) => "shared-key",
            AuthType::Sas(_) => "sas",
        }
    }

    /// Fastpath connections only carry bearer tokens.
    pub fn supports_fastpath(&self) -> bool {
        matches!(self, AuthType::Bearer(_) | AuthType::Custom(_))
    }

    /// Attach credentials for one attempt.
    pub async fn authorize(&self, request: &mut HttpRequest) -> Result<()> {
        match self {
            AuthType::Anonymous => Ok(()),
            AuthType::Bearer(provider) => {
                let token = provider.get_access_token().await?;
                set_bearer(request, &token.token)
            }
            AuthType::Custom(adapter) => {
                let token = adapter.get_access_token().await?;
                set_bearer(request, &token.token)
            }
            AuthType::SharedKey(credentials) => {
                let length = request.content_length();
                credentials.sign_request(request, length)
            }
            AuthType::Sas(token) => {
                append_sas_token(&mut request.url, token);
                Ok(())
            }
        }
    }
}

impl fmt::Debug for AuthType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthType::SharedKey(c) => write!(f, "SharedKey({})", c.account),
            other => f.write_str(other.name()),
        }
    }
}

fn set_bearer(request: &mut HttpRequest, token: &str) -> Result<()> {
    request
        .headers
        .insert(AUTHORIZATION, header_value(&format!("Bearer {token}"))?);
    Ok(())
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| Error::fatal_auth(format!("credential is not a valid header value: {e}")))
}

/// Append a SAS token to the query string unless it is already there.
pub(crate) fn append_sas_token(url: &mut Url, token: &str) {
    let token = token.trim_start_matches('?');
    if token.is_empty() {
        return;
    }
    let query = match url.query() {
        Some(q) if q.contains(token) => return,
        Some(q) if !q.is_empty() => format!("{q}&{token}"),
        _ => token.to_string(),
    };
    url.set_query(Some(&query));
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use reqwest::Method;
    use reqwest::header::HeaderMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyProvider {
        calls: AtomicU32,
        failures: u32,
    }

    #[async_trait]
    impl CustomTokenProvider for FlakyProvider {
        async fn get_access_token(&self) -> anyhow::Result<String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                anyhow::bail!("token endpoint unavailable ({n})");
            }
            Ok("custom-token".to_string())
        }
    }

    fn request(method: Method, url: &str) -> HttpRequest {
        HttpRequest {
            method,
            url: Url::parse(url).unwrap(),
            headers: HeaderMap::new(),
            body: None,
        }
    }

    #[tokio::test]
    async fn test_custom_adapter_exhausts_inner_retries_then_fatal() {
        let provider = Arc::new(FlakyProvider {
            calls: AtomicU32::new(0),
            failures: u32::MAX,
        });
        let adapter = CustomTokenProviderAdapter::new(provider.clone(), 2);

        let err = adapter.get_access_token().await.unwrap_err();
        assert!(err.is_fatal_auth());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_custom_adapter_recovers_within_budget() {
        let provider = Arc::new(FlakyProvider {
            calls: AtomicU32::new(0),
            failures: 2,
        });
        let adapter = CustomTokenProviderAdapter::new(provider.clone(), 3);

        let token = adapter.get_access_token().await.unwrap();
        assert_eq!(token.token, "custom-token");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_bearer_sets_authorization_header() {
        let auth = AuthType::Bearer(Arc::new(StaticTokenProvider::new("abc")));
        let mut req = request(Method::GET, "https://acct.example.net/fs/file");
        auth.authorize(&mut req).await.unwrap();
        assert_eq!(req.headers.get(AUTHORIZATION).unwrap(), "Bearer abc");
    }

    #[tokio::test]
    async fn test_sas_token_appended_once() {
        let auth = AuthType::Sas("?sv=2020-02-10&sig=abc".to_string());
        let mut req = request(Method::GET, "https://acct.example.net/fs/file?resource=file");
        auth.authorize(&mut req).await.unwrap();
        auth.authorize(&mut req).await.unwrap();
        assert_eq!(req.url.query(), Some("resource=file&sv=2020-02-10&sig=abc"));
        assert!(req.headers.get(AUTHORIZATION).is_none());
    }

    #[test]
    fn test_shared_key_string_to_sign() {
        let creds = SharedKeyCredentials::new("acct", "c2VjcmV0LWtleQ==").unwrap();
        let mut req = request(
            Method::PATCH,
            "https://acct.example.net/fs/dir/file?position=0&action=append",
        );
        req.headers
            .insert("x-ms-date", HeaderValue::from_static("Mon, 01 Jan 2024 00:00:00 GMT"));
        req.headers
            .insert("x-ms-version", HeaderValue::from_static(SERVICE_VERSION));
        req.headers.insert("range", HeaderValue::from_static("bytes=0-9"));
        req.body = Some(Bytes::from_static(b"0123456789"));

        let expected = "PATCH\n\n\n10\n\n\n\n\n\n\n\nbytes=0-9\n\
                        x-ms-date:Mon, 01 Jan 2024 00:00:00 GMT\n\
                        x-ms-version:2019-12-12\n\
                        /acct/fs/dir/file\naction:append\nposition:0";
        assert_eq!(creds.string_to_sign(&req, 10), expected);
    }

    #[test]
    fn test_shared_key_signature_is_deterministic() {
        let creds = SharedKeyCredentials::new("acct", "c2VjcmV0LWtleQ==").unwrap();
        let mut req = request(Method::GET, "https://acct.example.net/fs/file");
        req.headers
            .insert("x-ms-date", HeaderValue::from_static("Mon, 01 Jan 2024 00:00:00 GMT"));

        let mut again = req.clone();
        creds.sign_request(&mut req, 0).unwrap();
        creds.sign_request(&mut again, 0).unwrap();

        let auth = req.headers.get(AUTHORIZATION).unwrap().to_str().unwrap();
        assert!(auth.starts_with("SharedKey acct:"));
        assert_eq!(req.headers.get(AUTHORIZATION), again.headers.get(AUTHORIZATION));
        assert_eq!(req.headers.get("x-ms-version").unwrap(), SERVICE_VERSION);
    }

    #[test]
    fn test_shared_key_rejects_bad_key() {
        assert!(SharedKeyCredentials::new("acct", "not base64 !!").is_err());
    }
}
