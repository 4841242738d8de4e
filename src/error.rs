//! Error types for remote range reads.
//!
//! Every failure a caller can observe is one of these variants. Errors are
//! `Clone` because a failed read-ahead buffer keeps its failure and hands a
//! copy to each reader whose range depends on it.

use thiserror::Error;

use crate::rest::OperationType;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Connection-level failure kinds reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkErrorKind {
    /// Host name could not be resolved
    UnknownHost,
    /// TCP/TLS connection could not be established
    Connect,
    /// Request or response timed out
    Timeout,
    /// Response body could not be read completely
    Body,
    /// Anything else the transport reports
    Other,
}

impl std::fmt::Display for NetworkErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NetworkErrorKind::UnknownHost => "unknown host",
            NetworkErrorKind::Connect => "connect",
            NetworkErrorKind::Timeout => "timeout",
            NetworkErrorKind::Body => "body",
            NetworkErrorKind::Other => "other",
        };
        f.write_str(s)
    }
}

/// Errors that can occur while talking to the remote store
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// The service answered with a status >= 400 and retries were exhausted
    /// or the status was not retryable.
    #[error(
        "{operation} failed with HTTP {status} ({code}): {message} [attempts: {attempts}]"
    )]
    Http {
        operation: OperationType,
        status: u16,
        code: String,
        message: String,
        attempts: u32,
    },

    /// No HTTP response was obtained
    #[error("{operation} failed with {kind} error: {message} [attempts: {attempts}]")]
    Network {
        operation: OperationType,
        kind: NetworkErrorKind,
        message: String,
        attempts: u32,
    },

    /// Credential acquisition or request signing failed
    #[error("authentication failed: {message} [attempts: {attempts}]")]
    Auth {
        message: String,
        retryable: bool,
        attempts: u32,
    },

    /// A read-ahead fill ended abnormally
    #[error("read-ahead worker failed: {0}")]
    ReadAheadWorker(String),

    /// Operation on a stream that was already closed
    #[error("stream {0} is closed")]
    StreamClosed(u64),

    /// Caller passed an argument outside the valid range
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration rejected by validation
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Build an auth error for a provider failure the executor may retry.
    pub fn auth(message: impl Into<String>) -> Self {
        Error::Auth {
            message: message.into(),
            retryable: true,
            attempts: 0,
        }
    }

    /// Build an auth error whose provider already gave up.
    pub fn fatal_auth(message: impl Into<String>) -> Self {
        Error::Auth {
            message: message.into(),
            retryable: false,
            attempts: 0,
        }
    }

    /// HTTP status carried by the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Number of physical attempts made before the error surfaced.
    pub fn attempts(&self) -> Option<u32> {
        match self {
            Error::Http { attempts, .. }
            | Error::Network { attempts, .. }
            | Error::Auth { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }

    /// Whether the auth layer reported it already exhausted its own policy.
    pub fn is_fatal_auth(&self) -> bool {
        matches!(
            self,
            Error::Auth {
                retryable: false,
                ..
            }
        )
    }

    pub(crate) fn with_attempts(mut self, n: u32) -> Self {
        if let Error::Http { attempts, .. }
        | Error::Network { attempts, .. }
        | Error::Auth { attempts, .. } = &mut self
        {
            *attempts = n;
        }
        self
    }
}
