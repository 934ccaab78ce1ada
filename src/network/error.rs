use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    #[error("Authentication failed ({code}): {message}")]
    AuthenticationFailed { code: u16, message: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Post rejected ({code}): {message}")]
    PostRejected { code: u16, message: String },

    #[error("Article not found: {0}")]
    ArticleNotFound(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("No pooled session available for {server} within {waited:?}")]
    CheckoutTimeout { server: String, waited: Duration },

    #[error("Connection pool is closed")]
    PoolClosed,

    #[error("No server available")]
    NoServerAvailable,

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Coarse failure classes used for retry decisions and reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Connection,
    Authentication,
    Protocol,
    PostRejected,
    NotFound,
    Timeout,
    Pool,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Connection => "connection",
            ErrorKind::Authentication => "authentication",
            ErrorKind::Protocol => "protocol",
            ErrorKind::PostRejected => "post_rejected",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Pool => "pool",
        }
    }
}

impl NetworkError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            NetworkError::ConnectionFailed(_)
            | NetworkError::ConnectionClosed(_)
            | NetworkError::Tls(_)
            | NetworkError::IoError(_) => ErrorKind::Connection,
            NetworkError::AuthenticationFailed { .. } => ErrorKind::Authentication,
            NetworkError::Protocol(_) | NetworkError::InvalidAddress(_) => ErrorKind::Protocol,
            NetworkError::PostRejected { .. } => ErrorKind::PostRejected,
            NetworkError::ArticleNotFound(_) => ErrorKind::NotFound,
            NetworkError::Timeout(_) => ErrorKind::Timeout,
            NetworkError::CheckoutTimeout { .. }
            | NetworkError::PoolClosed
            | NetworkError::NoServerAvailable => ErrorKind::Pool,
        }
    }

    /// Transport-level failures are retried; malformed data, bad credentials
    /// and missing articles are not.
    pub fn is_retryable(&self) -> bool {
        match self.kind() {
            ErrorKind::Connection
            | ErrorKind::PostRejected
            | ErrorKind::Timeout
            | ErrorKind::Pool => !matches!(self, NetworkError::PoolClosed),
            ErrorKind::Authentication | ErrorKind::Protocol | ErrorKind::NotFound => false,
        }
    }

    /// Whether the session that produced this error may be reused.
    pub fn breaks_session(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Connection | ErrorKind::Timeout | ErrorKind::Protocol
        )
    }
}

pub type NetworkResult<T> = Result<T, NetworkError>;
