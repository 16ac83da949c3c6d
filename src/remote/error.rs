use thiserror::Error;

use crate::util::UrlValidationError;

/// Errors surfaced by a remote backend.
///
/// Every variant is safe to record against a single feed: none of them
/// implies that local state was modified.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// Network-level error (DNS, connection, TLS, truncated body, ...)
    #[error("Request failed: {0}")]
    Network(String),
    /// Request exceeded the 30-second timeout
    #[error("Request timed out")]
    Timeout,
    /// Credentials were rejected (HTTP 401/403)
    #[error("Authentication rejected by server")]
    Auth,
    /// The feed or entry no longer exists on the server
    #[error("Not found on server: {0}")]
    NotFound(String),
    /// Server returned 429 Too Many Requests
    #[error("Rate limited by server")]
    RateLimited { retry_after_secs: Option<u64> },
    /// HTTP response with a non-2xx status not covered above
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Body could not be decoded into the expected records
    #[error("Malformed response: {0}")]
    Malformed(String),
    /// Response body exceeded the 10MB size limit
    #[error("Response too large")]
    ResponseTooLarge,
    /// Feed URL rejected before any request was made
    #[error("Invalid feed URL: {0}")]
    InvalidUrl(#[from] UrlValidationError),
    /// The standalone backend's own store failed
    #[error("Local backend error: {0}")]
    Local(String),
}

impl RemoteError {
    /// Whether retrying the same call later may succeed.
    ///
    /// Network failures, timeouts, rate limiting and 5xx responses are
    /// transient; everything else fails the same way on every attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            RemoteError::Network(_) | RemoteError::Timeout | RemoteError::RateLimited { .. } => true,
            RemoteError::HttpStatus(status) => *status >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            RemoteError::Timeout
        } else if err.is_decode() {
            RemoteError::Malformed(err.to_string())
        } else {
            RemoteError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for RemoteError {
    fn from(err: serde_json::Error) -> Self {
        RemoteError::Malformed(err.to_string())
    }
}
