use futures::StreamExt;
use serde::de::DeserializeOwned;
use std::time::Duration;

use super::error::RemoteError;

pub(crate) const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub(crate) const MAX_BODY_SIZE: usize = 10 * 1024 * 1024; // 10MB

/// Send a request with the 30-second timeout and map the response status
/// onto [`RemoteError`].
///
/// - 401/403 -> `Auth`
/// - 404 -> `NotFound`
/// - 429 -> `RateLimited` (with `Retry-After` seconds when present)
/// - other non-2xx -> `HttpStatus`
pub(crate) async fn send(request: reqwest::RequestBuilder) -> Result<reqwest::Response, RemoteError> {
    let response = tokio::time::timeout(REQUEST_TIMEOUT, request.send())
        .await
        .map_err(|_| RemoteError::Timeout)??;

    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    tracing::debug!(url = %response.url(), status = %status, "Remote returned error status");

    Err(match status {
        reqwest::StatusCode::UNAUTHORIZED | reqwest::StatusCode::FORBIDDEN => RemoteError::Auth,
        reqwest::StatusCode::NOT_FOUND => RemoteError::NotFound(response.url().path().to_string()),
        reqwest::StatusCode::TOO_MANY_REQUESTS => RemoteError::RateLimited {
            retry_after_secs: response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse().ok()),
        },
        other => RemoteError::HttpStatus(other.as_u16()),
    })
}

/// Read a JSON body (size-limited) into `T`.
pub(crate) async fn read_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, RemoteError> {
    let bytes = read_limited_bytes(response, MAX_BODY_SIZE).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Read a response body, refusing anything over `limit` bytes and
/// reporting truncated downloads as network errors.
pub(crate) async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, RemoteError> {
    let expected_length = response.content_length();

    // Fast path: check Content-Length header
    if let Some(len) = expected_length {
        if len as usize > limit {
            return Err(RemoteError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(RemoteError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    // EDGE-005: fewer bytes than Content-Length means the connection dropped
    if let Some(expected) = expected_length {
        if (bytes.len() as u64) < expected {
            return Err(RemoteError::Network(format!(
                "incomplete response: expected {} bytes, received {}",
                expected,
                bytes.len()
            )));
        }
    }

    Ok(bytes)
}

/// Join a configured server base URL and an API path without doubling slashes.
pub(crate) fn join(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}
