//! Error surface shared by the HTTP transport and the queue coordinator.
//!
//! Four kinds are distinguished: retryable transport failures (network,
//! timeout, unparseable body), retryable API errors (5xx, rate limit),
//! benign not-found responses that callers see as `None`, and fatal
//! programmer errors that surface immediately.

use thiserror::Error;

/// Error types the remote service reports on a 404 that callers should see
/// as "absent" rather than as a failure.
const BENIGN_NOT_FOUND_KINDS: &[&str] = &["record-not-found", "record-or-token-not-found"];

// ---------------------------------------------------------------------------
// API error
// ---------------------------------------------------------------------------

/// A non-2xx response from the remote service, after retries were exhausted
/// or for a status that is not retried at all.
#[derive(Debug, Clone, Error)]
#[error("API error {status_code} ({kind}) after {attempt} attempt(s): {message}")]
pub struct ApiError {
    /// HTTP status code of the final response.
    pub status_code: u16,
    /// Machine-readable error type reported by the service.
    pub kind: String,
    /// Human-readable message reported by the service.
    pub message: String,
    /// Attempt number (1-based) on which this response was received.
    pub attempt: u32,
}

impl ApiError {
    /// Whether the transport layer should retry the call with backoff.
    pub fn is_retryable(&self) -> bool {
        self.status_code >= 500 || self.status_code == 429
    }

    /// Whether this is a 404 the coordinator translates to `None`.
    pub fn is_benign_not_found(&self) -> bool {
        self.status_code == 404 && BENIGN_NOT_FOUND_KINDS.contains(&self.kind.as_str())
    }
}

// ---------------------------------------------------------------------------
// Client error
// ---------------------------------------------------------------------------

/// Programmer error.  Never retried, surfaced before any side effect.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

pub(crate) fn invalid_argument(message: impl Into<String>) -> anyhow::Error {
    anyhow::Error::new(ClientError::InvalidArgument(message.into()))
}

// ---------------------------------------------------------------------------
// Not-found translation
// ---------------------------------------------------------------------------

/// Translate a benign not-found [`ApiError`] into `Ok(None)`; re-raise
/// anything else.
pub fn benign_not_found_to_none<T>(result: anyhow::Result<T>) -> anyhow::Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(err) => match err.downcast_ref::<ApiError>() {
            Some(api) if api.is_benign_not_found() => Ok(None),
            _ => Err(err),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(status_code: u16, kind: &str) -> ApiError {
        ApiError {
            status_code,
            kind: kind.to_string(),
            message: "boom".to_string(),
            attempt: 1,
        }
    }

    // ── Retryability ────────────────────────────────────────────────────

    #[test]
    fn server_errors_and_rate_limits_are_retryable() {
        assert!(api_error(500, "internal-error").is_retryable());
        assert!(api_error(503, "service-unavailable").is_retryable());
        assert!(api_error(429, "rate-limit-exceeded").is_retryable());
    }

    #[test]
    fn client_errors_are_not_retryable() {
        assert!(!api_error(400, "invalid-request").is_retryable());
        assert!(!api_error(404, "record-not-found").is_retryable());
    }

    // ── Not-found translation ───────────────────────────────────────────

    #[test]
    fn benign_not_found_becomes_none() {
        let result: anyhow::Result<u32> = Err(api_error(404, "record-not-found").into());
        assert!(benign_not_found_to_none(result).unwrap().is_none());

        let result: anyhow::Result<u32> = Err(api_error(404, "record-or-token-not-found").into());
        assert!(benign_not_found_to_none(result).unwrap().is_none());
    }

    #[test]
    fn other_not_found_kinds_are_reraised() {
        let result: anyhow::Result<u32> = Err(api_error(404, "actor-not-found").into());
        assert!(benign_not_found_to_none(result).is_err());
    }

    #[test]
    fn success_passes_through() {
        let result: anyhow::Result<u32> = Ok(7);
        assert_eq!(benign_not_found_to_none(result).unwrap(), Some(7));
    }
}
