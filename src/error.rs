use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{LocalId, SendFailure};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OutboxError {
    #[error("outbox message not found: {0}")]
    NotFound(LocalId),

    #[error("invalid state transition for {id} from {from} to {to}")]
    InvalidStateTransition {
        id: LocalId,
        from: &'static str,
        to: &'static str,
    },

    #[error("validation error: {0}")]
    Validation(String),

    #[error("config error: {0}")]
    Config(String),
}

/// How the engine treats a failed delivery attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureCategory {
    /// Network trouble, timeouts, server-side errors. Retried with backoff.
    Retryable,
    /// The server rejected the request itself (HTTP 4xx). Terminal.
    ClientError,
    /// Anything outside the API protocol. Terminal.
    Unexpected,
}

impl FailureCategory {
    pub const fn is_retryable(self) -> bool {
        matches!(self, FailureCategory::Retryable)
    }
}

/// Failure reported by a [`crate::transport::MessageTransport`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("API error {http_status} ({code}): {message}")]
    Api {
        http_status: u16,
        code: String,
        message: String,
    },

    #[error("network error: {0}")]
    Network(String),

    #[error("timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl TransportError {
    pub fn api(http_status: u16, code: impl Into<String>, message: impl Into<String>) -> Self {
        TransportError::Api {
            http_status,
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn category(&self) -> FailureCategory {
        match self {
            TransportError::Api { http_status, .. } if (400..=499).contains(http_status) => {
                FailureCategory::ClientError
            }
            TransportError::Api { .. }
            | TransportError::Network(_)
            | TransportError::Timeout { .. } => FailureCategory::Retryable,
            TransportError::Unexpected(_) => FailureCategory::Unexpected,
        }
    }
}

impl From<&TransportError> for SendFailure {
    fn from(err: &TransportError) -> Self {
        match err {
            TransportError::Api {
                http_status,
                code,
                message,
            } => SendFailure::new(Some(*http_status), Some(code.clone()), message.clone()),
            other => SendFailure::new(None, None, other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_errors_are_4xx_only() {
        assert_eq!(
            TransportError::api(400, "BAD_REQUEST", "no").category(),
            FailureCategory::ClientError
        );
        assert_eq!(
            TransportError::api(429, "RATE_LIMIT_HIT", "slow down").category(),
            FailureCategory::ClientError
        );
        assert_eq!(
            TransportError::api(500, "SERVER_ERROR", "oops").category(),
            FailureCategory::Retryable
        );
        assert_eq!(
            TransportError::api(399, "ODD", "odd").category(),
            FailureCategory::Retryable
        );
    }

    #[test]
    fn test_transport_level_failures_are_retryable() {
        assert!(TransportError::Network("reset".into()).category().is_retryable());
        assert!(TransportError::Timeout { timeout_ms: 30_000 }
            .category()
            .is_retryable());
        assert_eq!(
            TransportError::Unexpected("bad json".into()).category(),
            FailureCategory::Unexpected
        );
    }

    #[test]
    fn test_error_display() {
        let err = OutboxError::InvalidStateTransition {
            id: LocalId(42),
            from: "client_error",
            to: "queued",
        };
        assert_eq!(
            err.to_string(),
            "invalid state transition for 42 from client_error to queued"
        );
    }

    #[test]
    fn test_failure_details_from_transport_error() {
        let failure = SendFailure::from(&TransportError::api(400, "STREAM_NOT_FOUND", "no such stream"));
        assert_eq!(failure.http_status, Some(400));
        assert_eq!(failure.api_code.as_deref(), Some("STREAM_NOT_FOUND"));
        assert_eq!(failure.text, "no such stream");

        let failure = SendFailure::from(&TransportError::Network("connection reset".into()));
        assert_eq!(failure.http_status, None);
        assert_eq!(failure.text, "network error: connection reset");
    }
}
