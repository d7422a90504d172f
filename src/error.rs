//! Error types for Outpost
//!
//! All errors in the engine are converted to `EngineError`, which
//! implements `IntoResponse` so the interception proxy can answer with a
//! proper HTTP error body.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Classification of a replay failure.
///
/// Transient failures (transport errors, 5xx, timeouts) consume a retry
/// attempt and stay queued up to the ceiling. Permanent failures (4xx
/// validation rejections) are dropped immediately with a surfaced error
/// instead of silently exhausting the retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Transient,
    Permanent,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Permanent => "permanent",
        }
    }

    /// Classify an HTTP status from the upstream backend.
    ///
    /// 408 and 429 are server-side pushback, not payload problems, so
    /// they stay retryable.
    pub fn from_status(status: reqwest::StatusCode) -> Self {
        if status.is_client_error()
            && status != reqwest::StatusCode::REQUEST_TIMEOUT
            && status != reqwest::StatusCode::TOO_MANY_REQUESTS
        {
            Self::Permanent
        } else {
            Self::Transient
        }
    }
}

/// Engine-wide error type
#[derive(Debug, Error)]
pub enum EngineError {
    /// The durable store failed to open. Components degrade to
    /// read-empty/write-no-op rather than raising this to end users.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// A single store read/write failed (500)
    #[error("Transaction failure: {0}")]
    Transaction(#[from] sqlx::Error),

    /// The upstream backend rejected a replayed operation (502)
    #[error("Replay failure ({}): {message}", kind.as_str())]
    Replay {
        kind: FailureKind,
        /// HTTP status from the upstream, if the request got that far
        status: Option<u16>,
        message: String,
    },

    /// HTTP client error (502)
    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// Validation error (400)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Configuration error (500)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error (500)
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    /// Build a replay failure from an upstream HTTP status.
    pub fn replay_status(status: reqwest::StatusCode, context: &str) -> Self {
        Self::Replay {
            kind: FailureKind::from_status(status),
            status: Some(status.as_u16()),
            message: format!("{context}: upstream answered HTTP {status}"),
        }
    }

    /// Build a replay failure from a transport error (always transient).
    pub fn replay_transport(error: reqwest::Error, context: &str) -> Self {
        Self::Replay {
            kind: FailureKind::Transient,
            status: None,
            message: format!("{context}: {error}"),
        }
    }

    /// Whether a failed replay should stay queued for another pass.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Replay { kind, .. } => *kind == FailureKind::Transient,
            // Anything that never reached the wire is worth retrying.
            Self::HttpClient(_) | Self::Transaction(_) | Self::StoreUnavailable(_) => true,
            _ => false,
        }
    }
}

impl From<config::ConfigError> for EngineError {
    fn from(err: config::ConfigError) -> Self {
        EngineError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Validation(format!("Malformed payload: {err}"))
    }
}

impl IntoResponse for EngineError {
    /// Convert error to HTTP response
    ///
    /// Maps each error variant to appropriate HTTP status code
    /// and JSON error body.
    fn into_response(self) -> Response {
        use axum::Json;

        let (status, error_message, error_type) = match &self {
            EngineError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone(), "validation"),
            EngineError::Replay { message, .. } => {
                (StatusCode::BAD_GATEWAY, message.clone(), "replay")
            }
            EngineError::HttpClient(_) => {
                (StatusCode::BAD_GATEWAY, self.to_string(), "http_client")
            }
            EngineError::StoreUnavailable(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Store unavailable".to_string(),
                "store_unavailable",
            ),
            EngineError::Transaction(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Store error".to_string(),
                "transaction",
            ),
            EngineError::Config(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone(), "config"),
            EngineError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal error".to_string(),
                "internal",
            ),
        };

        // Record error metric
        use crate::metrics::ERRORS_TOTAL;
        ERRORS_TOTAL.with_label_values(&[error_type]).inc();

        let body = Json(serde_json::json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

/// Result type alias using EngineError
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_rejections_classify_as_permanent() {
        assert_eq!(
            FailureKind::from_status(reqwest::StatusCode::UNPROCESSABLE_ENTITY),
            FailureKind::Permanent
        );
        assert_eq!(
            FailureKind::from_status(reqwest::StatusCode::BAD_REQUEST),
            FailureKind::Permanent
        );
    }

    #[test]
    fn server_errors_and_pushback_classify_as_transient() {
        for status in [
            reqwest::StatusCode::INTERNAL_SERVER_ERROR,
            reqwest::StatusCode::BAD_GATEWAY,
            reqwest::StatusCode::REQUEST_TIMEOUT,
            reqwest::StatusCode::TOO_MANY_REQUESTS,
        ] {
            assert_eq!(FailureKind::from_status(status), FailureKind::Transient);
        }
    }

    #[test]
    fn permanent_replay_failures_are_not_retryable() {
        let error = EngineError::Replay {
            kind: FailureKind::Permanent,
            status: Some(422),
            message: "rejected".to_string(),
        };
        assert!(!error.is_retryable());

        let error = EngineError::Replay {
            kind: FailureKind::Transient,
            status: Some(503),
            message: "down".to_string(),
        };
        assert!(error.is_retryable());
    }
}
