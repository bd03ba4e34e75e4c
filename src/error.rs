//! # Error Types and Handling
//!
//! `ThrottlerError` is a closed sum type over the error kinds the rest of
//! the crate needs to distinguish: a caller-facing [`ThrottlerError::Validation`]
//! that is never retried and never counted against the circuit breaker, a
//! [`ThrottlerError::Transport`] error from the store connection that is
//! retriable, a synthetic [`ThrottlerError::BreakerOpen`] raised once the
//! circuit breaker has tripped, a [`ThrottlerError::Store`] error returned
//! by a script itself (treated like transport for retry purposes), and a
//! [`ThrottlerError::Config`] error raised only while building a `Throttler`.
//!
//! ## Error to HTTP Status Mapping
//!
//! | Variant        | HTTP Status              |
//! |----------------|---------------------------|
//! | `Validation`   | 400 Bad Request           |
//! | `BreakerOpen`  | 503 Service Unavailable   |
//! | `Transport`    | 502 Bad Gateway           |
//! | `Store`        | 500 Internal Server Error |
//! | `Config`       | 500 Internal Server Error |

use axum::{http::StatusCode, response::IntoResponse, response::Response, Json};
use thiserror::Error;

/// Stable numeric codes for validation failures.
pub mod validation_code {
    pub const MISSING_TYPE: u16 = 101;
    pub const UNKNOWN_TYPE: u16 = 102;
    pub const MISSING_KEY: u16 = 103;
    pub const BAD_CONFIG_OVERRIDE: u16 = 104;
    pub const BAD_COUNT: u16 = 105;
    pub const ALREADY_CLOSED: u16 = 106;
}

/// All errors that can cross a public `Throttler`/`RateLimiter` boundary.
#[derive(Debug, Clone, Error)]
pub enum ThrottlerError {
    /// Caller input was invalid: unknown bucket type, missing key, a
    /// malformed `config_override`, or a `count` outside the accepted
    /// shape. Never retried, never counted against the circuit breaker.
    #[error("validation error ({code}): {message}")]
    Validation { code: u16, message: String },

    /// The store connection failed, a command timed out, or a node
    /// reported an error. Retriable, counted against the circuit breaker.
    #[error("transport error: {0}")]
    Transport(String),

    /// Raised by the resilience wrapper while the circuit breaker is open.
    /// Not retried, not counted.
    #[error("circuit breaker is open")]
    BreakerOpen,

    /// The store executed a script but it returned something the driver
    /// couldn't interpret. Treated as transport for retry purposes.
    #[error("store error: {0}")]
    Store(String),

    /// Construction-time configuration problem: missing `uri`/`nodes`,
    /// missing `buckets`, a bad regex, a non-parseable `until` timestamp.
    #[error("configuration error: {0}")]
    Config(String),
}

impl ThrottlerError {
    pub fn validation(code: u16, message: impl Into<String>) -> Self {
        ThrottlerError::Validation { code, message: message.into() }
    }

    /// True for errors the resilience wrapper should retry and count
    /// against the circuit breaker.
    pub fn is_retriable(&self) -> bool {
        matches!(self, ThrottlerError::Transport(_) | ThrottlerError::Store(_))
    }
}

impl From<redis::RedisError> for ThrottlerError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
            ThrottlerError::Transport(err.to_string())
        } else {
            ThrottlerError::Store(err.to_string())
        }
    }
}

impl From<serde_json::Error> for ThrottlerError {
    fn from(err: serde_json::Error) -> Self {
        ThrottlerError::validation(validation_code::BAD_CONFIG_OVERRIDE, err.to_string())
    }
}

impl IntoResponse for ThrottlerError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            ThrottlerError::Validation { code, message } => {
                (StatusCode::BAD_REQUEST, Some(*code), message.clone())
            }
            ThrottlerError::BreakerOpen => (StatusCode::SERVICE_UNAVAILABLE, None, self.to_string()),
            ThrottlerError::Transport(_) => (StatusCode::BAD_GATEWAY, None, self.to_string()),
            ThrottlerError::Store(_) | ThrottlerError::Config(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, None, self.to_string())
            }
        };

        let body = serde_json::json!({
            "error": status.canonical_reason().unwrap_or("error"),
            "code": code,
            "message": message,
        });

        (status, Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, ThrottlerError>;
