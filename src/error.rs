//! Process-wide error taxonomy.
//!
//! Every fallible path in the relay returns [`RelayError`]; the axum boundary
//! maps each variant to the HTTP status codes enumerated in the design notes
//! (config errors are fatal at startup and never reach this boundary).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

pub type RelayResult<T> = Result<T, RelayError>;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("configuration invalid: {0:?}")]
    ConfigInvalid(Vec<String>),

    #[error("upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    #[error("upstream returned {status}: {body}")]
    UpstreamStatus { status: u16, body: String },

    #[error("upstream response malformed: {0}")]
    UpstreamMalformed(String),

    #[error("authentication required")]
    AuthRequired,

    #[error("account is locked out until {retry_after_secs}s from now")]
    LockedOut { retry_after_secs: u64 },

    #[error("account disabled")]
    AccountDisabled,

    #[error("auth configuration unavailable")]
    AuthConfigUnavailable,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found")]
    NotFound,

    #[error("request timed out")]
    Timeout,

    #[error("internal error: {0}")]
    Internal(String),
}

impl RelayError {
    /// Transient failures the subscription retry loop and circuit breaker
    /// should count against the failure threshold; everything else is
    /// either a client mistake or a fatal startup condition.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RelayError::UpstreamUnreachable(_)
                | RelayError::UpstreamStatus { .. }
                | RelayError::Timeout
        )
    }
}

impl From<reqwest::Error> for RelayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            RelayError::Timeout
        } else {
            RelayError::UpstreamUnreachable(err.to_string())
        }
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::UpstreamMalformed(err.to_string())
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        match &self {
            RelayError::ConfigInvalid(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "config invalid").into_response()
            }
            RelayError::UpstreamUnreachable(_) | RelayError::Timeout => (
                StatusCode::GATEWAY_TIMEOUT,
                Json(json!({ "error": self.to_string() })),
            )
                .into_response(),
            RelayError::UpstreamStatus { status, .. } => (
                StatusCode::BAD_GATEWAY,
                Json(json!({ "error": self.to_string(), "upstreamStatus": status })),
            )
                .into_response(),
            RelayError::UpstreamMalformed(_) => (
                StatusCode::BAD_GATEWAY,
                Json(json!({ "error": self.to_string() })),
            )
                .into_response(),
            RelayError::AuthRequired => {
                let mut resp = StatusCode::UNAUTHORIZED.into_response();
                resp.headers_mut().insert(
                    axum::http::header::WWW_AUTHENTICATE,
                    "Basic realm=\"sitemap-relay\"".parse().unwrap(),
                );
                resp
            }
            RelayError::LockedOut { .. } => (
                StatusCode::TOO_MANY_REQUESTS,
                Json(json!({ "error": self.to_string() })),
            )
                .into_response(),
            // Intentionally opaque: an empty 500 body with no WWW-Authenticate
            // header, so a disabled account cannot be distinguished from a
            // generic server fault by an attacker probing usernames.
            RelayError::AccountDisabled | RelayError::AuthConfigUnavailable => {
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
            RelayError::BadRequest(_) => (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": self.to_string() })),
            )
                .into_response(),
            RelayError::Forbidden(_) => StatusCode::FORBIDDEN.into_response(),
            RelayError::NotFound => StatusCode::NOT_FOUND.into_response(),
            RelayError::Internal(msg) => {
                tracing::error!(error = %msg, "internal error");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_errors_are_retryable() {
        assert!(RelayError::UpstreamUnreachable("x".into()).is_retryable());
        assert!(RelayError::Timeout.is_retryable());
        assert!(RelayError::UpstreamStatus { status: 503, body: String::new() }.is_retryable());
    }

    #[test]
    fn client_errors_are_not_retryable() {
        assert!(!RelayError::BadRequest("x".into()).is_retryable());
        assert!(!RelayError::AccountDisabled.is_retryable());
    }
}
