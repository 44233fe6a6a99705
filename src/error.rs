//! Error types for the relay gateway.
//!
//! [`RelayError`] is the single error type that crosses the HTTP boundary.
//! It implements [`IntoResponse`] to render the OpenAI-shaped error
//! envelope `{"error": {"message", "type", "param", "code"}}`.

use axum::{http::StatusCode, response::IntoResponse, response::Response, Json};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("{0}")]
    InvalidRequest(String),

    #[error("{0}")]
    Authentication(String),

    #[error("{0}")]
    Permission(String),

    #[error("insufficient quota")]
    InsufficientQuota,

    #[error("rate limited")]
    RateLimited,

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("not implemented")]
    NotImplemented,

    #[error("no channel available for group {group} and model {model}")]
    NoChannelAvailable { group: String, model: String },

    #[error("all retries exhausted: {0}")]
    RetriesExhausted(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, RelayError>;

impl RelayError {
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::InvalidRequest(_) => "invalid_request_error",
            RelayError::Authentication(_) => "authentication_error",
            RelayError::Permission(_) => "permission_error",
            RelayError::InsufficientQuota => "insufficient_quota",
            RelayError::RateLimited => "rate_limited",
            RelayError::Upstream(_) => "upstream_error",
            RelayError::NotImplemented => "not_implemented",
            RelayError::NoChannelAvailable { .. } => "upstream_error",
            RelayError::RetriesExhausted(_) => "upstream_error",
            RelayError::Database(_) => "internal_error",
            RelayError::Transport(_) => "upstream_error",
            RelayError::Internal(_) => "internal_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            RelayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            RelayError::Authentication(_) => StatusCode::UNAUTHORIZED,
            RelayError::Permission(_) => StatusCode::FORBIDDEN,
            RelayError::InsufficientQuota => StatusCode::FORBIDDEN,
            RelayError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            RelayError::Upstream(_) => StatusCode::BAD_GATEWAY,
            RelayError::NotImplemented => StatusCode::NOT_IMPLEMENTED,
            RelayError::NoChannelAvailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            RelayError::RetriesExhausted(_) => StatusCode::BAD_GATEWAY,
            RelayError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            RelayError::Transport(_) => StatusCode::BAD_GATEWAY,
            RelayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Appends the request id to the client-visible message, as the
    /// retry controller does once all attempts are exhausted.
    pub fn with_request_id(self, request_id: &str) -> Self {
        let msg = format!("{self} (request id: {request_id})");
        match self {
            RelayError::RetriesExhausted(_) => RelayError::RetriesExhausted(msg),
            RelayError::Upstream(_) => RelayError::Upstream(msg),
            other => other,
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(json!({
            "error": {
                "message": self.to_string(),
                "type": self.kind(),
                "param": serde_json::Value::Null,
                "code": serde_json::Value::Null,
            }
        }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insufficient_quota_maps_to_forbidden() {
        let err = RelayError::InsufficientQuota;
        assert_eq!(err.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(err.kind(), "insufficient_quota");
    }

    #[test]
    fn rate_limited_maps_to_429() {
        assert_eq!(RelayError::RateLimited.status_code(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn with_request_id_appends_only_to_retry_exhaustion() {
        let err = RelayError::RetriesExhausted("boom".to_string()).with_request_id("req-1");
        assert!(err.to_string().contains("req-1"));
        let err = RelayError::InsufficientQuota.with_request_id("req-1");
        assert!(!err.to_string().contains("req-1"));
    }
}
