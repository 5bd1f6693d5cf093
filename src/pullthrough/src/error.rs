use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProxyError>;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Registry error: {0}")]
    Registry(String),

    /// Upstream adapter could not be built or reached
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid manifest: {0}")]
    Manifest(String),

    #[error("Quota exceeded: {0}")]
    Quota(String),

    #[error("Too many requests: {0}")]
    TooManyRequests(String),

    #[error("Shared store error: {0}")]
    Store(#[from] redis::RedisError),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Job service error: {0}")]
    JobService(#[from] jobmonitor::MonitorError),
}

impl ProxyError {
    pub fn is_not_found(&self) -> bool {
        match self {
            ProxyError::NotFound(_) => true,
            ProxyError::JobService(e) => e.is_not_found(),
            _ => false,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::NotFound(_) => StatusCode::NOT_FOUND,
            ProxyError::BadRequest(_) | ProxyError::Manifest(_) => StatusCode::BAD_REQUEST,
            ProxyError::Quota(_) => StatusCode::FORBIDDEN,
            ProxyError::TooManyRequests(_) => StatusCode::TOO_MANY_REQUESTS,
            ProxyError::Http(_) | ProxyError::UpstreamUnavailable(_) | ProxyError::Registry(_) => {
                StatusCode::BAD_GATEWAY
            }
            ProxyError::JobService(e) => StatusCode::from_u16(e.status_code())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Error code used in the distribution error envelope
    pub fn error_code(&self) -> &'static str {
        match self {
            ProxyError::NotFound(_) => "NOT_FOUND",
            ProxyError::BadRequest(_) => "BAD_REQUEST",
            ProxyError::Manifest(_) => "MANIFEST_INVALID",
            ProxyError::Quota(_) => "DENIED",
            ProxyError::TooManyRequests(_) => "TOOMANYREQUESTS",
            ProxyError::Http(_) | ProxyError::UpstreamUnavailable(_) | ProxyError::Registry(_) => {
                "UPSTREAM_ERROR"
            }
            ProxyError::JobService(e) => e.code(),
            _ => "UNKNOWN",
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, status = %status, "Request failed");
        } else {
            tracing::debug!(error = %self, status = %status, "Request rejected");
        }
        let body = json!({
            "errors": [{
                "code": self.error_code(),
                "message": self.to_string(),
            }]
        });
        (status, Json(body)).into_response()
    }
}
