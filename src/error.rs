use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// Registration of a document that already exists, without force_upload.
    /// Carries the existing document descriptor for the 409 body.
    #[error("Duplicate document: {doc_id}")]
    Duplicate {
        doc_id: String,
        existing: serde_json::Value,
    },

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Rate limit exceeded")]
    RateLimited { retry_after_s: u64 },

    /// A dependency (vector DB, converter, encoder service, LLM) is
    /// temporarily unavailable.  Retryable by the processor's backoff policy.
    #[error("Dependency unavailable: {0}")]
    Dependency(String),

    /// Ingestion queue is at capacity; the event source should retry later.
    #[error("Ingestion queue full")]
    QueueFull,

    /// A compressed sidecar failed its integrity check on decompress.
    #[error("Corrupted data: {0}")]
    Corrupted(String),

    #[error("Markdown exceeds maximum size ({0} bytes)")]
    MarkdownTooLarge(usize),

    /// Persistent encoder failure (e.g. OOM after the half-batch retry).
    /// Fatal for the job.
    #[error("Encoder error: {0}")]
    Encoder(String),

    /// Job was cancelled cooperatively.  Never surfaced over HTTP.
    #[error("Cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<reqwest::Error> for AppError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            AppError::Timeout(e.to_string())
        } else {
            AppError::Dependency(e.to_string())
        }
    }
}

impl AppError {
    /// Whether the processor may retry the failed operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::Dependency(_) | AppError::Timeout(_) | AppError::RateLimited { .. }
        )
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::InvalidInput(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            AppError::AccessDenied(_) => (StatusCode::FORBIDDEN, self.to_string()),
            AppError::Duplicate { .. } => (StatusCode::CONFLICT, self.to_string()),
            AppError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, self.to_string()),
            AppError::RateLimited { .. } => (StatusCode::TOO_MANY_REQUESTS, self.to_string()),
            AppError::Dependency(_) => (StatusCode::SERVICE_UNAVAILABLE, self.to_string()),
            AppError::QueueFull => (StatusCode::SERVICE_UNAVAILABLE, self.to_string()),
            AppError::Corrupted(_) => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
            AppError::MarkdownTooLarge(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            AppError::Encoder(_) => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
            AppError::Cancelled => (StatusCode::CONFLICT, self.to_string()),
            AppError::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
            AppError::Serde(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            AppError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            ),
        };

        let body = match &self {
            AppError::Duplicate { doc_id, existing } => json!({
                "error": message,
                "status": status.as_u16(),
                "doc_id": doc_id,
                "existing_doc": existing,
            }),
            _ => json!({
                "error": message,
                "status": status.as_u16(),
            }),
        };

        let mut response = (status, Json(body)).into_response();

        if let AppError::RateLimited { retry_after_s } = &self {
            if let Ok(value) = HeaderValue::from_str(&retry_after_s.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }

        response
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(AppError::Dependency("db down".into()).is_retryable());
        assert!(AppError::Timeout("parser".into()).is_retryable());
        assert!(AppError::RateLimited { retry_after_s: 2 }.is_retryable());
        assert!(!AppError::InvalidInput("bad".into()).is_retryable());
        assert!(!AppError::Encoder("oom".into()).is_retryable());
        assert!(!AppError::Cancelled.is_retryable());
    }

    #[test]
    fn rate_limited_sets_retry_after() {
        let resp = AppError::RateLimited { retry_after_s: 7 }.into_response();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            resp.headers().get(header::RETRY_AFTER).unwrap(),
            &HeaderValue::from_static("7")
        );
    }

    #[test]
    fn status_mapping() {
        assert_eq!(
            AppError::NotFound("x".into()).into_response().status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AppError::AccessDenied("x".into()).into_response().status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            AppError::QueueFull.into_response().status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            AppError::Timeout("x".into()).into_response().status(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }
}
