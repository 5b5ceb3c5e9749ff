use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// Stable error codes surfaced in the response envelope.
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    RateLimited { retry_after_seconds: u64 },
    QueueFull,
    SchemaInvalid(String),
    BackendOffline(String),
    Internal(String),
}

#[derive(Serialize)]
struct ErrorBody {
    status: &'static str,
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

impl ApiError {
    fn parts(&self) -> (StatusCode, &'static str, String, Option<serde_json::Value>) {
        match self {
            ApiError::NotFound(what) => (
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                format!("{} not found", what),
                None,
            ),
            ApiError::RateLimited {
                retry_after_seconds,
            } => (
                StatusCode::TOO_MANY_REQUESTS,
                "RATE_LIMITED",
                "rate limit exceeded".to_string(),
                Some(serde_json::json!({ "retryAfter": retry_after_seconds })),
            ),
            ApiError::QueueFull => (
                StatusCode::SERVICE_UNAVAILABLE,
                "QUEUE_FULL",
                "job queue is at capacity".to_string(),
                None,
            ),
            ApiError::SchemaInvalid(msg) => (
                StatusCode::BAD_REQUEST,
                "SCHEMA_INVALID",
                msg.clone(),
                None,
            ),
            ApiError::BackendOffline(msg) => (
                StatusCode::BAD_GATEWAY,
                "BACKEND_OFFLINE",
                msg.clone(),
                None,
            ),
            // 5xx is reserved for unexpected internal errors
            ApiError::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL",
                msg.clone(),
                None,
            ),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message, details) = self.parts();
        if status.is_server_error() {
            tracing::error!(code, %message, "internal error surfaced to client");
        }
        (
            status,
            Json(ErrorBody {
                status: "error",
                error: ErrorDetail {
                    code,
                    message,
                    details,
                },
            }),
        )
            .into_response()
    }
}

impl From<engram_runtime::Error> for ApiError {
    fn from(err: engram_runtime::Error) -> Self {
        match err {
            engram_runtime::Error::Index(engram_index::Error::QueueFull { .. }) => {
                ApiError::QueueFull
            }
            engram_runtime::Error::Embedding(msg) => ApiError::BackendOffline(msg),
            engram_runtime::Error::Analyzer(e) => ApiError::BackendOffline(e.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<engram_index::Error> for ApiError {
    fn from(err: engram_index::Error) -> Self {
        match err {
            engram_index::Error::QueueFull { .. } => ApiError::QueueFull,
            engram_index::Error::Query(msg) => ApiError::SchemaInvalid(msg),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

/// Success envelope: `{status: "success", data}`.
pub fn success<T: Serialize>(data: T) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "success",
        "data": data,
    }))
}

pub type ApiResult = std::result::Result<Json<serde_json::Value>, ApiError>;
