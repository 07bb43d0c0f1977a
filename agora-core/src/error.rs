//! Error type shared by every Agora service.
//!
//! A `ServiceError` carries a stable machine-readable code, an HTTP status,
//! and a human-readable message. Rendered to the wire it becomes the common
//! `{"error", "message", "details"}` envelope.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use thiserror::Error;

/// Main error type for service operations
#[derive(Error, Debug, Clone)]
#[error("{code}: {message}")]
pub struct ServiceError {
    /// Stable error code, e.g. `TASK_NOT_FOUND`
    pub code: String,
    /// Human-readable description
    pub message: String,
    /// HTTP status to surface
    pub status: u16,
    /// Structured context, `{}` when empty
    pub details: Value,
}

/// Result type alias for service operations
pub type ServiceResult<T> = Result<T, ServiceError>;

impl ServiceError {
    /// Create an error with an explicit code and status
    pub fn new<C: Into<String>, M: Into<String>>(code: C, message: M, status: u16) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            status,
            details: json!({}),
        }
    }

    /// Attach structured details
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    /// Create an `INVALID_JSON` 400 error
    pub fn invalid_json<M: Into<String>>(message: M) -> Self {
        Self::new("INVALID_JSON", message, 400)
    }

    /// Create an `INVALID_JWS` 400 error
    pub fn invalid_jws<M: Into<String>>(message: M) -> Self {
        Self::new("INVALID_JWS", message, 400)
    }

    /// Create an `INVALID_PAYLOAD` 400 error
    pub fn invalid_payload<M: Into<String>>(message: M) -> Self {
        Self::new("INVALID_PAYLOAD", message, 400)
    }

    /// Create a `FORBIDDEN` 403 error
    pub fn forbidden<M: Into<String>>(message: M) -> Self {
        Self::new("FORBIDDEN", message, 403)
    }

    /// Create a 404 error with the given code
    pub fn not_found<C: Into<String>, M: Into<String>>(code: C, message: M) -> Self {
        Self::new(code, message, 404)
    }

    /// Create a 409 conflict with the given code
    pub fn conflict<C: Into<String>, M: Into<String>>(code: C, message: M) -> Self {
        Self::new(code, message, 409)
    }

    /// Create a 502 dependency failure with the given code
    pub fn unavailable<C: Into<String>, M: Into<String>>(code: C, message: M) -> Self {
        Self::new(code, message, 502)
    }

    /// Create a generic `INTERNAL_ERROR` 500
    pub fn internal<M: Into<String>>(message: M) -> Self {
        Self::new("INTERNAL_ERROR", message, 500)
    }

    /// Create a `PAYLOAD_TOO_LARGE` 413 error
    pub fn payload_too_large() -> Self {
        Self::new(
            "PAYLOAD_TOO_LARGE",
            "Request body exceeds maximum allowed size",
            413,
        )
    }

    /// Create an `UNSUPPORTED_MEDIA_TYPE` 415 error
    pub fn unsupported_media_type<M: Into<String>>(message: M) -> Self {
        Self::new("UNSUPPORTED_MEDIA_TYPE", message, 415)
    }

    /// Create a `METHOD_NOT_ALLOWED` 405 error
    pub fn method_not_allowed() -> Self {
        Self::new("METHOD_NOT_ALLOWED", "Method not allowed", 405)
    }

    fn status_code(&self) -> StatusCode {
        StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = json!({
            "error": self.code,
            "message": self.message,
            "details": self.details,
        });
        (status, Json(body)).into_response()
    }
}

impl From<rusqlite::Error> for ServiceError {
    fn from(err: rusqlite::Error) -> Self {
        ServiceError::internal(format!("Database error: {err}"))
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        ServiceError::internal(format!("Serialization error: {err}"))
    }
}
