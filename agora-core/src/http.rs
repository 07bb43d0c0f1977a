//! Shared HTTP plumbing: JSON body parsing, token extraction, content-type
//! and body-size enforcement, and the common fallback handlers.

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderMap, Method};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::error::{ServiceError, ServiceResult};
use crate::time::to_iso;

/// Parse a request body as a JSON object
pub fn parse_json_body(body: &[u8]) -> ServiceResult<Map<String, Value>> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|_| ServiceError::invalid_json("Request body is not valid JSON"))?;
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(ServiceError::invalid_json(
            "Request body must be a JSON object",
        )),
    }
}

/// Extract a JWS token field from a parsed JSON body.
///
/// The field must exist, be a non-empty string, and look like a three-part
/// compact serialization.
pub fn extract_token(data: &Map<String, Value>, field: &str) -> ServiceResult<String> {
    let value = data
        .get(field)
        .ok_or_else(|| ServiceError::invalid_jws(format!("Missing required field: {field}")))?;
    let token = match value {
        Value::String(s) if !s.is_empty() => s,
        Value::String(_) => {
            return Err(ServiceError::invalid_jws(format!(
                "Field '{field}' must not be empty"
            )))
        }
        Value::Null => {
            return Err(ServiceError::invalid_jws(format!(
                "Field '{field}' must not be null"
            )))
        }
        _ => {
            return Err(ServiceError::invalid_jws(format!(
                "Field '{field}' must be a string"
            )))
        }
    };
    if token.split('.').count() != 3 {
        return Err(ServiceError::invalid_jws(
            "Token must be in JWS compact serialization format (header.payload.signature)",
        ));
    }
    Ok(token.clone())
}

/// Extract an optional bearer token from the `Authorization` header.
///
/// A missing header yields `Ok(None)`; a malformed one is `INVALID_JWS`.
pub fn bearer_token(headers: &HeaderMap) -> ServiceResult<Option<String>> {
    let Some(raw) = headers.get(AUTHORIZATION) else {
        return Ok(None);
    };
    let value = raw
        .to_str()
        .map_err(|_| ServiceError::invalid_jws("Authorization header is not valid ASCII"))?;
    let token = value.strip_prefix("Bearer ").ok_or_else(|| {
        ServiceError::invalid_jws("Authorization header must use Bearer scheme")
    })?;
    if token.is_empty() {
        return Err(ServiceError::invalid_jws("Bearer token must not be empty"));
    }
    Ok(Some(token.to_string()))
}

/// Require the payload's `action` field to equal the expected operation name
pub fn require_action(payload: &Map<String, Value>, expected: &str) -> ServiceResult<()> {
    let action = payload.get("action").and_then(Value::as_str);
    match action {
        Some(action) if action == expected => Ok(()),
        Some(action) => Err(ServiceError::invalid_payload(format!(
            "Expected action '{expected}', got '{action}'"
        ))),
        None => Err(ServiceError::invalid_payload(
            "JWS payload must include an 'action' field",
        )),
    }
}

/// Require the verified signer to be the platform agent
pub fn require_platform_signer(agent_id: &str, platform_agent_id: &str) -> ServiceResult<()> {
    if agent_id != platform_agent_id {
        return Err(ServiceError::forbidden(
            "Only the platform agent can perform this operation",
        ));
    }
    Ok(())
}

/// Fetch a required non-empty string field from a token payload
pub fn payload_str(payload: &Map<String, Value>, field: &str) -> ServiceResult<String> {
    match payload.get(field) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.clone()),
        _ => Err(ServiceError::invalid_payload(format!(
            "JWS payload must contain {field}"
        ))),
    }
}

/// Fetch a required integer field from a token payload
pub fn payload_i64(payload: &Map<String, Value>, field: &str) -> ServiceResult<i64> {
    payload
        .get(field)
        .and_then(Value::as_i64)
        .ok_or_else(|| {
            ServiceError::invalid_payload(format!("JWS payload must contain integer {field}"))
        })
}

/// Maximum request body size, attached as middleware state
#[derive(Debug, Clone, Copy)]
pub struct BodyLimit(pub usize);

/// Middleware for JSON endpoints: enforces `application/json` (415) and the
/// configured body-size cap (413), then replays the buffered body.
pub async fn validate_json_request(
    State(limit): State<BodyLimit>,
    req: Request,
    next: Next,
) -> Response {
    let method = req.method().clone();
    if method != Method::POST && method != Method::PUT && method != Method::PATCH {
        return next.run(req).await;
    }

    let content_type = req
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_ascii_lowercase();
    if !content_type.starts_with("application/json") {
        return ServiceError::unsupported_media_type("Content-Type must be application/json")
            .into_response();
    }

    let (parts, body) = req.into_parts();
    let bytes = match axum::body::to_bytes(body, limit.0).await {
        Ok(bytes) => bytes,
        Err(_) => return ServiceError::payload_too_large().into_response(),
    };

    next.run(Request::from_parts(parts, Body::from(bytes))).await
}

/// Middleware for the multipart upload endpoint: wrong content type is 415.
/// The body is not buffered here; file sizes are validated downstream where
/// individual parts are known.
pub async fn validate_multipart_request(req: Request, next: Next) -> Response {
    if *req.method() == Method::POST {
        let content_type = req
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase();
        if !content_type.is_empty() && !content_type.starts_with("multipart/form-data") {
            return ServiceError::unsupported_media_type(
                "Content-Type must be multipart/form-data",
            )
            .into_response();
        }
    }
    next.run(req).await
}

/// Per-route fallback for unsupported methods
pub async fn method_not_allowed() -> ServiceError {
    ServiceError::method_not_allowed()
}

/// Router fallback for unknown paths
pub async fn not_found() -> ServiceError {
    ServiceError::not_found("NOT_FOUND", "Resource not found")
}

/// Service start time, reported by every `/health` endpoint
#[derive(Debug, Clone, Copy)]
pub struct StartClock {
    started: DateTime<Utc>,
}

impl StartClock {
    pub fn now() -> Self {
        Self {
            started: Utc::now(),
        }
    }

    pub fn uptime_seconds(&self) -> f64 {
        (Utc::now() - self.started).num_milliseconds() as f64 / 1000.0
    }

    pub fn started_at(&self) -> String {
        to_iso(self.started)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn body_with(field: &str, value: Value) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert(field.to_string(), value);
        map
    }

    #[test]
    fn parse_rejects_non_objects() {
        assert_eq!(
            parse_json_body(b"[1,2]").unwrap_err().code,
            "INVALID_JSON"
        );
        assert_eq!(parse_json_body(b"{oops").unwrap_err().code, "INVALID_JSON");
    }

    #[test]
    fn extract_token_validates_shape() {
        let ok = body_with("token", json!("aaa.bbb.ccc"));
        assert_eq!(extract_token(&ok, "token").unwrap(), "aaa.bbb.ccc");

        for bad in [
            body_with("other", json!("aaa.bbb.ccc")),
            body_with("token", json!(null)),
            body_with("token", json!(42)),
            body_with("token", json!("")),
            body_with("token", json!("only.two")),
        ] {
            assert_eq!(extract_token(&bad, "token").unwrap_err().code, "INVALID_JWS");
        }
    }

    #[test]
    fn bearer_token_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers).unwrap(), None);

        headers.insert(AUTHORIZATION, "Bearer aaa.bbb.ccc".parse().unwrap());
        assert_eq!(bearer_token(&headers).unwrap().as_deref(), Some("aaa.bbb.ccc"));

        headers.insert(AUTHORIZATION, "Basic xyz".parse().unwrap());
        assert_eq!(bearer_token(&headers).unwrap_err().code, "INVALID_JWS");

        headers.insert(AUTHORIZATION, "Bearer ".parse().unwrap());
        assert_eq!(bearer_token(&headers).unwrap_err().code, "INVALID_JWS");
    }
}
