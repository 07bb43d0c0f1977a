//! Client for the Identity service's JWS verification endpoint.

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::error::{ServiceError, ServiceResult};

use super::propagate_envelope;

/// Result of a successful JWS verification
#[derive(Debug, Clone)]
pub struct VerifiedToken {
    /// The agent referenced by the token's `kid` header
    pub agent_id: String,
    /// Decoded token payload
    pub payload: Map<String, Value>,
}

impl VerifiedToken {
    /// Fetch a required string field from the payload
    pub fn payload_str(&self, field: &str) -> Option<&str> {
        self.payload.get(field).and_then(Value::as_str)
    }
}

/// Verification of signed requests, centralized at Identity
#[async_trait]
pub trait IdentityClient: Send + Sync {
    /// Verify a compact JWS token.
    ///
    /// An invalid signature is `FORBIDDEN` 403 at the caller; an unreachable
    /// Identity service is `IDENTITY_SERVICE_UNAVAILABLE` 502; Identity's own
    /// 4xx envelopes (`INVALID_JWS`, `AGENT_NOT_FOUND`) propagate verbatim.
    async fn verify_jws(&self, token: &str) -> ServiceResult<VerifiedToken>;
}

pub struct HttpIdentityClient {
    http: reqwest::Client,
    base_url: String,
}

impl HttpIdentityClient {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    fn unavailable() -> ServiceError {
        ServiceError::unavailable(
            "IDENTITY_SERVICE_UNAVAILABLE",
            "Cannot reach Identity service",
        )
    }
}

#[async_trait]
impl IdentityClient for HttpIdentityClient {
    async fn verify_jws(&self, token: &str) -> ServiceResult<VerifiedToken> {
        let url = format!("{}/agents/verify-jws", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&json!({ "token": token }))
            .send()
            .await
            .map_err(|_| Self::unavailable())?;

        let status = response.status().as_u16();
        let body: Value = response.json().await.map_err(|_| Self::unavailable())?;

        if status != 200 {
            return Err(propagate_envelope(
                status,
                &body,
                "IDENTITY_SERVICE_UNAVAILABLE",
                "Identity service returned an unexpected response",
            ));
        }

        match body.get("valid").and_then(Value::as_bool) {
            Some(true) => {}
            Some(false) => {
                return Err(ServiceError::forbidden(
                    "JWS signature verification failed",
                ))
            }
            None => return Err(Self::unavailable()),
        }

        let agent_id = body
            .get("agent_id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .ok_or_else(Self::unavailable)?
            .to_string();
        let payload = body
            .get("payload")
            .and_then(Value::as_object)
            .cloned()
            .ok_or_else(Self::unavailable)?;

        Ok(VerifiedToken { agent_id, payload })
    }
}
