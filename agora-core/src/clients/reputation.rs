//! Client for the Reputation feedback sink (used by Court).

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::{ServiceError, ServiceResult};
use crate::jws::PlatformSigner;

#[async_trait]
pub trait ReputationClient: Send + Sync {
    /// Submit a platform-signed feedback record.
    ///
    /// A `FEEDBACK_EXISTS` conflict counts as success so that a retried
    /// ruling converges instead of failing on its own earlier progress.
    async fn record_feedback(&self, feedback: &Value) -> ServiceResult<()>;
}

pub struct HttpReputationClient {
    http: reqwest::Client,
    base_url: String,
    signer: Arc<PlatformSigner>,
}

impl HttpReputationClient {
    pub fn new(
        http: reqwest::Client,
        base_url: impl Into<String>,
        signer: Arc<PlatformSigner>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            signer,
        }
    }

    fn unavailable(message: &str) -> ServiceError {
        ServiceError::unavailable("REPUTATION_SERVICE_UNAVAILABLE", message)
    }
}

#[async_trait]
impl ReputationClient for HttpReputationClient {
    async fn record_feedback(&self, feedback: &Value) -> ServiceResult<()> {
        let token = self.signer.sign(feedback);
        let url = format!("{}/feedback", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&json!({ "token": token }))
            .send()
            .await
            .map_err(|_| Self::unavailable("Cannot reach Reputation service"))?;
        let status = response.status().as_u16();

        if status == 200 || status == 201 {
            return Ok(());
        }
        if status == 409 {
            let body: Value = response.json().await.unwrap_or(Value::Null);
            if body.get("error").and_then(Value::as_str) == Some("FEEDBACK_EXISTS") {
                return Ok(());
            }
        }
        Err(Self::unavailable(&format!(
            "Reputation service returned unexpected status {status}"
        )))
    }
}
