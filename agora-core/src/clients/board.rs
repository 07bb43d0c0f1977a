//! Client for Task Board lookups and ruling notifications (used by Court).

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::error::{ServiceError, ServiceResult};
use crate::jws::PlatformSigner;

use super::propagate_envelope;

#[async_trait]
pub trait TaskBoardClient: Send + Sync {
    /// Fetch a task record (spec, deliverables, escrow id, parties)
    async fn get_task(&self, task_id: &str) -> ServiceResult<Map<String, Value>>;

    /// Record a Court ruling on the task (platform-signed)
    async fn record_ruling(&self, task_id: &str, ruling: &Value) -> ServiceResult<()>;
}

pub struct HttpTaskBoardClient {
    http: reqwest::Client,
    base_url: String,
    signer: Arc<PlatformSigner>,
}

impl HttpTaskBoardClient {
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
        ServiceError::unavailable("TASK_BOARD_UNAVAILABLE", message)
    }
}

#[async_trait]
impl TaskBoardClient for HttpTaskBoardClient {
    async fn get_task(&self, task_id: &str) -> ServiceResult<Map<String, Value>> {
        let url = format!("{}/tasks/{task_id}", self.base_url);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|_| Self::unavailable("Cannot reach Task Board service"))?;
        let status = response.status().as_u16();

        if status == 404 {
            return Err(ServiceError::not_found("TASK_NOT_FOUND", "Task not found"));
        }
        if status != 200 {
            tracing::warn!(status, task_id, "unexpected Task Board status on task fetch");
            return Err(Self::unavailable(
                "Task Board returned an unexpected status",
            ));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|_| Self::unavailable("Task Board returned a malformed task response"))?;
        match body {
            Value::Object(map) => Ok(map),
            _ => Err(Self::unavailable(
                "Task Board returned a malformed task response",
            )),
        }
    }

    async fn record_ruling(&self, task_id: &str, ruling: &Value) -> ServiceResult<()> {
        let token = self.signer.sign(ruling);
        let url = format!("{}/tasks/{task_id}/ruling", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&json!({ "token": token }))
            .send()
            .await
            .map_err(|_| Self::unavailable("Cannot reach Task Board service"))?;
        let status = response.status().as_u16();

        if (200..300).contains(&status) {
            return Ok(());
        }
        if (400..500).contains(&status) {
            let body: Value = response
                .json()
                .await
                .map_err(|_| Self::unavailable("Task Board returned a malformed response"))?;
            return Err(propagate_envelope(
                status,
                &body,
                "TASK_BOARD_UNAVAILABLE",
                "Task Board rejected the ruling record",
            ));
        }
        Err(Self::unavailable(
            "Task Board returned an unexpected status on ruling record",
        ))
    }
}
