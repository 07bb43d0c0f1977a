//! Client for Central Bank escrow operations.
//!
//! Two authorization shapes: `lock_escrow` forwards a poster-signed token
//! untouched (the Bank verifies it independently via Identity), while
//! release and split are signed here with the platform key — only the
//! platform may move escrowed funds.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::{ServiceError, ServiceResult};
use crate::jws::PlatformSigner;

use super::propagate_envelope;

/// Escrow row returned by the Bank on lock
#[derive(Debug, Clone)]
pub struct EscrowReceipt {
    pub escrow_id: String,
    pub task_id: String,
    pub amount: i64,
    pub status: String,
}

/// Escrow motion against the Central Bank ledger
#[async_trait]
pub trait CentralBankClient: Send + Sync {
    /// Forward a poster-signed `escrow_lock` token
    async fn lock_escrow(&self, escrow_token: &str) -> ServiceResult<EscrowReceipt>;

    /// Release the full escrow amount to one recipient (platform-signed)
    async fn release_escrow(
        &self,
        escrow_id: &str,
        recipient_account_id: &str,
    ) -> ServiceResult<()>;

    /// Split the escrow between worker and poster (platform-signed)
    async fn split_escrow(
        &self,
        escrow_id: &str,
        worker_account_id: &str,
        poster_account_id: &str,
        worker_pct: i64,
    ) -> ServiceResult<()>;
}

pub struct HttpCentralBankClient {
    http: reqwest::Client,
    base_url: String,
    signer: Arc<PlatformSigner>,
}

impl HttpCentralBankClient {
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
        ServiceError::unavailable("CENTRAL_BANK_UNAVAILABLE", message)
    }

    async fn post_token(&self, path: &str, token: String) -> ServiceResult<(u16, Value)> {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&json!({ "token": token }))
            .send()
            .await
            .map_err(|_| Self::unavailable("Cannot connect to Central Bank"))?;
        let status = response.status().as_u16();
        let body: Value = response
            .json()
            .await
            .map_err(|_| Self::unavailable("Central Bank returned a malformed response"))?;
        Ok((status, body))
    }
}

#[async_trait]
impl CentralBankClient for HttpCentralBankClient {
    async fn lock_escrow(&self, escrow_token: &str) -> ServiceResult<EscrowReceipt> {
        let (status, body) = self
            .post_token("/escrow/lock", escrow_token.to_string())
            .await?;

        if status == 200 || status == 201 {
            let escrow_id = body.get("escrow_id").and_then(Value::as_str);
            let task_id = body.get("task_id").and_then(Value::as_str);
            let amount = body.get("amount").and_then(Value::as_i64);
            let escrow_status = body.get("status").and_then(Value::as_str);
            return match (escrow_id, task_id, amount, escrow_status) {
                (Some(escrow_id), Some(task_id), Some(amount), Some(escrow_status)) => {
                    Ok(EscrowReceipt {
                        escrow_id: escrow_id.to_string(),
                        task_id: task_id.to_string(),
                        amount,
                        status: escrow_status.to_string(),
                    })
                }
                _ => Err(Self::unavailable(
                    "Central Bank returned a malformed escrow receipt",
                )),
            };
        }

        if (400..500).contains(&status) {
            return Err(propagate_envelope(
                status,
                &body,
                "CENTRAL_BANK_UNAVAILABLE",
                "Central Bank rejected the escrow lock",
            ));
        }
        tracing::warn!(status, "unexpected Central Bank status on escrow lock");
        Err(Self::unavailable(
            "Central Bank returned an unexpected status on escrow lock",
        ))
    }

    async fn release_escrow(
        &self,
        escrow_id: &str,
        recipient_account_id: &str,
    ) -> ServiceResult<()> {
        let token = self.signer.sign(&json!({
            "action": "escrow_release",
            "escrow_id": escrow_id,
            "recipient_account_id": recipient_account_id,
        }));
        let (status, body) = self
            .post_token(&format!("/escrow/{escrow_id}/release"), token)
            .await?;

        if (200..300).contains(&status) {
            return Ok(());
        }
        if (400..500).contains(&status) {
            return Err(propagate_envelope(
                status,
                &body,
                "CENTRAL_BANK_UNAVAILABLE",
                "Central Bank rejected the escrow release",
            ));
        }
        tracing::warn!(status, escrow_id, "unexpected Central Bank status on escrow release");
        Err(Self::unavailable(
            "Central Bank returned an unexpected status on escrow release",
        ))
    }

    async fn split_escrow(
        &self,
        escrow_id: &str,
        worker_account_id: &str,
        poster_account_id: &str,
        worker_pct: i64,
    ) -> ServiceResult<()> {
        let token = self.signer.sign(&json!({
            "action": "escrow_split",
            "escrow_id": escrow_id,
            "worker_account_id": worker_account_id,
            "poster_account_id": poster_account_id,
            "worker_pct": worker_pct,
        }));
        let (status, body) = self
            .post_token(&format!("/escrow/{escrow_id}/split"), token)
            .await?;

        if (200..300).contains(&status) {
            return Ok(());
        }
        if (400..500).contains(&status) {
            return Err(propagate_envelope(
                status,
                &body,
                "CENTRAL_BANK_UNAVAILABLE",
                "Central Bank rejected the escrow split",
            ));
        }
        tracing::warn!(status, escrow_id, "unexpected Central Bank status on escrow split");
        Err(Self::unavailable(
            "Central Bank returned an unexpected status on escrow split",
        ))
    }
}
