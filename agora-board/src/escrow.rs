//! Escrow coordination for task lifecycle transitions.
//!
//! Deadline-driven transitions follow "transition first, credit on retry":
//! the status flip is durable even when the Bank is down, and the money
//! movement is retried on the next read via the `escrow_pending` flag.
//! Releases are idempotent at the Bank, so at-least-once delivery here
//! yields at most one effective credit.

use std::sync::Arc;

use agora_core::clients::CentralBankClient;
use agora_core::db::blocking;
use agora_core::error::{ServiceError, ServiceResult};

use crate::store::{Task, TaskStatus, TaskStore};

pub struct EscrowCoordinator {
    bank: Arc<dyn CentralBankClient>,
    store: Arc<TaskStore>,
}

impl EscrowCoordinator {
    pub fn new(bank: Arc<dyn CentralBankClient>, store: Arc<TaskStore>) -> Self {
        Self { bank, store }
    }

    /// Release escrow to a recipient via the Central Bank.
    ///
    /// `ESCROW_ALREADY_RESOLVED` counts as success: it means an earlier
    /// at-least-once attempt already landed. Transport failures surface as
    /// `CENTRAL_BANK_UNAVAILABLE`.
    pub async fn release(&self, escrow_id: &str, recipient_id: &str) -> ServiceResult<()> {
        match self.bank.release_escrow(escrow_id, recipient_id).await {
            Ok(()) => Ok(()),
            Err(err) if err.code == "ESCROW_ALREADY_RESOLVED" => Ok(()),
            Err(err) if err.status >= 500 => Err(ServiceError::unavailable(
                "CENTRAL_BANK_UNAVAILABLE",
                "Central Bank escrow release failed",
            )),
            Err(err) => Err(err),
        }
    }

    /// Best-effort release after a deadline transition. Never raises: on
    /// success `escrow_pending` is cleared, on failure it stays set for the
    /// next read to retry.
    pub async fn try_release(&self, task_id: &str, escrow_id: &str, recipient_id: &str) {
        match self.release(escrow_id, recipient_id).await {
            Ok(()) => {
                let store = self.store.clone();
                let task_id = task_id.to_string();
                let _ = blocking(move || store.set_escrow_pending(&task_id, false)).await;
            }
            Err(err) => {
                tracing::warn!(
                    task_id,
                    escrow_id,
                    error = %err,
                    "escrow release failed during deadline evaluation, marking pending"
                );
                let store = self.store.clone();
                let task_id = task_id.to_string();
                let _ = blocking(move || store.set_escrow_pending(&task_id, true)).await;
            }
        }
    }

    /// Retry the pending release recorded on a terminal task, if any.
    ///
    /// The recipient is derived from the terminal status: `expired` returns
    /// the funds to the poster, `approved` pays the worker.
    pub async fn retry_pending(&self, task: Task) -> ServiceResult<Task> {
        if !task.escrow_pending {
            return Ok(task);
        }
        let recipient = match task.status {
            TaskStatus::Expired | TaskStatus::Cancelled => task.poster_id.clone(),
            TaskStatus::Approved => match &task.worker_id {
                Some(worker_id) => worker_id.clone(),
                None => return Ok(task),
            },
            _ => return Ok(task),
        };

        match self.release(&task.escrow_id, &recipient).await {
            Ok(()) => {
                let store = self.store.clone();
                let task_id = task.task_id.clone();
                blocking(move || store.set_escrow_pending(&task_id, false)).await?;
                Ok(Task {
                    escrow_pending: false,
                    ..task
                })
            }
            Err(err) => {
                tracing::warn!(task_id = task.task_id, error = %err, "pending escrow release retry failed");
                Ok(task)
            }
        }
    }
}
