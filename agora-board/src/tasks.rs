//! Task lifecycle coordination.
//!
//! The manager validates the signed request, re-evaluates deadlines, checks
//! status before role (a stale caller learns the real state, not a
//! misleading 403), performs any Bank side effect, and only then flips the
//! status through the store's compare-and-set.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use agora_core::clients::{CentralBankClient, VerifiedToken};
use agora_core::db::blocking;
use agora_core::error::{ServiceError, ServiceResult};
use agora_core::http::{payload_i64, payload_str, require_platform_signer};
use agora_core::time::now_iso;

use crate::deadline::DeadlineEvaluator;
use crate::escrow::EscrowCoordinator;
use crate::store::{Bid, Task, TaskFilter, TaskStatus, TaskStore};
use crate::tokens::TokenValidator;

/// Field length caps applied at task creation and dispute filing
#[derive(Debug, Clone)]
pub struct Limits {
    pub max_title_length: usize,
    pub max_spec_length: usize,
    pub max_reason_length: usize,
}

/// Task as presented over HTTP: the stored row plus the deliverable index
/// the Court feeds to its judges.
#[derive(Debug, Serialize)]
pub struct TaskView {
    #[serde(flatten)]
    pub task: Task,
    pub deliverables: Vec<String>,
}

pub struct TaskManager {
    store: Arc<TaskStore>,
    tokens: Arc<TokenValidator>,
    bank: Arc<dyn CentralBankClient>,
    escrow: Arc<EscrowCoordinator>,
    deadlines: Arc<DeadlineEvaluator>,
    platform_agent_id: String,
    limits: Limits,
}

impl TaskManager {
    pub fn new(
        store: Arc<TaskStore>,
        tokens: Arc<TokenValidator>,
        bank: Arc<dyn CentralBankClient>,
        escrow: Arc<EscrowCoordinator>,
        deadlines: Arc<DeadlineEvaluator>,
        platform_agent_id: String,
        limits: Limits,
    ) -> Self {
        Self {
            store,
            tokens,
            bank,
            escrow,
            deadlines,
            platform_agent_id,
            limits,
        }
    }

    /// Create a task with escrow (two-token protocol).
    ///
    /// The poster signs both tokens. The task token is verified here; the
    /// escrow token is only decoded for cross-validation and forwarded raw
    /// to the Bank, which verifies it independently. The task row exists
    /// only if the Bank confirmed the lock.
    pub async fn create_task(
        &self,
        task_token: &str,
        escrow_token: &str,
    ) -> ServiceResult<TaskView> {
        let verified = self.tokens.validate(task_token, "create_task").await?;
        let payload = &verified.payload;

        let task_id = payload_str(payload, "task_id")?;
        let poster_id = payload_str(payload, "poster_id")?;
        if verified.agent_id != poster_id {
            return Err(ServiceError::forbidden(
                "Task token must be signed by the poster",
            ));
        }
        let title = payload_str(payload, "title")?;
        let spec = payload_str(payload, "spec")?;
        let reward = payload_i64(payload, "reward")?;
        let bidding = payload_i64(payload, "bidding_deadline_seconds")?;
        let execution = payload_i64(payload, "execution_deadline_seconds")?;
        let review = payload_i64(payload, "review_deadline_seconds")?;

        if reward < 1 {
            return Err(ServiceError::invalid_payload("reward must be at least 1"));
        }
        for (name, value) in [
            ("bidding_deadline_seconds", bidding),
            ("execution_deadline_seconds", execution),
            ("review_deadline_seconds", review),
        ] {
            if value < 1 {
                return Err(ServiceError::invalid_payload(format!(
                    "{name} must be at least 1"
                )));
            }
        }
        if title.len() > self.limits.max_title_length {
            return Err(ServiceError::invalid_payload("title exceeds maximum length"));
        }
        if spec.len() > self.limits.max_spec_length {
            return Err(ServiceError::invalid_payload("spec exceeds maximum length"));
        }

        {
            let store = self.store.clone();
            let task_id = task_id.clone();
            if blocking(move || store.get_task(&task_id)).await?.is_some() {
                return Err(ServiceError::conflict("TASK_EXISTS", "Task already exists"));
            }
        }

        // Cross-validate the escrow token payload without verifying it.
        let escrow_payload = TokenValidator::decode_escrow_payload(escrow_token)?;
        let escrow_task_id = escrow_payload.get("task_id").and_then(Value::as_str);
        let escrow_amount = escrow_payload.get("amount").and_then(Value::as_i64);
        if escrow_task_id != Some(task_id.as_str()) || escrow_amount != Some(reward) {
            return Err(ServiceError::new(
                "TOKEN_MISMATCH",
                "Escrow token task_id/amount does not match the task token",
                400,
            ));
        }

        let receipt = self.bank.lock_escrow(escrow_token).await?;

        let task = Task::new_open(
            task_id,
            poster_id,
            title,
            spec,
            reward,
            bidding,
            execution,
            review,
            receipt.escrow_id,
        );
        {
            let store = self.store.clone();
            let row = task.clone();
            blocking(move || store.insert_task(&row)).await?;
        }
        self.view(task).await
    }

    /// Submit a sealed bid on an open task
    pub async fn submit_bid(&self, task_id: &str, token: &str) -> ServiceResult<Bid> {
        let verified = self.tokens.validate(token, "submit_bid").await?;
        let bidder_id = payload_str(&verified.payload, "bidder_id")?;
        if verified.agent_id != bidder_id {
            return Err(ServiceError::forbidden(
                "Bid must be signed by the bidder",
            ));
        }
        let amount = payload_i64(&verified.payload, "amount")?;

        let task = self.load_evaluated(task_id).await?;
        self.require_status(&task, TaskStatus::Open)?;
        if bidder_id == task.poster_id {
            return Err(ServiceError::forbidden(
                "Poster cannot bid on their own task",
            ));
        }
        if amount < 1 || amount > task.reward {
            return Err(ServiceError::invalid_payload(
                "Bid amount must be between 1 and the task reward",
            ));
        }

        let bid = Bid {
            bid_id: agora_core::ids::new_id("bid"),
            task_id: task_id.to_string(),
            bidder_id,
            amount,
            submitted_at: now_iso(),
        };
        let store = self.store.clone();
        let row = bid.clone();
        blocking(move || store.insert_bid(&row)).await?;
        Ok(bid)
    }

    /// List bids. Sealed while the task is open: only the poster may look.
    pub async fn list_bids(
        &self,
        task_id: &str,
        bearer: Option<String>,
    ) -> ServiceResult<Vec<Bid>> {
        let task = self.load_evaluated(task_id).await?;

        if task.status == TaskStatus::Open {
            let token = bearer.ok_or_else(|| {
                ServiceError::forbidden("Bids are sealed while the task is open")
            })?;
            let verified = self.tokens.validate(&token, "list_bids").await?;
            if verified.agent_id != task.poster_id {
                return Err(ServiceError::forbidden(
                    "Only the poster may list bids while the task is open",
                ));
            }
        }

        let store = self.store.clone();
        let task_id = task_id.to_string();
        blocking(move || store.list_bids(&task_id)).await
    }

    /// Accept a bid, assigning the worker and starting the execution clock
    pub async fn accept_bid(
        &self,
        task_id: &str,
        bid_id: &str,
        token: &str,
    ) -> ServiceResult<TaskView> {
        let verified = self.tokens.validate(token, "accept_bid").await?;

        let task = self.load_evaluated(task_id).await?;
        self.require_status(&task, TaskStatus::Open)?;
        self.require_poster(&task, &verified)?;

        let bid = {
            let store = self.store.clone();
            let task_id = task_id.to_string();
            let bid_id = bid_id.to_string();
            blocking(move || store.get_bid(&task_id, &bid_id))
                .await?
                .ok_or_else(|| ServiceError::not_found("BID_NOT_FOUND", "Bid not found"))?
        };

        let changed = {
            let store = self.store.clone();
            let task_id = task_id.to_string();
            let bidder_id = bid.bidder_id.clone();
            let bid_id = bid.bid_id.clone();
            blocking(move || store.mark_accepted(&task_id, &bidder_id, &bid_id, &now_iso()))
                .await?
        };
        if changed == 0 {
            let current = self.load_evaluated(task_id).await?;
            return Err(self.wrong_status(&current, TaskStatus::Open));
        }
        self.reload_view(task_id).await
    }

    /// Cancel an open task; the escrow returns to the poster first
    pub async fn cancel_task(&self, task_id: &str, token: &str) -> ServiceResult<TaskView> {
        let verified = self.tokens.validate(token, "cancel_task").await?;

        let task = self.load_evaluated(task_id).await?;
        self.require_status(&task, TaskStatus::Open)?;
        self.require_poster(&task, &verified)?;

        // Money first: if the Bank is down the task stays open.
        self.escrow.release(&task.escrow_id, &task.poster_id).await?;

        let changed = {
            let store = self.store.clone();
            let task_id = task_id.to_string();
            blocking(move || store.mark_cancelled(&task_id, &now_iso())).await?
        };
        if changed == 0 {
            let current = self.load_evaluated(task_id).await?;
            return Err(self.wrong_status(&current, TaskStatus::Open));
        }
        self.reload_view(task_id).await
    }

    /// Worker submits deliverables for review
    pub async fn submit_deliverable(&self, task_id: &str, token: &str) -> ServiceResult<TaskView> {
        let verified = self.tokens.validate(token, "submit_deliverable").await?;

        let task = self.load_evaluated(task_id).await?;
        self.require_status(&task, TaskStatus::Accepted)?;
        if Some(verified.agent_id.as_str()) != task.worker_id.as_deref() {
            return Err(ServiceError::forbidden(
                "Only the assigned worker can submit deliverables",
            ));
        }

        let changed = {
            let store = self.store.clone();
            let task_id = task_id.to_string();
            blocking(move || store.mark_submitted(&task_id, &now_iso())).await?
        };
        if changed == 0 {
            let current = self.load_evaluated(task_id).await?;
            return Err(self.wrong_status(&current, TaskStatus::Accepted));
        }
        self.reload_view(task_id).await
    }

    /// Poster approves; the escrow releases to the worker before the flip
    pub async fn approve_task(&self, task_id: &str, token: &str) -> ServiceResult<TaskView> {
        let verified = self.tokens.validate(token, "approve_task").await?;

        let task = self.load_evaluated(task_id).await?;
        self.require_status(&task, TaskStatus::Submitted)?;
        self.require_poster(&task, &verified)?;
        let worker_id = task
            .worker_id
            .clone()
            .ok_or_else(|| ServiceError::internal("Submitted task has no worker"))?;

        self.escrow.release(&task.escrow_id, &worker_id).await?;

        let changed = {
            let store = self.store.clone();
            let task_id = task_id.to_string();
            blocking(move || store.mark_approved(&task_id, &now_iso(), false)).await?
        };
        if changed == 0 {
            let current = self.load_evaluated(task_id).await?;
            return Err(self.wrong_status(&current, TaskStatus::Submitted));
        }
        self.reload_view(task_id).await
    }

    /// Poster disputes a submission; escrow stays locked for the Court
    pub async fn dispute_task(&self, task_id: &str, token: &str) -> ServiceResult<TaskView> {
        let verified = self.tokens.validate(token, "dispute_task").await?;
        let reason = payload_str(&verified.payload, "reason")?;
        if reason.len() > self.limits.max_reason_length {
            return Err(ServiceError::invalid_payload(
                "reason exceeds maximum length",
            ));
        }

        let task = self.load_evaluated(task_id).await?;
        self.require_status(&task, TaskStatus::Submitted)?;
        self.require_poster(&task, &verified)?;

        let changed = {
            let store = self.store.clone();
            let task_id = task_id.to_string();
            blocking(move || store.mark_disputed(&task_id, &reason, &now_iso())).await?
        };
        if changed == 0 {
            let current = self.load_evaluated(task_id).await?;
            return Err(self.wrong_status(&current, TaskStatus::Submitted));
        }
        self.reload_view(task_id).await
    }

    /// Record the Court's ruling (platform-signed); escrow was already split
    pub async fn record_ruling(&self, task_id: &str, token: &str) -> ServiceResult<TaskView> {
        let verified = self.tokens.validate(token, "record_ruling").await?;
        require_platform_signer(&verified.agent_id, &self.platform_agent_id)?;

        let ruling_id = payload_str(&verified.payload, "ruling_id")?;
        let worker_pct = payload_i64(&verified.payload, "worker_pct")?;
        if !(0..=100).contains(&worker_pct) {
            return Err(ServiceError::invalid_payload(
                "worker_pct must be between 0 and 100",
            ));
        }
        let ruling_summary = payload_str(&verified.payload, "ruling_summary")?;

        let task = self.load_evaluated(task_id).await?;
        self.require_status(&task, TaskStatus::Disputed)?;

        let changed = {
            let store = self.store.clone();
            let task_id = task_id.to_string();
            blocking(move || {
                store.mark_ruled(&task_id, &ruling_id, worker_pct, &ruling_summary, &now_iso())
            })
            .await?
        };
        if changed == 0 {
            let current = self.load_evaluated(task_id).await?;
            return Err(self.wrong_status(&current, TaskStatus::Disputed));
        }
        self.reload_view(task_id).await
    }

    pub async fn get_task(&self, task_id: &str) -> ServiceResult<TaskView> {
        let task = self.load_evaluated(task_id).await?;
        self.view(task).await
    }

    pub async fn list_tasks(&self, filter: TaskFilter) -> ServiceResult<Vec<TaskView>> {
        let tasks = {
            let store = self.store.clone();
            blocking(move || store.list_tasks(&filter)).await?
        };
        let tasks = self.deadlines.evaluate_batch(tasks).await?;
        let mut views = Vec::with_capacity(tasks.len());
        for task in tasks {
            views.push(self.view(task).await?);
        }
        Ok(views)
    }

    async fn load_evaluated(&self, task_id: &str) -> ServiceResult<Task> {
        let task = {
            let store = self.store.clone();
            let task_id = task_id.to_string();
            blocking(move || store.get_task(&task_id)).await?
        }
        .ok_or_else(|| ServiceError::not_found("TASK_NOT_FOUND", "Task not found"))?;
        self.deadlines.evaluate(task).await
    }

    async fn reload_view(&self, task_id: &str) -> ServiceResult<TaskView> {
        let task = {
            let store = self.store.clone();
            let task_id = task_id.to_string();
            blocking(move || store.get_task(&task_id)).await?
        }
        .ok_or_else(|| ServiceError::not_found("TASK_NOT_FOUND", "Task not found"))?;
        self.view(task).await
    }

    async fn view(&self, task: Task) -> ServiceResult<TaskView> {
        let store = self.store.clone();
        let task_id = task.task_id.clone();
        let assets = blocking(move || store.list_assets(&task_id)).await?;
        let deliverables = assets
            .iter()
            .map(|asset| format!("{} sha256:{}", asset.filename, asset.content_hash))
            .collect();
        Ok(TaskView { task, deliverables })
    }

    fn require_status(&self, task: &Task, expected: TaskStatus) -> ServiceResult<()> {
        if task.status != expected {
            return Err(self.wrong_status(task, expected));
        }
        Ok(())
    }

    fn wrong_status(&self, task: &Task, expected: TaskStatus) -> ServiceError {
        ServiceError::conflict(
            "INVALID_STATUS",
            format!(
                "Task is '{}', operation requires '{}'",
                task.status, expected
            ),
        )
    }

    fn require_poster(&self, task: &Task, verified: &VerifiedToken) -> ServiceResult<()> {
        if verified.agent_id != task.poster_id {
            return Err(ServiceError::forbidden(
                "Only the task poster can perform this operation",
            ));
        }
        Ok(())
    }
}
