//! Lazy deadline evaluation.
//!
//! There is no timer service: every read of a task re-evaluates its active
//! deadline and applies the due transition through a status compare-and-set.
//! Only the winner of the CAS performs the escrow side effect; a reader that
//! loses the race re-reads and returns whatever the winner produced.

use std::sync::Arc;

use chrono::Utc;

use agora_core::db::blocking;
use agora_core::error::ServiceResult;
use agora_core::time::{add_seconds, now_iso};

use crate::escrow::EscrowCoordinator;
use crate::store::{Task, TaskStatus, TaskStore};

pub struct DeadlineEvaluator {
    store: Arc<TaskStore>,
    escrow: Arc<EscrowCoordinator>,
}

impl DeadlineEvaluator {
    pub fn new(store: Arc<TaskStore>, escrow: Arc<EscrowCoordinator>) -> Self {
        Self { store, escrow }
    }

    /// Evaluate one task, applying any due transition. Returns the task as
    /// it should be presented to the caller.
    pub async fn evaluate(&self, task: Task) -> ServiceResult<Task> {
        if task.status.is_terminal() {
            // Terminal state may still owe a credit from an earlier outage.
            return self.escrow.retry_pending(task).await;
        }

        let now = Utc::now();
        match task.status {
            TaskStatus::Open => {
                let deadline = add_seconds(&task.created_at, task.bidding_deadline_seconds)?;
                // A task with at least one bid stays open past the bidding
                // deadline; acceptance or cancellation is then required.
                if now >= deadline && task.bid_count == 0 {
                    return self
                        .expire(task, TaskStatus::Open)
                        .await;
                }
                Ok(task)
            }
            TaskStatus::Accepted => {
                let accepted_at = match &task.accepted_at {
                    Some(at) => at.clone(),
                    None => return Ok(task),
                };
                let deadline = add_seconds(&accepted_at, task.execution_deadline_seconds)?;
                if now >= deadline {
                    return self.expire(task, TaskStatus::Accepted).await;
                }
                Ok(task)
            }
            TaskStatus::Submitted => {
                let submitted_at = match &task.submitted_at {
                    Some(at) => at.clone(),
                    None => return Ok(task),
                };
                let deadline = add_seconds(&submitted_at, task.review_deadline_seconds)?;
                if now >= deadline {
                    return self.auto_approve(task).await;
                }
                Ok(task)
            }
            _ => Ok(task),
        }
    }

    /// Evaluate a batch of tasks (list reads)
    pub async fn evaluate_batch(&self, tasks: Vec<Task>) -> ServiceResult<Vec<Task>> {
        let mut evaluated = Vec::with_capacity(tasks.len());
        for task in tasks {
            evaluated.push(self.evaluate(task).await?);
        }
        Ok(evaluated)
    }

    /// CAS into `expired`; the winner releases escrow back to the poster
    async fn expire(&self, task: Task, expected: TaskStatus) -> ServiceResult<Task> {
        let store = self.store.clone();
        let task_id = task.task_id.clone();
        let expired_at = now_iso();
        let changed =
            blocking(move || store.mark_expired(&task_id, &expired_at, expected)).await?;

        if changed == 0 {
            return self.reread(task).await;
        }
        self.escrow
            .try_release(&task.task_id, &task.escrow_id, &task.poster_id)
            .await;
        self.reread(task).await
    }

    /// CAS `submitted -> approved`; the winner releases escrow to the worker
    async fn auto_approve(&self, task: Task) -> ServiceResult<Task> {
        let store = self.store.clone();
        let task_id = task.task_id.clone();
        let approved_at = now_iso();
        let changed =
            blocking(move || store.mark_approved(&task_id, &approved_at, true)).await?;

        if changed == 0 {
            return self.reread(task).await;
        }
        if let Some(worker_id) = task.worker_id.clone() {
            self.escrow
                .try_release(&task.task_id, &task.escrow_id, &worker_id)
                .await;
        }
        self.reread(task).await
    }

    async fn reread(&self, fallback: Task) -> ServiceResult<Task> {
        let store = self.store.clone();
        let task_id = fallback.task_id.clone();
        let refreshed = blocking(move || store.get_task(&task_id)).await?;
        Ok(refreshed.unwrap_or(fallback))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_core::clients::{CentralBankClient, EscrowReceipt};
    use agora_core::error::ServiceError;
    use agora_core::time::to_iso;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct RecordingBank {
        pub fail: bool,
        pub releases: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl CentralBankClient for RecordingBank {
        async fn lock_escrow(&self, _t: &str) -> ServiceResult<EscrowReceipt> {
            unimplemented!()
        }
        async fn release_escrow(&self, escrow_id: &str, recipient: &str) -> ServiceResult<()> {
            if self.fail {
                return Err(ServiceError::unavailable(
                    "CENTRAL_BANK_UNAVAILABLE",
                    "down",
                ));
            }
            self.releases
                .lock()
                .unwrap()
                .push((escrow_id.to_string(), recipient.to_string()));
            Ok(())
        }
        async fn split_escrow(&self, _e: &str, _w: &str, _p: &str, _pct: i64) -> ServiceResult<()> {
            unimplemented!()
        }
    }

    fn setup(fail_bank: bool) -> (Arc<TaskStore>, Arc<RecordingBank>, DeadlineEvaluator) {
        let store = Arc::new(TaskStore::open_in_memory().unwrap());
        let bank = Arc::new(RecordingBank {
            fail: fail_bank,
            releases: Mutex::new(Vec::new()),
        });
        let coordinator = Arc::new(EscrowCoordinator::new(bank.clone(), store.clone()));
        let evaluator = DeadlineEvaluator::new(store.clone(), coordinator);
        (store, bank, evaluator)
    }

    fn past(seconds_ago: i64) -> String {
        to_iso(Utc::now() - chrono::Duration::seconds(seconds_ago))
    }

    fn insert_open(
        store: &TaskStore,
        task_id: &str,
        created_secs_ago: i64,
        deadlines: (i64, i64, i64),
    ) -> Task {
        let mut task = Task::new_open(
            task_id.into(),
            "a-alice".into(),
            "T".into(),
            "S".into(),
            500,
            deadlines.0,
            deadlines.1,
            deadlines.2,
            format!("esc-{task_id}"),
        );
        task.created_at = past(created_secs_ago);
        store.insert_task(&task).unwrap();
        store.get_task(task_id).unwrap().unwrap()
    }

    #[tokio::test]
    async fn open_task_without_bids_expires_and_refunds_poster() {
        let (store, bank, evaluator) = setup(false);
        let task = insert_open(&store, "t-1", 100, (10, 7200, 3600));

        let task = evaluator.evaluate(task).await.unwrap();
        assert_eq!(task.status, TaskStatus::Expired);
        assert!(!task.escrow_pending);
        assert!(task.expired_at.is_some());
        assert_eq!(
            bank.releases.lock().unwrap().as_slice(),
            &[("esc-t-1".to_string(), "a-alice".to_string())]
        );
    }

    #[tokio::test]
    async fn open_task_with_bids_stays_open_past_deadline() {
        let (store, bank, evaluator) = setup(false);
        let task = insert_open(&store, "t-1", 100, (10, 7200, 3600));
        store
            .insert_bid(&crate::store::Bid {
                bid_id: "bid-1".into(),
                task_id: "t-1".into(),
                bidder_id: "a-bob".into(),
                amount: 400,
                submitted_at: now_iso(),
            })
            .unwrap();
        let task = store.get_task(&task.task_id).unwrap().unwrap();

        let task = evaluator.evaluate(task).await.unwrap();
        assert_eq!(task.status, TaskStatus::Open);
        assert!(bank.releases.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn accepted_task_expires_after_execution_deadline() {
        let (store, bank, evaluator) = setup(false);
        let task = insert_open(&store, "t-1", 100, (3600, 10, 3600));
        store
            .mark_accepted(&task.task_id, "a-bob", "bid-1", &past(50))
            .unwrap();
        let task = store.get_task("t-1").unwrap().unwrap();

        let task = evaluator.evaluate(task).await.unwrap();
        assert_eq!(task.status, TaskStatus::Expired);
        assert_eq!(bank.releases.lock().unwrap()[0].1, "a-alice");
    }

    #[tokio::test]
    async fn submitted_task_auto_approves_paying_worker() {
        let (store, bank, evaluator) = setup(false);
        insert_open(&store, "t-1", 300, (3600, 3600, 10));
        store.mark_accepted("t-1", "a-bob", "bid-1", &past(200)).unwrap();
        store.mark_submitted("t-1", &past(100)).unwrap();
        let task = store.get_task("t-1").unwrap().unwrap();

        let task = evaluator.evaluate(task).await.unwrap();
        assert_eq!(task.status, TaskStatus::Approved);
        assert!(!task.escrow_pending);
        assert_eq!(
            bank.releases.lock().unwrap().as_slice(),
            &[("esc-t-1".to_string(), "a-bob".to_string())]
        );
    }

    #[tokio::test]
    async fn auto_approval_survives_bank_outage_via_pending_flag() {
        let (store, _bank, evaluator) = setup(true);
        insert_open(&store, "t-1", 300, (3600, 3600, 10));
        store.mark_accepted("t-1", "a-bob", "bid-1", &past(200)).unwrap();
        store.mark_submitted("t-1", &past(100)).unwrap();
        let task = store.get_task("t-1").unwrap().unwrap();

        // Transition lands even though the release fails.
        let task = evaluator.evaluate(task).await.unwrap();
        assert_eq!(task.status, TaskStatus::Approved);
        assert!(task.escrow_pending);

        // With the Bank back, the next read completes the release.
        let bank_up = Arc::new(RecordingBank {
            fail: false,
            releases: Mutex::new(Vec::new()),
        });
        let coordinator = Arc::new(EscrowCoordinator::new(bank_up.clone(), store.clone()));
        let evaluator_up = DeadlineEvaluator::new(store.clone(), coordinator);

        let task = evaluator_up.evaluate(task).await.unwrap();
        assert_eq!(task.status, TaskStatus::Approved);
        assert!(!task.escrow_pending);
        assert_eq!(bank_up.releases.lock().unwrap()[0].1, "a-bob");
    }

    #[tokio::test]
    async fn terminal_tasks_are_left_alone() {
        let (store, bank, evaluator) = setup(false);
        let task = insert_open(&store, "t-1", 0, (3600, 7200, 3600));
        store.mark_cancelled("t-1", &now_iso()).unwrap();
        let task = store.get_task(&task.task_id).unwrap().unwrap();

        let task = evaluator.evaluate(task).await.unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert!(bank.releases.lock().unwrap().is_empty());
    }
}
