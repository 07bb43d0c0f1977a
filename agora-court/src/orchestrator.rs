//! Ruling orchestration.
//!
//! The `judging` flip is the per-dispute lock. Side effects run in a fixed
//! order (escrow split, reputation feedback, ruling record) and only after
//! all of them succeed is the ruled dispute persisted. Any failure reverts
//! the dispute to `rebuttal_pending` so the client may retry; each side
//! effect is idempotent at its target, so a retry converges instead of
//! double-applying.

use std::sync::Arc;

use serde_json::{json, Map, Value};

use agora_core::clients::{CentralBankClient, ReputationClient, TaskBoardClient};
use agora_core::db::blocking;
use agora_core::error::{ServiceError, ServiceResult};
use agora_core::time::now_iso;

use crate::judges::{DisputeContext, Judge, JudgeVote};
use crate::store::{Dispute, DisputeStore};

pub struct RulingOrchestrator {
    store: Arc<DisputeStore>,
}

impl RulingOrchestrator {
    pub fn new(store: Arc<DisputeStore>) -> Self {
        Self { store }
    }

    /// Evaluate the panel and commit the ruled outcome with side effects.
    #[allow(clippy::too_many_arguments)]
    pub async fn execute_ruling(
        &self,
        dispute_id: &str,
        judges: &[Arc<dyn Judge>],
        task: &Map<String, Value>,
        bank: &dyn CentralBankClient,
        reputation: &dyn ReputationClient,
        board: &dyn TaskBoardClient,
        platform_agent_id: &str,
    ) -> ServiceResult<Dispute> {
        let dispute = {
            let store = self.store.clone();
            let dispute_id = dispute_id.to_string();
            blocking(move || store.claim_for_judging(&dispute_id)).await?
        };

        match self
            .run_ruling(dispute_id, &dispute, judges, task, bank, reputation, board, platform_agent_id)
            .await
        {
            Ok(()) => {}
            Err(err) => {
                let store = self.store.clone();
                let dispute_id = dispute_id.to_string();
                let _ = blocking(move || store.revert_to_rebuttal_pending(&dispute_id)).await;
                return Err(err);
            }
        }

        let store = self.store.clone();
        let dispute_id = dispute_id.to_string();
        blocking(move || store.get(&dispute_id))
            .await?
            .ok_or_else(|| ServiceError::internal("Ruled dispute vanished"))
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_ruling(
        &self,
        dispute_id: &str,
        dispute: &Dispute,
        judges: &[Arc<dyn Judge>],
        task: &Map<String, Value>,
        bank: &dyn CentralBankClient,
        reputation: &dyn ReputationClient,
        board: &dyn TaskBoardClient,
        platform_agent_id: &str,
    ) -> ServiceResult<()> {
        let context = build_context(dispute, task);
        let votes = evaluate_panel(judges, &context).await?;
        let (median_pct, ruling_summary) = compute_ruling(&votes);

        // Escrow split first: the money is the least reversible effect, so
        // nothing else happens until it lands. An already-resolved escrow
        // means an earlier attempt got this far.
        match bank
            .split_escrow(
                &dispute.escrow_id,
                &dispute.respondent_id,
                &dispute.claimant_id,
                median_pct,
            )
            .await
        {
            Ok(()) => {}
            Err(err) if err.code == "ESCROW_ALREADY_RESOLVED" => {}
            Err(err) if err.status >= 500 => {
                return Err(ServiceError::unavailable(
                    "CENTRAL_BANK_UNAVAILABLE",
                    "Cannot reach Central Bank service",
                ))
            }
            Err(err) => return Err(err),
        }

        let spec_feedback = json!({
            "action": "submit_feedback",
            "task_id": dispute.task_id,
            "from_agent_id": platform_agent_id,
            "to_agent_id": dispute.claimant_id,
            "category": "spec_quality",
            "rating": spec_rating(median_pct),
            "comment": &ruling_summary,
        });
        let delivery_feedback = json!({
            "action": "submit_feedback",
            "task_id": dispute.task_id,
            "from_agent_id": platform_agent_id,
            "to_agent_id": dispute.respondent_id,
            "category": "delivery_quality",
            "rating": delivery_rating(median_pct),
            "comment": &ruling_summary,
        });
        reputation.record_feedback(&spec_feedback).await?;
        reputation.record_feedback(&delivery_feedback).await?;

        board
            .record_ruling(
                &dispute.task_id,
                &json!({
                    "action": "record_ruling",
                    "task_id": dispute.task_id,
                    "ruling_id": dispute_id,
                    "worker_pct": median_pct,
                    "ruling_summary": &ruling_summary,
                }),
            )
            .await?;

        let store = self.store.clone();
        let dispute_id = dispute_id.to_string();
        blocking(move || store.persist_ruling(&dispute_id, median_pct, &ruling_summary, &votes))
            .await
    }
}

fn build_context(dispute: &Dispute, task: &Map<String, Value>) -> DisputeContext {
    let deliverables = match task.get("deliverables") {
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect(),
        Some(Value::String(single)) => vec![single.clone()],
        _ => Vec::new(),
    };
    DisputeContext {
        task_title: task
            .get("title")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        reward: task.get("reward").and_then(Value::as_i64).unwrap_or(0),
        task_spec: task
            .get("spec")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        deliverables,
        claim: dispute.claim.clone(),
        rebuttal: dispute.rebuttal.clone(),
    }
}

/// Run every judge; one failure aborts the whole panel
async fn evaluate_panel(
    judges: &[Arc<dyn Judge>],
    context: &DisputeContext,
) -> ServiceResult<Vec<JudgeVote>> {
    if judges.is_empty() {
        return Err(ServiceError::unavailable(
            "JUDGE_UNAVAILABLE",
            "No judges configured",
        ));
    }
    let mut votes = Vec::with_capacity(judges.len());
    for (index, judge) in judges.iter().enumerate() {
        let vote = judge.evaluate(context).await.map_err(|_| {
            ServiceError::unavailable(
                "JUDGE_UNAVAILABLE",
                format!("Judge {index} failed to evaluate dispute"),
            )
        })?;
        votes.push(normalize_vote(vote, index));
    }
    Ok(votes)
}

/// Clamp and backfill a raw vote so downstream code sees a well-formed one
fn normalize_vote(vote: JudgeVote, index: usize) -> JudgeVote {
    let worker_pct = vote.worker_pct.clamp(0, 100);
    let reasoning = if vote.reasoning.trim().is_empty() {
        "No reasoning provided.".to_string()
    } else {
        vote.reasoning
    };
    let judge_id = if vote.judge_id.trim().is_empty() {
        format!("judge-{index}")
    } else {
        vote.judge_id
    };
    let voted_at = if vote.voted_at.trim().is_empty() {
        now_iso()
    } else {
        vote.voted_at
    };
    JudgeVote {
        judge_id,
        worker_pct,
        reasoning,
        voted_at,
    }
}

/// Median of the vote percentages (odd panel → unique integer) and the
/// concatenated reasonings
fn compute_ruling(votes: &[JudgeVote]) -> (i64, String) {
    let mut pcts: Vec<i64> = votes.iter().map(|vote| vote.worker_pct).collect();
    pcts.sort_unstable();
    let median = pcts[pcts.len() / 2];
    let summary = votes
        .iter()
        .map(|vote| vote.reasoning.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");
    (median, summary)
}

fn delivery_rating(worker_pct: i64) -> &'static str {
    if worker_pct >= 80 {
        "extremely_satisfied"
    } else if worker_pct >= 40 {
        "satisfied"
    } else {
        "dissatisfied"
    }
}

fn spec_rating(worker_pct: i64) -> &'static str {
    if worker_pct >= 80 {
        "dissatisfied"
    } else if worker_pct >= 40 {
        "satisfied"
    } else {
        "extremely_satisfied"
    }
}
