//! Dispute persistence.
//!
//! One dispute per task. The `judging` status is the in-flight lock for a
//! ruling: `claim_for_judging` flips into it with a compare-and-set, and a
//! failed ruling reverts to `rebuttal_pending` so the client may retry.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use agora_core::db;
use agora_core::error::{ServiceError, ServiceResult};
use agora_core::ids::new_id;
use agora_core::time::{add_seconds, now_iso, to_iso};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DisputeStatus {
    RebuttalPending,
    RebuttalSubmitted,
    Judging,
    Ruled,
}

impl DisputeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RebuttalPending => "rebuttal_pending",
            Self::RebuttalSubmitted => "rebuttal_submitted",
            Self::Judging => "judging",
            Self::Ruled => "ruled",
        }
    }
}

impl FromStr for DisputeStatus {
    type Err = ServiceError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "rebuttal_pending" => Ok(Self::RebuttalPending),
            "rebuttal_submitted" => Ok(Self::RebuttalSubmitted),
            "judging" => Ok(Self::Judging),
            "ruled" => Ok(Self::Ruled),
            other => Err(ServiceError::internal(format!(
                "Unknown dispute status '{other}'"
            ))),
        }
    }
}

impl fmt::Display for DisputeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Vote {
    pub vote_id: String,
    pub dispute_id: String,
    pub judge_id: String,
    pub worker_pct: i64,
    pub reasoning: String,
    pub voted_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Dispute {
    pub dispute_id: String,
    pub task_id: String,
    pub claimant_id: String,
    pub respondent_id: String,
    pub claim: String,
    pub rebuttal: Option<String>,
    pub status: DisputeStatus,
    pub rebuttal_deadline: String,
    pub worker_pct: Option<i64>,
    pub ruling_summary: Option<String>,
    pub escrow_id: String,
    pub filed_at: String,
    pub rebutted_at: Option<String>,
    pub ruled_at: Option<String>,
    pub votes: Vec<Vote>,
}

/// List-view summary
#[derive(Debug, Clone, Serialize)]
pub struct DisputeSummary {
    pub dispute_id: String,
    pub task_id: String,
    pub claimant_id: String,
    pub respondent_id: String,
    pub status: DisputeStatus,
    pub worker_pct: Option<i64>,
    pub filed_at: String,
    pub ruled_at: Option<String>,
}

pub struct DisputeStore {
    conn: Mutex<Connection>,
}

impl DisputeStore {
    pub fn open(path: &Path) -> ServiceResult<Self> {
        Self::with_connection(db::open(path)?)
    }

    pub fn open_in_memory() -> ServiceResult<Self> {
        Self::with_connection(db::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> ServiceResult<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS disputes (
                dispute_id TEXT PRIMARY KEY,
                task_id TEXT NOT NULL UNIQUE,
                claimant_id TEXT NOT NULL,
                respondent_id TEXT NOT NULL,
                claim TEXT NOT NULL,
                rebuttal TEXT,
                status TEXT NOT NULL
                    CHECK (status IN ('rebuttal_pending', 'rebuttal_submitted',
                                      'judging', 'ruled')),
                rebuttal_deadline TEXT NOT NULL,
                worker_pct INTEGER,
                ruling_summary TEXT,
                escrow_id TEXT NOT NULL,
                filed_at TEXT NOT NULL,
                rebutted_at TEXT,
                ruled_at TEXT
            );
            CREATE TABLE IF NOT EXISTS votes (
                vote_id TEXT PRIMARY KEY,
                dispute_id TEXT NOT NULL REFERENCES disputes(dispute_id),
                judge_id TEXT NOT NULL,
                worker_pct INTEGER NOT NULL,
                reasoning TEXT NOT NULL,
                voted_at TEXT NOT NULL
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> ServiceResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| ServiceError::internal("Dispute store lock poisoned"))
    }

    /// File a new dispute; at most one per task
    pub fn file(
        &self,
        task_id: &str,
        claimant_id: &str,
        respondent_id: &str,
        claim: &str,
        escrow_id: &str,
        rebuttal_deadline_seconds: i64,
    ) -> ServiceResult<Dispute> {
        let filed_at = now_iso();
        let rebuttal_deadline = to_iso(add_seconds(&filed_at, rebuttal_deadline_seconds)?);
        let dispute = Dispute {
            dispute_id: new_id("disp"),
            task_id: task_id.to_string(),
            claimant_id: claimant_id.to_string(),
            respondent_id: respondent_id.to_string(),
            claim: claim.to_string(),
            rebuttal: None,
            status: DisputeStatus::RebuttalPending,
            rebuttal_deadline,
            worker_pct: None,
            ruling_summary: None,
            escrow_id: escrow_id.to_string(),
            filed_at,
            rebutted_at: None,
            ruled_at: None,
            votes: Vec::new(),
        };

        let conn = self.lock()?;
        let inserted = conn.execute(
            "INSERT INTO disputes (dispute_id, task_id, claimant_id, respondent_id, claim,
                                   status, rebuttal_deadline, escrow_id, filed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                dispute.dispute_id,
                dispute.task_id,
                dispute.claimant_id,
                dispute.respondent_id,
                dispute.claim,
                dispute.status.as_str(),
                dispute.rebuttal_deadline,
                dispute.escrow_id,
                dispute.filed_at
            ],
        );
        match inserted {
            Ok(_) => Ok(dispute),
            Err(err) if err.sqlite_error_code() == Some(rusqlite::ErrorCode::ConstraintViolation) => {
                Err(ServiceError::conflict(
                    "DISPUTE_EXISTS",
                    "A dispute has already been filed for this task",
                ))
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn get(&self, dispute_id: &str) -> ServiceResult<Option<Dispute>> {
        let conn = self.lock()?;
        let dispute = conn
            .query_row(
                &format!("SELECT {DISPUTE_COLUMNS} FROM disputes WHERE dispute_id = ?1"),
                params![dispute_id],
                dispute_from_row,
            )
            .optional()?;
        let mut dispute = match dispute {
            Some(result) => result?,
            None => return Ok(None),
        };

        let mut stmt = conn.prepare(
            "SELECT vote_id, dispute_id, judge_id, worker_pct, reasoning, voted_at
             FROM votes WHERE dispute_id = ?1 ORDER BY voted_at, vote_id",
        )?;
        let rows = stmt.query_map(params![dispute_id], |row| {
            Ok(Vote {
                vote_id: row.get(0)?,
                dispute_id: row.get(1)?,
                judge_id: row.get(2)?,
                worker_pct: row.get(3)?,
                reasoning: row.get(4)?,
                voted_at: row.get(5)?,
            })
        })?;
        for row in rows {
            dispute.votes.push(row?);
        }
        Ok(Some(dispute))
    }

    pub fn list(
        &self,
        task_id: Option<&str>,
        status: Option<&str>,
    ) -> ServiceResult<Vec<DisputeSummary>> {
        let mut sql = String::from(
            "SELECT dispute_id, task_id, claimant_id, respondent_id, status, worker_pct,
                    filed_at, ruled_at
             FROM disputes WHERE 1=1",
        );
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(task_id) = task_id {
            sql.push_str(" AND task_id = ?");
            args.push(Box::new(task_id.to_string()));
        }
        if let Some(status) = status {
            sql.push_str(" AND status = ?");
            args.push(Box::new(status.to_string()));
        }
        sql.push_str(" ORDER BY filed_at, dispute_id");

        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params_from_iter(args.iter().map(|arg| arg.as_ref())),
            |row| {
                let status_raw: String = row.get(4)?;
                Ok((
                    DisputeSummary {
                        dispute_id: row.get(0)?,
                        task_id: row.get(1)?,
                        claimant_id: row.get(2)?,
                        respondent_id: row.get(3)?,
                        status: DisputeStatus::RebuttalPending,
                        worker_pct: row.get(5)?,
                        filed_at: row.get(6)?,
                        ruled_at: row.get(7)?,
                    },
                    status_raw,
                ))
            },
        )?;
        let mut summaries = Vec::new();
        for row in rows {
            let (mut summary, status_raw) = row?;
            summary.status = DisputeStatus::from_str(&status_raw)?;
            summaries.push(summary);
        }
        Ok(summaries)
    }

    /// Record the rebuttal; only valid while the dispute awaits one
    pub fn submit_rebuttal(&self, dispute_id: &str, rebuttal: &str) -> ServiceResult<Dispute> {
        {
            let conn = self.lock()?;
            let changed = conn.execute(
                "UPDATE disputes SET rebuttal = ?1, rebutted_at = ?2,
                                     status = 'rebuttal_submitted'
                 WHERE dispute_id = ?3 AND status = 'rebuttal_pending'",
                params![rebuttal, now_iso(), dispute_id],
            )?;
            if changed == 0 {
                drop(conn);
                let current = self
                    .get(dispute_id)?
                    .ok_or_else(|| {
                        ServiceError::not_found("DISPUTE_NOT_FOUND", "Dispute not found")
                    })?;
                return Err(match current.status {
                    DisputeStatus::Ruled => ServiceError::conflict(
                        "DISPUTE_ALREADY_RULED",
                        "Dispute has already been ruled",
                    ),
                    status => ServiceError::conflict(
                        "INVALID_STATUS",
                        format!("Cannot submit a rebuttal while dispute is '{status}'"),
                    ),
                });
            }
        }
        self.get(dispute_id)?
            .ok_or_else(|| ServiceError::internal("Dispute vanished after rebuttal"))
    }

    /// Validate ruling preconditions and atomically flip into `judging`.
    ///
    /// Returns the dispute as it stood before the flip. Exactly one caller
    /// can win this for a given dispute; the rest observe
    /// `DISPUTE_NOT_READY` (or `DISPUTE_ALREADY_RULED` once ruled).
    pub fn claim_for_judging(&self, dispute_id: &str) -> ServiceResult<Dispute> {
        let dispute = self
            .get(dispute_id)?
            .ok_or_else(|| ServiceError::not_found("DISPUTE_NOT_FOUND", "Dispute not found"))?;

        if dispute.status == DisputeStatus::Ruled || dispute.ruled_at.is_some() {
            return Err(ServiceError::conflict(
                "DISPUTE_ALREADY_RULED",
                "Dispute has already been ruled",
            ));
        }
        if dispute.status == DisputeStatus::Judging {
            return Err(ServiceError::conflict(
                "DISPUTE_NOT_READY",
                "A ruling for this dispute is already in flight",
            ));
        }

        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE disputes SET status = 'judging'
             WHERE dispute_id = ?1
               AND status IN ('rebuttal_pending', 'rebuttal_submitted')",
            params![dispute_id],
        )?;
        if changed == 0 {
            return Err(ServiceError::conflict(
                "DISPUTE_NOT_READY",
                "Dispute is not ready for ruling",
            ));
        }
        Ok(dispute)
    }

    /// Undo the `judging` claim after a failed ruling so it can be retried
    pub fn revert_to_rebuttal_pending(&self, dispute_id: &str) -> ServiceResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE disputes SET status = 'rebuttal_pending'
             WHERE dispute_id = ?1 AND status = 'judging'",
            params![dispute_id],
        )?;
        Ok(())
    }

    /// Commit the ruled outcome and its votes in one transaction
    pub fn persist_ruling(
        &self,
        dispute_id: &str,
        worker_pct: i64,
        ruling_summary: &str,
        votes: &[crate::judges::JudgeVote],
    ) -> ServiceResult<()> {
        let mut conn = self.lock()?;
        db::immediate(&mut conn, |tx| {
            let changed = tx.execute(
                "UPDATE disputes SET status = 'ruled', worker_pct = ?1, ruling_summary = ?2,
                                     ruled_at = ?3
                 WHERE dispute_id = ?4 AND status = 'judging'",
                params![worker_pct, ruling_summary, now_iso(), dispute_id],
            )?;
            if changed == 0 {
                return Err(ServiceError::conflict(
                    "DISPUTE_NOT_READY",
                    "Dispute is no longer held for judging",
                ));
            }
            for vote in votes {
                tx.execute(
                    "INSERT INTO votes (vote_id, dispute_id, judge_id, worker_pct, reasoning,
                                        voted_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        new_id("vote"),
                        dispute_id,
                        vote.judge_id,
                        vote.worker_pct,
                        vote.reasoning,
                        vote.voted_at
                    ],
                )?;
            }
            Ok(())
        })
    }

    pub fn count_total(&self) -> ServiceResult<i64> {
        let conn = self.lock()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM disputes", [], |row| row.get(0))?)
    }

    pub fn count_active(&self) -> ServiceResult<i64> {
        let conn = self.lock()?;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM disputes WHERE status != 'ruled'",
            [],
            |row| row.get(0),
        )?)
    }
}

const DISPUTE_COLUMNS: &str = "dispute_id, task_id, claimant_id, respondent_id, claim, rebuttal,
    status, rebuttal_deadline, worker_pct, ruling_summary, escrow_id, filed_at, rebutted_at,
    ruled_at";

fn dispute_from_row(row: &Row<'_>) -> rusqlite::Result<ServiceResult<Dispute>> {
    let status_raw: String = row.get(6)?;
    Ok(match DisputeStatus::from_str(&status_raw) {
        Err(err) => Err(err),
        Ok(status) => Ok(Dispute {
            dispute_id: row.get(0)?,
            task_id: row.get(1)?,
            claimant_id: row.get(2)?,
            respondent_id: row.get(3)?,
            claim: row.get(4)?,
            rebuttal: row.get(5)?,
            status,
            rebuttal_deadline: row.get(7)?,
            worker_pct: row.get(8)?,
            ruling_summary: row.get(9)?,
            escrow_id: row.get(10)?,
            filed_at: row.get(11)?,
            rebutted_at: row.get(12)?,
            ruled_at: row.get(13)?,
            votes: Vec::new(),
        }),
    })
}
