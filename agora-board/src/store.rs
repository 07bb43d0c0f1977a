//! Task Board persistence: tasks, bids, and asset records.
//!
//! Every status transition goes through a compare-and-set UPDATE guarded by
//! `WHERE status = <expected>`; the status column is effectively the task's
//! lock. Callers inspect the changed-row count to detect lost races.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use agora_core::db;
use agora_core::error::{ServiceError, ServiceResult};
use agora_core::time::now_iso;

/// Task lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Open,
    Accepted,
    Submitted,
    Approved,
    Cancelled,
    Disputed,
    Ruled,
    Expired,
}

impl TaskStatus {
    /// No further transitions once terminal
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Approved | Self::Cancelled | Self::Ruled | Self::Expired
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Accepted => "accepted",
            Self::Submitted => "submitted",
            Self::Approved => "approved",
            Self::Cancelled => "cancelled",
            Self::Disputed => "disputed",
            Self::Ruled => "ruled",
            Self::Expired => "expired",
        }
    }
}

impl FromStr for TaskStatus {
    type Err = ServiceError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "open" => Ok(Self::Open),
            "accepted" => Ok(Self::Accepted),
            "submitted" => Ok(Self::Submitted),
            "approved" => Ok(Self::Approved),
            "cancelled" => Ok(Self::Cancelled),
            "disputed" => Ok(Self::Disputed),
            "ruled" => Ok(Self::Ruled),
            "expired" => Ok(Self::Expired),
            other => Err(ServiceError::internal(format!(
                "Unknown task status '{other}'"
            ))),
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub task_id: String,
    pub poster_id: String,
    pub title: String,
    pub spec: String,
    pub reward: i64,
    pub bidding_deadline_seconds: i64,
    pub execution_deadline_seconds: i64,
    pub review_deadline_seconds: i64,
    pub status: TaskStatus,
    pub escrow_id: String,
    pub bid_count: i64,
    pub worker_id: Option<String>,
    pub accepted_bid_id: Option<String>,
    pub dispute_reason: Option<String>,
    pub ruling_id: Option<String>,
    pub worker_pct: Option<i64>,
    pub ruling_summary: Option<String>,
    pub escrow_pending: bool,
    pub created_at: String,
    pub accepted_at: Option<String>,
    pub submitted_at: Option<String>,
    pub approved_at: Option<String>,
    pub cancelled_at: Option<String>,
    pub disputed_at: Option<String>,
    pub ruled_at: Option<String>,
    pub expired_at: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Bid {
    pub bid_id: String,
    pub task_id: String,
    pub bidder_id: String,
    pub amount: i64,
    pub submitted_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Asset {
    pub asset_id: String,
    pub task_id: String,
    pub uploader_id: String,
    pub filename: String,
    pub content_type: String,
    pub size_bytes: i64,
    pub content_hash: String,
    pub uploaded_at: String,
}

/// Filters for `GET /tasks`
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<String>,
    pub poster_id: Option<String>,
    pub worker_id: Option<String>,
    pub offset: Option<i64>,
    pub limit: Option<i64>,
}

pub struct TaskStore {
    conn: Mutex<Connection>,
}

impl TaskStore {
    pub fn open(path: &Path) -> ServiceResult<Self> {
        Self::with_connection(db::open(path)?)
    }

    pub fn open_in_memory() -> ServiceResult<Self> {
        Self::with_connection(db::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> ServiceResult<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS tasks (
                task_id TEXT PRIMARY KEY,
                poster_id TEXT NOT NULL,
                title TEXT NOT NULL,
                spec TEXT NOT NULL,
                reward INTEGER NOT NULL CHECK (reward > 0),
                bidding_deadline_seconds INTEGER NOT NULL,
                execution_deadline_seconds INTEGER NOT NULL,
                review_deadline_seconds INTEGER NOT NULL,
                status TEXT NOT NULL,
                escrow_id TEXT NOT NULL,
                bid_count INTEGER NOT NULL DEFAULT 0,
                worker_id TEXT,
                accepted_bid_id TEXT,
                dispute_reason TEXT,
                ruling_id TEXT,
                worker_pct INTEGER,
                ruling_summary TEXT,
                escrow_pending INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                accepted_at TEXT,
                submitted_at TEXT,
                approved_at TEXT,
                cancelled_at TEXT,
                disputed_at TEXT,
                ruled_at TEXT,
                expired_at TEXT
            );
            CREATE TABLE IF NOT EXISTS bids (
                bid_id TEXT PRIMARY KEY,
                task_id TEXT NOT NULL REFERENCES tasks(task_id),
                bidder_id TEXT NOT NULL,
                amount INTEGER NOT NULL,
                submitted_at TEXT NOT NULL,
                UNIQUE (task_id, bidder_id)
            );
            CREATE TABLE IF NOT EXISTS assets (
                asset_id TEXT PRIMARY KEY,
                task_id TEXT NOT NULL REFERENCES tasks(task_id),
                uploader_id TEXT NOT NULL,
                filename TEXT NOT NULL,
                content_type TEXT NOT NULL,
                size_bytes INTEGER NOT NULL,
                content_hash TEXT NOT NULL,
                uploaded_at TEXT NOT NULL
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> ServiceResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| ServiceError::internal("Task store lock poisoned"))
    }

    pub fn insert_task(&self, task: &Task) -> ServiceResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO tasks (task_id, poster_id, title, spec, reward,
                                bidding_deadline_seconds, execution_deadline_seconds,
                                review_deadline_seconds, status, escrow_id, bid_count,
                                escrow_pending, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 0, 0, ?11)",
            params![
                task.task_id,
                task.poster_id,
                task.title,
                task.spec,
                task.reward,
                task.bidding_deadline_seconds,
                task.execution_deadline_seconds,
                task.review_deadline_seconds,
                task.status.as_str(),
                task.escrow_id,
                task.created_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_task(&self, task_id: &str) -> ServiceResult<Option<Task>> {
        let conn = self.lock()?;
        let task = conn
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE task_id = ?1"),
                params![task_id],
                task_from_row,
            )
            .optional()?;
        match task {
            Some(task) => Ok(Some(task?)),
            None => Ok(None),
        }
    }

    pub fn list_tasks(&self, filter: &TaskFilter) -> ServiceResult<Vec<Task>> {
        let mut sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE 1=1");
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(status) = &filter.status {
            sql.push_str(" AND status = ?");
            args.push(Box::new(status.clone()));
        }
        if let Some(poster_id) = &filter.poster_id {
            sql.push_str(" AND poster_id = ?");
            args.push(Box::new(poster_id.clone()));
        }
        if let Some(worker_id) = &filter.worker_id {
            sql.push_str(" AND worker_id = ?");
            args.push(Box::new(worker_id.clone()));
        }
        sql.push_str(" ORDER BY created_at, task_id");
        if let Some(limit) = filter.limit {
            sql.push_str(" LIMIT ?");
            args.push(Box::new(limit));
        } else if filter.offset.is_some() {
            sql.push_str(" LIMIT -1");
        }
        if let Some(offset) = filter.offset {
            sql.push_str(" OFFSET ?");
            args.push(Box::new(offset));
        }

        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params_from_iter(args.iter().map(|arg| arg.as_ref())),
            task_from_row,
        )?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row??);
        }
        Ok(tasks)
    }

    /// Compare-and-set `open -> accepted`, assigning the worker
    pub fn mark_accepted(
        &self,
        task_id: &str,
        worker_id: &str,
        bid_id: &str,
        accepted_at: &str,
    ) -> ServiceResult<usize> {
        let conn = self.lock()?;
        Ok(conn.execute(
            "UPDATE tasks SET status = 'accepted', worker_id = ?1, accepted_bid_id = ?2,
                              accepted_at = ?3
             WHERE task_id = ?4 AND status = 'open'",
            params![worker_id, bid_id, accepted_at, task_id],
        )?)
    }

    /// Compare-and-set `open -> cancelled`
    pub fn mark_cancelled(&self, task_id: &str, cancelled_at: &str) -> ServiceResult<usize> {
        let conn = self.lock()?;
        Ok(conn.execute(
            "UPDATE tasks SET status = 'cancelled', cancelled_at = ?1, escrow_pending = 0
             WHERE task_id = ?2 AND status = 'open'",
            params![cancelled_at, task_id],
        )?)
    }

    /// Compare-and-set `accepted -> submitted`
    pub fn mark_submitted(&self, task_id: &str, submitted_at: &str) -> ServiceResult<usize> {
        let conn = self.lock()?;
        Ok(conn.execute(
            "UPDATE tasks SET status = 'submitted', submitted_at = ?1
             WHERE task_id = ?2 AND status = 'accepted'",
            params![submitted_at, task_id],
        )?)
    }

    /// Compare-and-set `submitted -> approved`. `escrow_pending` marks a
    /// deadline-driven approval whose release has not yet landed.
    pub fn mark_approved(
        &self,
        task_id: &str,
        approved_at: &str,
        escrow_pending: bool,
    ) -> ServiceResult<usize> {
        let conn = self.lock()?;
        Ok(conn.execute(
            "UPDATE tasks SET status = 'approved', approved_at = ?1, escrow_pending = ?2
             WHERE task_id = ?3 AND status = 'submitted'",
            params![approved_at, escrow_pending as i64, task_id],
        )?)
    }

    /// Compare-and-set `submitted -> disputed`
    pub fn mark_disputed(
        &self,
        task_id: &str,
        reason: &str,
        disputed_at: &str,
    ) -> ServiceResult<usize> {
        let conn = self.lock()?;
        Ok(conn.execute(
            "UPDATE tasks SET status = 'disputed', dispute_reason = ?1, disputed_at = ?2
             WHERE task_id = ?3 AND status = 'submitted'",
            params![reason, disputed_at, task_id],
        )?)
    }

    /// Compare-and-set `disputed -> ruled`
    pub fn mark_ruled(
        &self,
        task_id: &str,
        ruling_id: &str,
        worker_pct: i64,
        ruling_summary: &str,
        ruled_at: &str,
    ) -> ServiceResult<usize> {
        let conn = self.lock()?;
        Ok(conn.execute(
            "UPDATE tasks SET status = 'ruled', ruling_id = ?1, worker_pct = ?2,
                              ruling_summary = ?3, ruled_at = ?4
             WHERE task_id = ?5 AND status = 'disputed'",
            params![ruling_id, worker_pct, ruling_summary, ruled_at, task_id],
        )?)
    }

    /// Compare-and-set into `expired` from the given live status
    pub fn mark_expired(
        &self,
        task_id: &str,
        expired_at: &str,
        expected_status: TaskStatus,
    ) -> ServiceResult<usize> {
        let conn = self.lock()?;
        Ok(conn.execute(
            "UPDATE tasks SET status = 'expired', expired_at = ?1, escrow_pending = 1
             WHERE task_id = ?2 AND status = ?3",
            params![expired_at, task_id, expected_status.as_str()],
        )?)
    }

    pub fn set_escrow_pending(&self, task_id: &str, pending: bool) -> ServiceResult<usize> {
        let conn = self.lock()?;
        Ok(conn.execute(
            "UPDATE tasks SET escrow_pending = ?1 WHERE task_id = ?2",
            params![pending as i64, task_id],
        )?)
    }

    /// Insert a bid and bump the task's bid counter atomically
    pub fn insert_bid(&self, bid: &Bid) -> ServiceResult<()> {
        let mut conn = self.lock()?;
        db::immediate(&mut conn, |tx| {
            let inserted = tx.execute(
                "INSERT INTO bids (bid_id, task_id, bidder_id, amount, submitted_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    bid.bid_id,
                    bid.task_id,
                    bid.bidder_id,
                    bid.amount,
                    bid.submitted_at
                ],
            );
            match inserted {
                Ok(_) => {}
                Err(err)
                    if err.sqlite_error_code()
                        == Some(rusqlite::ErrorCode::ConstraintViolation) =>
                {
                    return Err(ServiceError::conflict(
                        "BID_EXISTS",
                        "This agent has already bid on the task",
                    ));
                }
                Err(err) => return Err(err.into()),
            }
            tx.execute(
                "UPDATE tasks SET bid_count = bid_count + 1 WHERE task_id = ?1",
                params![bid.task_id],
            )?;
            Ok(())
        })
    }

    pub fn get_bid(&self, task_id: &str, bid_id: &str) -> ServiceResult<Option<Bid>> {
        let conn = self.lock()?;
        Ok(conn
            .query_row(
                "SELECT bid_id, task_id, bidder_id, amount, submitted_at
                 FROM bids WHERE bid_id = ?1 AND task_id = ?2",
                params![bid_id, task_id],
                bid_from_row,
            )
            .optional()?)
    }

    pub fn list_bids(&self, task_id: &str) -> ServiceResult<Vec<Bid>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT bid_id, task_id, bidder_id, amount, submitted_at
             FROM bids WHERE task_id = ?1 ORDER BY submitted_at, bid_id",
        )?;
        let rows = stmt.query_map(params![task_id], bid_from_row)?;
        let mut bids = Vec::new();
        for row in rows {
            bids.push(row?);
        }
        Ok(bids)
    }

    pub fn insert_asset(&self, asset: &Asset) -> ServiceResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO assets (asset_id, task_id, uploader_id, filename, content_type,
                                 size_bytes, content_hash, uploaded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                asset.asset_id,
                asset.task_id,
                asset.uploader_id,
                asset.filename,
                asset.content_type,
                asset.size_bytes,
                asset.content_hash,
                asset.uploaded_at
            ],
        )?;
        Ok(())
    }

    pub fn get_asset(&self, task_id: &str, asset_id: &str) -> ServiceResult<Option<Asset>> {
        let conn = self.lock()?;
        Ok(conn
            .query_row(
                "SELECT asset_id, task_id, uploader_id, filename, content_type, size_bytes,
                        content_hash, uploaded_at
                 FROM assets WHERE asset_id = ?1 AND task_id = ?2",
                params![asset_id, task_id],
                asset_from_row,
            )
            .optional()?)
    }

    pub fn list_assets(&self, task_id: &str) -> ServiceResult<Vec<Asset>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT asset_id, task_id, uploader_id, filename, content_type, size_bytes,
                    content_hash, uploaded_at
             FROM assets WHERE task_id = ?1 ORDER BY uploaded_at, asset_id",
        )?;
        let rows = stmt.query_map(params![task_id], asset_from_row)?;
        let mut assets = Vec::new();
        for row in rows {
            assets.push(row?);
        }
        Ok(assets)
    }

    pub fn count_assets(&self, task_id: &str) -> ServiceResult<i64> {
        let conn = self.lock()?;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM assets WHERE task_id = ?1",
            params![task_id],
            |row| row.get(0),
        )?)
    }

    pub fn count_tasks(&self) -> ServiceResult<i64> {
        let conn = self.lock()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM tasks", [], |row| row.get(0))?)
    }

    pub fn count_open_tasks(&self) -> ServiceResult<i64> {
        let conn = self.lock()?;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM tasks WHERE status = 'open'",
            [],
            |row| row.get(0),
        )?)
    }
}

const TASK_COLUMNS: &str = "task_id, poster_id, title, spec, reward,
    bidding_deadline_seconds, execution_deadline_seconds, review_deadline_seconds,
    status, escrow_id, bid_count, worker_id, accepted_bid_id, dispute_reason,
    ruling_id, worker_pct, ruling_summary, escrow_pending, created_at, accepted_at,
    submitted_at, approved_at, cancelled_at, disputed_at, ruled_at, expired_at";

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<ServiceResult<Task>> {
    let status_raw: String = row.get(8)?;
    let escrow_pending: i64 = row.get(17)?;
    Ok(match TaskStatus::from_str(&status_raw) {
        Err(err) => Err(err),
        Ok(status) => Ok(Task {
            task_id: row.get(0)?,
            poster_id: row.get(1)?,
            title: row.get(2)?,
            spec: row.get(3)?,
            reward: row.get(4)?,
            bidding_deadline_seconds: row.get(5)?,
            execution_deadline_seconds: row.get(6)?,
            review_deadline_seconds: row.get(7)?,
            status,
            escrow_id: row.get(9)?,
            bid_count: row.get(10)?,
            worker_id: row.get(11)?,
            accepted_bid_id: row.get(12)?,
            dispute_reason: row.get(13)?,
            ruling_id: row.get(14)?,
            worker_pct: row.get(15)?,
            ruling_summary: row.get(16)?,
            escrow_pending: escrow_pending != 0,
            created_at: row.get(18)?,
            accepted_at: row.get(19)?,
            submitted_at: row.get(20)?,
            approved_at: row.get(21)?,
            cancelled_at: row.get(22)?,
            disputed_at: row.get(23)?,
            ruled_at: row.get(24)?,
            expired_at: row.get(25)?,
        }),
    })
}

fn bid_from_row(row: &Row<'_>) -> rusqlite::Result<Bid> {
    Ok(Bid {
        bid_id: row.get(0)?,
        task_id: row.get(1)?,
        bidder_id: row.get(2)?,
        amount: row.get(3)?,
        submitted_at: row.get(4)?,
    })
}

fn asset_from_row(row: &Row<'_>) -> rusqlite::Result<Asset> {
    Ok(Asset {
        asset_id: row.get(0)?,
        task_id: row.get(1)?,
        uploader_id: row.get(2)?,
        filename: row.get(3)?,
        content_type: row.get(4)?,
        size_bytes: row.get(5)?,
        content_hash: row.get(6)?,
        uploaded_at: row.get(7)?,
    })
}

impl Task {
    /// Fresh task in `open` status, before persistence
    pub fn new_open(
        task_id: String,
        poster_id: String,
        title: String,
        spec: String,
        reward: i64,
        bidding_deadline_seconds: i64,
        execution_deadline_seconds: i64,
        review_deadline_seconds: i64,
        escrow_id: String,
    ) -> Self {
        Self {
            task_id,
            poster_id,
            title,
            spec,
            reward,
            bidding_deadline_seconds,
            execution_deadline_seconds,
            review_deadline_seconds,
            status: TaskStatus::Open,
            escrow_id,
            bid_count: 0,
            worker_id: None,
            accepted_bid_id: None,
            dispute_reason: None,
            ruling_id: None,
            worker_pct: None,
            ruling_summary: None,
            escrow_pending: false,
            created_at: now_iso(),
            accepted_at: None,
            submitted_at: None,
            approved_at: None,
            cancelled_at: None,
            disputed_at: None,
            ruled_at: None,
            expired_at: None,
        }
    }
}
