//! The ledger: authoritative accounting for accounts, transactions, and
//! escrow.
//!
//! Invariants enforced here, inside `BEGIN IMMEDIATE` transactions:
//! - balances never go negative (`INSUFFICIENT_FUNDS` before any debit)
//! - credits are exactly-once per `(account_id, reference)`
//! - escrow is keyed by `(payer_account_id, task_id)` and resolves at most
//!   once; release/split race through a status compare-and-set
//! - a resolved escrow pays out exactly its locked amount

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::Serialize;

use agora_core::db;
use agora_core::error::{ServiceError, ServiceResult};
use agora_core::ids::new_id;
use agora_core::time::now_iso;

#[derive(Debug, Clone, Serialize)]
pub struct Account {
    pub account_id: String,
    pub balance: i64,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransactionRecord {
    pub tx_id: String,
    pub account_id: String,
    #[serde(rename = "type")]
    pub tx_type: String,
    pub amount: i64,
    pub balance_after: i64,
    pub reference: String,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Escrow {
    pub escrow_id: String,
    pub payer_account_id: String,
    pub amount: i64,
    pub task_id: String,
    pub status: String,
    pub created_at: String,
    pub resolved_at: Option<String>,
}

/// Outcome of an idempotent write: the row plus whether it was new
#[derive(Debug)]
pub struct Applied<T> {
    pub record: T,
    pub created: bool,
}

pub struct Ledger {
    conn: Mutex<Connection>,
}

impl Ledger {
    pub fn open(path: &Path) -> ServiceResult<Self> {
        Self::with_connection(db::open(path)?)
    }

    pub fn open_in_memory() -> ServiceResult<Self> {
        Self::with_connection(db::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> ServiceResult<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS accounts (
                account_id TEXT PRIMARY KEY,
                balance INTEGER NOT NULL CHECK (balance >= 0),
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS transactions (
                tx_id TEXT PRIMARY KEY,
                account_id TEXT NOT NULL REFERENCES accounts(account_id),
                type TEXT NOT NULL CHECK (type IN ('credit', 'debit')),
                amount INTEGER NOT NULL CHECK (amount > 0),
                balance_after INTEGER NOT NULL,
                reference TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                UNIQUE (account_id, reference)
            );
            CREATE TABLE IF NOT EXISTS escrows (
                escrow_id TEXT PRIMARY KEY,
                payer_account_id TEXT NOT NULL REFERENCES accounts(account_id),
                amount INTEGER NOT NULL CHECK (amount >= 0),
                task_id TEXT NOT NULL,
                status TEXT NOT NULL CHECK (status IN ('locked', 'released', 'split')),
                created_at TEXT NOT NULL,
                resolved_at TEXT,
                UNIQUE (payer_account_id, task_id)
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> ServiceResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| ServiceError::internal("Ledger lock poisoned"))
    }

    /// Create an account, optionally seeded with an opening credit
    pub fn create_account(&self, account_id: &str, initial_balance: i64) -> ServiceResult<Account> {
        if initial_balance < 0 {
            return Err(ServiceError::invalid_payload(
                "initial_balance must be non-negative",
            ));
        }
        let mut conn = self.lock()?;
        db::immediate(&mut conn, |tx| {
            let exists: Option<String> = tx
                .query_row(
                    "SELECT account_id FROM accounts WHERE account_id = ?1",
                    params![account_id],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_some() {
                return Err(ServiceError::conflict(
                    "ACCOUNT_EXISTS",
                    "Account already exists",
                ));
            }

            let created_at = now_iso();
            tx.execute(
                "INSERT INTO accounts (account_id, balance, created_at) VALUES (?1, ?2, ?3)",
                params![account_id, initial_balance, created_at],
            )?;
            if initial_balance > 0 {
                insert_transaction(
                    tx,
                    account_id,
                    "credit",
                    initial_balance,
                    initial_balance,
                    "initial-balance",
                )?;
            }
            Ok(Account {
                account_id: account_id.to_string(),
                balance: initial_balance,
                created_at,
            })
        })
    }

    pub fn get_account(&self, account_id: &str) -> ServiceResult<Option<Account>> {
        let conn = self.lock()?;
        let account = conn
            .query_row(
                "SELECT account_id, balance, created_at FROM accounts WHERE account_id = ?1",
                params![account_id],
                |row| {
                    Ok(Account {
                        account_id: row.get(0)?,
                        balance: row.get(1)?,
                        created_at: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(account)
    }

    /// Platform-authorized credit, exactly-once per `(account, reference)`
    pub fn credit(
        &self,
        account_id: &str,
        amount: i64,
        reference: &str,
    ) -> ServiceResult<Applied<TransactionRecord>> {
        if amount <= 0 {
            return Err(ServiceError::invalid_payload("amount must be positive"));
        }
        if reference.trim().is_empty() {
            return Err(ServiceError::invalid_payload("reference is required"));
        }

        let mut conn = self.lock()?;
        db::immediate(&mut conn, |tx| {
            let balance = require_account_balance(tx, account_id)?;

            if let Some(existing) = find_transaction(tx, account_id, reference)? {
                if existing.tx_type == "credit" && existing.amount == amount {
                    return Ok(Applied {
                        record: existing,
                        created: false,
                    });
                }
                return Err(ServiceError::new(
                    "PAYLOAD_MISMATCH",
                    "A transaction with this reference exists with a different amount",
                    400,
                ));
            }

            let balance_after = balance + amount;
            tx.execute(
                "UPDATE accounts SET balance = ?1 WHERE account_id = ?2",
                params![balance_after, account_id],
            )?;
            let record =
                insert_transaction(tx, account_id, "credit", amount, balance_after, reference)?;
            Ok(Applied {
                record,
                created: true,
            })
        })
    }

    /// Transaction history, newest first
    pub fn transactions(&self, account_id: &str) -> ServiceResult<Vec<TransactionRecord>> {
        let conn = self.lock()?;
        let exists: Option<String> = conn
            .query_row(
                "SELECT account_id FROM accounts WHERE account_id = ?1",
                params![account_id],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Err(ServiceError::not_found(
                "ACCOUNT_NOT_FOUND",
                "Account not found",
            ));
        }

        let mut stmt = conn.prepare(
            "SELECT tx_id, account_id, type, amount, balance_after, reference, timestamp
             FROM transactions WHERE account_id = ?1 ORDER BY timestamp DESC, rowid DESC",
        )?;
        let rows = stmt.query_map(params![account_id], |row| {
            Ok(TransactionRecord {
                tx_id: row.get(0)?,
                account_id: row.get(1)?,
                tx_type: row.get(2)?,
                amount: row.get(3)?,
                balance_after: row.get(4)?,
                reference: row.get(5)?,
                timestamp: row.get(6)?,
            })
        })?;
        let mut transactions = Vec::new();
        for row in rows {
            transactions.push(row?);
        }
        Ok(transactions)
    }

    /// Atomically debit the payer and lock the funds for a task.
    ///
    /// Idempotent on `(payer, task_id)`: the same amount returns the
    /// existing escrow unchanged, a different amount conflicts.
    pub fn escrow_lock(
        &self,
        payer_account_id: &str,
        amount: i64,
        task_id: &str,
    ) -> ServiceResult<Applied<Escrow>> {
        if amount <= 0 {
            return Err(ServiceError::invalid_payload("amount must be positive"));
        }

        let mut conn = self.lock()?;
        db::immediate(&mut conn, |tx| {
            let balance = require_account_balance(tx, payer_account_id)?;

            if let Some(existing) = find_escrow_by_task(tx, payer_account_id, task_id)? {
                if existing.amount == amount {
                    return Ok(Applied {
                        record: existing,
                        created: false,
                    });
                }
                return Err(ServiceError::conflict(
                    "ESCROW_ALREADY_LOCKED",
                    "An escrow with a different amount is already locked for this task",
                ));
            }

            if balance < amount {
                return Err(ServiceError::new(
                    "INSUFFICIENT_FUNDS",
                    "Account balance cannot cover the escrow amount",
                    402,
                ));
            }

            let balance_after = balance - amount;
            tx.execute(
                "UPDATE accounts SET balance = ?1 WHERE account_id = ?2",
                params![balance_after, payer_account_id],
            )?;
            insert_transaction(
                tx,
                payer_account_id,
                "debit",
                amount,
                balance_after,
                &format!("escrow:{task_id}:lock"),
            )?;

            let escrow = Escrow {
                escrow_id: new_id("esc"),
                payer_account_id: payer_account_id.to_string(),
                amount,
                task_id: task_id.to_string(),
                status: "locked".to_string(),
                created_at: now_iso(),
                resolved_at: None,
            };
            tx.execute(
                "INSERT INTO escrows (escrow_id, payer_account_id, amount, task_id, status,
                                      created_at, resolved_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL)",
                params![
                    escrow.escrow_id,
                    escrow.payer_account_id,
                    escrow.amount,
                    escrow.task_id,
                    escrow.status,
                    escrow.created_at
                ],
            )?;
            Ok(Applied {
                record: escrow,
                created: true,
            })
        })
    }

    /// Release the full escrow amount to one recipient.
    ///
    /// The `locked -> released` flip is a compare-and-set; the loser of a
    /// race observes `ESCROW_ALREADY_RESOLVED`.
    pub fn escrow_release(&self, escrow_id: &str, recipient_id: &str) -> ServiceResult<Escrow> {
        let mut conn = self.lock()?;
        db::immediate(&mut conn, |tx| {
            let escrow = require_escrow(tx, escrow_id)?;
            let resolved_at = now_iso();

            let changed = tx.execute(
                "UPDATE escrows SET status = 'released', resolved_at = ?1
                 WHERE escrow_id = ?2 AND status = 'locked'",
                params![resolved_at, escrow_id],
            )?;
            if changed == 0 {
                return Err(ServiceError::conflict(
                    "ESCROW_ALREADY_RESOLVED",
                    "Escrow has already been released or split",
                ));
            }

            apply_credit(
                tx,
                recipient_id,
                escrow.amount,
                &format!("escrow:{escrow_id}:release"),
            )?;

            Ok(Escrow {
                status: "released".to_string(),
                resolved_at: Some(resolved_at),
                ..escrow
            })
        })
    }

    /// Split the escrow between worker and poster by an integer percentage.
    ///
    /// `worker_amount = amount * worker_pct / 100` truncated; the poster
    /// receives the remainder so the two legs sum exactly to the locked
    /// amount. A zero leg writes no transaction.
    pub fn escrow_split(
        &self,
        escrow_id: &str,
        worker_account_id: &str,
        poster_account_id: &str,
        worker_pct: i64,
    ) -> ServiceResult<Escrow> {
        if !(0..=100).contains(&worker_pct) {
            return Err(ServiceError::invalid_payload(
                "worker_pct must be between 0 and 100",
            ));
        }

        let mut conn = self.lock()?;
        db::immediate(&mut conn, |tx| {
            let escrow = require_escrow(tx, escrow_id)?;
            let resolved_at = now_iso();

            let changed = tx.execute(
                "UPDATE escrows SET status = 'split', resolved_at = ?1
                 WHERE escrow_id = ?2 AND status = 'locked'",
                params![resolved_at, escrow_id],
            )?;
            if changed == 0 {
                return Err(ServiceError::conflict(
                    "ESCROW_ALREADY_RESOLVED",
                    "Escrow has already been released or split",
                ));
            }

            let worker_amount = escrow.amount * worker_pct / 100;
            let poster_amount = escrow.amount - worker_amount;
            if worker_amount > 0 {
                apply_credit(
                    tx,
                    worker_account_id,
                    worker_amount,
                    &format!("escrow:{escrow_id}:worker"),
                )?;
            }
            if poster_amount > 0 {
                apply_credit(
                    tx,
                    poster_account_id,
                    poster_amount,
                    &format!("escrow:{escrow_id}:poster"),
                )?;
            }

            Ok(Escrow {
                status: "split".to_string(),
                resolved_at: Some(resolved_at),
                ..escrow
            })
        })
    }

    pub fn count_accounts(&self) -> ServiceResult<i64> {
        let conn = self.lock()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM accounts", [], |row| row.get(0))?)
    }

    pub fn count_escrows(&self) -> ServiceResult<i64> {
        let conn = self.lock()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM escrows", [], |row| row.get(0))?)
    }
}

fn require_account_balance(tx: &Transaction<'_>, account_id: &str) -> ServiceResult<i64> {
    tx.query_row(
        "SELECT balance FROM accounts WHERE account_id = ?1",
        params![account_id],
        |row| row.get(0),
    )
    .optional()?
    .ok_or_else(|| ServiceError::not_found("ACCOUNT_NOT_FOUND", "Account not found"))
}

fn require_escrow(tx: &Transaction<'_>, escrow_id: &str) -> ServiceResult<Escrow> {
    tx.query_row(
        "SELECT escrow_id, payer_account_id, amount, task_id, status, created_at, resolved_at
         FROM escrows WHERE escrow_id = ?1",
        params![escrow_id],
        |row| {
            Ok(Escrow {
                escrow_id: row.get(0)?,
                payer_account_id: row.get(1)?,
                amount: row.get(2)?,
                task_id: row.get(3)?,
                status: row.get(4)?,
                created_at: row.get(5)?,
                resolved_at: row.get(6)?,
            })
        },
    )
    .optional()?
    .ok_or_else(|| ServiceError::not_found("ESCROW_NOT_FOUND", "Escrow not found"))
}

fn find_escrow_by_task(
    tx: &Transaction<'_>,
    payer_account_id: &str,
    task_id: &str,
) -> ServiceResult<Option<Escrow>> {
    Ok(tx
        .query_row(
            "SELECT escrow_id, payer_account_id, amount, task_id, status, created_at, resolved_at
             FROM escrows WHERE payer_account_id = ?1 AND task_id = ?2",
            params![payer_account_id, task_id],
            |row| {
                Ok(Escrow {
                    escrow_id: row.get(0)?,
                    payer_account_id: row.get(1)?,
                    amount: row.get(2)?,
                    task_id: row.get(3)?,
                    status: row.get(4)?,
                    created_at: row.get(5)?,
                    resolved_at: row.get(6)?,
                })
            },
        )
        .optional()?)
}

fn find_transaction(
    tx: &Transaction<'_>,
    account_id: &str,
    reference: &str,
) -> ServiceResult<Option<TransactionRecord>> {
    Ok(tx
        .query_row(
            "SELECT tx_id, account_id, type, amount, balance_after, reference, timestamp
             FROM transactions WHERE account_id = ?1 AND reference = ?2",
            params![account_id, reference],
            |row| {
                Ok(TransactionRecord {
                    tx_id: row.get(0)?,
                    account_id: row.get(1)?,
                    tx_type: row.get(2)?,
                    amount: row.get(3)?,
                    balance_after: row.get(4)?,
                    reference: row.get(5)?,
                    timestamp: row.get(6)?,
                })
            },
        )
        .optional()?)
}

/// Credit an existing account inside the caller's transaction
fn apply_credit(
    tx: &Transaction<'_>,
    account_id: &str,
    amount: i64,
    reference: &str,
) -> ServiceResult<TransactionRecord> {
    let balance = require_account_balance(tx, account_id)?;
    let balance_after = balance + amount;
    tx.execute(
        "UPDATE accounts SET balance = ?1 WHERE account_id = ?2",
        params![balance_after, account_id],
    )?;
    insert_transaction(tx, account_id, "credit", amount, balance_after, reference)
}

fn insert_transaction(
    tx: &Transaction<'_>,
    account_id: &str,
    tx_type: &str,
    amount: i64,
    balance_after: i64,
    reference: &str,
) -> ServiceResult<TransactionRecord> {
    let record = TransactionRecord {
        tx_id: new_id("tx"),
        account_id: account_id.to_string(),
        tx_type: tx_type.to_string(),
        amount,
        balance_after,
        reference: reference.to_string(),
        timestamp: now_iso(),
    };
    tx.execute(
        "INSERT INTO transactions (tx_id, account_id, type, amount, balance_after, reference,
                                   timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            record.tx_id,
            record.account_id,
            record.tx_type,
            record.amount,
            record.balance_after,
            record.reference,
            record.timestamp
        ],
    )?;
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger() -> Ledger {
        Ledger::open_in_memory().unwrap()
    }

    #[test]
    fn create_account_is_unique() {
        let ledger = ledger();
        ledger.create_account("a-alice", 5000).unwrap();
        let err = ledger.create_account("a-alice", 0).unwrap_err();
        assert_eq!(err.code, "ACCOUNT_EXISTS");
        assert_eq!(err.status, 409);
    }

    #[test]
    fn seeded_account_records_opening_credit() {
        let ledger = ledger();
        ledger.create_account("a-alice", 5000).unwrap();
        let txs = ledger.transactions("a-alice").unwrap();
        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0].tx_type, "credit");
        assert_eq!(txs[0].amount, 5000);
        assert_eq!(txs[0].balance_after, 5000);
    }

    #[test]
    fn credit_is_idempotent_by_reference() {
        let ledger = ledger();
        ledger.create_account("a-test", 0).unwrap();

        let first = ledger.credit("a-test", 10, "salary_round_1").unwrap();
        let second = ledger.credit("a-test", 10, "salary_round_1").unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(second.record, first.record);
        assert_eq!(ledger.get_account("a-test").unwrap().unwrap().balance, 10);
    }

    #[test]
    fn credit_same_reference_different_amount_fails_fast() {
        let ledger = ledger();
        ledger.create_account("a-test", 0).unwrap();
        ledger.credit("a-test", 10, "salary_round_1").unwrap();

        let err = ledger.credit("a-test", 11, "salary_round_1").unwrap_err();
        assert_eq!(err.code, "PAYLOAD_MISMATCH");
        assert_eq!(err.status, 400);
        assert_eq!(ledger.get_account("a-test").unwrap().unwrap().balance, 10);
    }

    #[test]
    fn credit_unknown_account_is_404() {
        let err = ledger().credit("a-ghost", 10, "r").unwrap_err();
        assert_eq!(err.code, "ACCOUNT_NOT_FOUND");
    }

    #[test]
    fn escrow_lock_debits_and_is_idempotent() {
        let ledger = ledger();
        ledger.create_account("a-payer", 100).unwrap();

        let first = ledger.escrow_lock("a-payer", 50, "t-001").unwrap();
        let second = ledger.escrow_lock("a-payer", 50, "t-001").unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(second.record.escrow_id, first.record.escrow_id);
        assert_eq!(ledger.get_account("a-payer").unwrap().unwrap().balance, 50);
    }

    #[test]
    fn escrow_lock_different_amount_conflicts_without_debit() {
        let ledger = ledger();
        ledger.create_account("a-payer", 100).unwrap();
        ledger.escrow_lock("a-payer", 50, "t-001").unwrap();

        let err = ledger.escrow_lock("a-payer", 60, "t-001").unwrap_err();
        assert_eq!(err.code, "ESCROW_ALREADY_LOCKED");
        assert_eq!(err.status, 409);
        assert_eq!(ledger.get_account("a-payer").unwrap().unwrap().balance, 50);
    }

    #[test]
    fn escrow_lock_insufficient_funds() {
        let ledger = ledger();
        ledger.create_account("a-payer", 40).unwrap();

        let err = ledger.escrow_lock("a-payer", 50, "t-001").unwrap_err();
        assert_eq!(err.code, "INSUFFICIENT_FUNDS");
        assert_eq!(err.status, 402);
        assert_eq!(ledger.get_account("a-payer").unwrap().unwrap().balance, 40);
    }

    #[test]
    fn release_pays_recipient_once() {
        let ledger = ledger();
        ledger.create_account("a-payer", 100).unwrap();
        ledger.create_account("a-worker", 0).unwrap();
        let escrow = ledger.escrow_lock("a-payer", 50, "t-rel").unwrap().record;

        let released = ledger.escrow_release(&escrow.escrow_id, "a-worker").unwrap();
        assert_eq!(released.status, "released");
        assert!(released.resolved_at.is_some());
        assert_eq!(ledger.get_account("a-worker").unwrap().unwrap().balance, 50);

        let err = ledger
            .escrow_release(&escrow.escrow_id, "a-worker")
            .unwrap_err();
        assert_eq!(err.code, "ESCROW_ALREADY_RESOLVED");
        assert_eq!(ledger.get_account("a-worker").unwrap().unwrap().balance, 50);
    }

    #[test]
    fn release_to_missing_recipient_leaves_escrow_locked() {
        let ledger = ledger();
        ledger.create_account("a-payer", 100).unwrap();
        let escrow = ledger.escrow_lock("a-payer", 50, "t-x").unwrap().record;

        let err = ledger.escrow_release(&escrow.escrow_id, "a-ghost").unwrap_err();
        assert_eq!(err.code, "ACCOUNT_NOT_FOUND");

        // The compare-and-set rolled back with the failed credit.
        let retried = ledger.escrow_release(&escrow.escrow_id, "a-payer").unwrap();
        assert_eq!(retried.status, "released");
    }

    #[test]
    fn split_pieces_sum_to_locked_amount() {
        let ledger = ledger();
        ledger.create_account("a-poster", 100).unwrap();
        ledger.create_account("a-worker", 0).unwrap();
        let escrow = ledger.escrow_lock("a-poster", 100, "t-split").unwrap().record;

        let split = ledger
            .escrow_split(&escrow.escrow_id, "a-worker", "a-poster", 40)
            .unwrap();
        assert_eq!(split.status, "split");
        assert_eq!(ledger.get_account("a-worker").unwrap().unwrap().balance, 40);
        assert_eq!(ledger.get_account("a-poster").unwrap().unwrap().balance, 60);

        let err = ledger
            .escrow_split(&escrow.escrow_id, "a-worker", "a-poster", 40)
            .unwrap_err();
        assert_eq!(err.code, "ESCROW_ALREADY_RESOLVED");
    }

    #[test]
    fn split_truncates_in_workers_disfavor() {
        let ledger = ledger();
        ledger.create_account("a-poster", 500).unwrap();
        ledger.create_account("a-worker", 0).unwrap();
        let escrow = ledger.escrow_lock("a-poster", 500, "t-odd").unwrap().record;

        // 500 * 33 / 100 = 165, poster keeps 335; total stays 500.
        ledger
            .escrow_split(&escrow.escrow_id, "a-worker", "a-poster", 33)
            .unwrap();
        assert_eq!(ledger.get_account("a-worker").unwrap().unwrap().balance, 165);
        assert_eq!(ledger.get_account("a-poster").unwrap().unwrap().balance, 335);
    }

    #[test]
    fn split_zero_pct_returns_everything_to_poster() {
        let ledger = ledger();
        ledger.create_account("a-poster", 100).unwrap();
        ledger.create_account("a-worker", 0).unwrap();
        let escrow = ledger.escrow_lock("a-poster", 100, "t-zero").unwrap().record;

        ledger
            .escrow_split(&escrow.escrow_id, "a-worker", "a-poster", 0)
            .unwrap();
        assert_eq!(ledger.get_account("a-worker").unwrap().unwrap().balance, 0);
        assert_eq!(ledger.get_account("a-poster").unwrap().unwrap().balance, 100);
        // No zero-amount transaction row was written for the worker.
        assert!(ledger.transactions("a-worker").unwrap().is_empty());
    }

    #[test]
    fn concurrent_release_has_exactly_one_winner() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bank.db");

        let ledger_a = Ledger::open(&path).unwrap();
        ledger_a.create_account("a-payer", 100).unwrap();
        ledger_a.create_account("a-worker", 0).unwrap();
        let escrow = ledger_a.escrow_lock("a-payer", 50, "t-race").unwrap().record;

        let escrow_id = escrow.escrow_id.clone();
        let path_b = path.clone();
        let handle = std::thread::spawn(move || {
            let ledger_b = Ledger::open(&path_b).unwrap();
            ledger_b.escrow_release(&escrow_id, "a-worker")
        });
        let local = ledger_a.escrow_release(&escrow.escrow_id, "a-worker");
        let remote = handle.join().unwrap();

        let successes = [local.is_ok(), remote.is_ok()]
            .iter()
            .filter(|ok| **ok)
            .count();
        assert_eq!(successes, 1);
        let loser = if local.is_err() { local } else { remote };
        assert_eq!(loser.unwrap_err().code, "ESCROW_ALREADY_RESOLVED");
        assert_eq!(ledger_a.get_account("a-worker").unwrap().unwrap().balance, 50);
    }

    #[test]
    fn ledger_conservation_across_lifecycle() {
        let ledger = ledger();
        ledger.create_account("a-alice", 5000).unwrap();
        ledger.create_account("a-bob", 0).unwrap();

        let escrow = ledger.escrow_lock("a-alice", 500, "t-5").unwrap().record;
        let alice = ledger.get_account("a-alice").unwrap().unwrap().balance;
        let bob = ledger.get_account("a-bob").unwrap().unwrap().balance;
        assert_eq!(alice + bob + escrow.amount, 5000);

        ledger
            .escrow_split(&escrow.escrow_id, "a-bob", "a-alice", 70)
            .unwrap();
        let alice = ledger.get_account("a-alice").unwrap().unwrap().balance;
        let bob = ledger.get_account("a-bob").unwrap().unwrap().balance;
        assert_eq!(alice, 4650);
        assert_eq!(bob, 350);
        assert_eq!(alice + bob, 5000);
    }
}
