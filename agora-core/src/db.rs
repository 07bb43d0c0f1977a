//! SQLite helpers shared by the service stores.
//!
//! Every service owns a single database file opened in WAL mode with a 5s
//! busy timeout. Logical mutations run inside `BEGIN IMMEDIATE` transactions
//! so balance checks and status compare-and-sets share one write lock even
//! across processes. Store methods are synchronous; request handlers move
//! them off the dispatcher with [`blocking`].

use std::fs;
use std::path::Path;
use std::time::Duration;

use rusqlite::{Connection, Transaction, TransactionBehavior};

use crate::error::{ServiceError, ServiceResult};

/// Open (creating parent directories as needed) and configure a database
pub fn open(path: &Path) -> ServiceResult<Connection> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|err| {
                ServiceError::internal(format!("Cannot create {}: {err}", parent.display()))
            })?;
        }
    }
    let conn = Connection::open(path)?;
    configure(&conn)?;
    Ok(conn)
}

/// Open an in-memory database (tests)
pub fn open_in_memory() -> ServiceResult<Connection> {
    let conn = Connection::open_in_memory()?;
    configure(&conn)?;
    Ok(conn)
}

fn configure(conn: &Connection) -> ServiceResult<()> {
    conn.busy_timeout(Duration::from_secs(5))?;
    // WAL cannot be enabled on in-memory databases; ignore the reported mode.
    let _mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(())
}

/// Run a closure inside a `BEGIN IMMEDIATE` transaction, committing on `Ok`
pub fn immediate<T>(
    conn: &mut Connection,
    op: impl FnOnce(&Transaction<'_>) -> ServiceResult<T>,
) -> ServiceResult<T> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let out = op(&tx)?;
    tx.commit()?;
    Ok(out)
}

/// Run synchronous store work on the blocking pool
pub async fn blocking<T, F>(op: F) -> ServiceResult<T>
where
    F: FnOnce() -> ServiceResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(op)
        .await
        .map_err(|err| ServiceError::internal(format!("Blocking task failed: {err}")))?
}
