use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use rusqlite::{params, types::Type, Connection, ErrorCode, OptionalExtension, Row};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use walletd_core::{
    Account, AccountId, JournalEntry, JournalKind, LedgerStore, NewJournalEntry, StorageError,
    UnitOfWork,
};

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

const ACCOUNT_COLUMNS: &str = "id, username, balance";
const JOURNAL_COLUMNS: &str = "id, account_id, amount, kind, created_at";

/// SQLite-backed ledger.
///
/// A single connection serves the process. A unit of work holds it for its
/// whole lifetime inside a `BEGIN IMMEDIATE` transaction, so writers are
/// serialized and every row a unit touches is effectively locked.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    lock_timeout: Duration,
}

impl SqliteStore {
    pub fn new(path: &str) -> Result<Self, StorageError> {
        Self::with_lock_timeout(path, DEFAULT_LOCK_TIMEOUT)
    }

    pub fn with_lock_timeout(path: &str, lock_timeout: Duration) -> Result<Self, StorageError> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()
        } else {
            Connection::open(path)
        }
        .map_err(|e| StorageError::Unavailable(e.to_string()))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(map_err)?;
        conn.busy_timeout(lock_timeout).map_err(map_err)?;

        let storage = Self {
            conn: Mutex::new(conn),
            lock_timeout,
        };
        storage.init_schema()?;
        Ok(storage)
    }

    fn init_schema(&self) -> Result<(), StorageError> {
        let conn = self.connection()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS accounts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT NOT NULL UNIQUE,
                balance REAL NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS journal (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id INTEGER NOT NULL,
                amount REAL NOT NULL,
                kind TEXT NOT NULL CHECK (kind IN ('deposit', 'withdraw', 'transfer')),
                created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
                FOREIGN KEY (account_id) REFERENCES accounts(id)
            );

            CREATE INDEX IF NOT EXISTS idx_journal_account
                ON journal(account_id, id);
            ",
        )
        .map_err(map_err)?;
        Ok(())
    }

    fn connection(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn
            .try_lock_for(self.lock_timeout)
            .ok_or(StorageError::LockTimeout)
    }
}

fn map_err(e: rusqlite::Error) -> StorageError {
    match e.sqlite_error_code() {
        Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
            StorageError::LockTimeout
        }
        Some(ErrorCode::CannotOpen) | Some(ErrorCode::NotADatabase) => {
            StorageError::Unavailable(e.to_string())
        }
        _ => StorageError::Other(e.to_string()),
    }
}

fn account_from_row(row: &Row) -> rusqlite::Result<Account> {
    Ok(Account {
        id: row.get(0)?,
        username: row.get(1)?,
        balance: row.get(2)?,
    })
}

fn journal_from_row(row: &Row) -> rusqlite::Result<JournalEntry> {
    let kind: String = row.get(3)?;
    let created_at: String = row.get(4)?;
    Ok(JournalEntry {
        id: row.get(0)?,
        account_id: row.get(1)?,
        amount: row.get(2)?,
        kind: kind.parse::<JournalKind>().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(3, Type::Text, e.into())
        })?,
        created_at: OffsetDateTime::parse(&created_at, &Rfc3339).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e))
        })?,
    })
}

fn select_account_by_username(
    conn: &Connection,
    username: &str,
) -> Result<Option<Account>, StorageError> {
    conn.query_row(
        &format!("SELECT {} FROM accounts WHERE username = ?1", ACCOUNT_COLUMNS),
        params![username],
        account_from_row,
    )
    .optional()
    .map_err(map_err)
}

impl LedgerStore for SqliteStore {
    fn begin(&self) -> Result<Box<dyn UnitOfWork + '_>, StorageError> {
        let conn = self.connection()?;
        conn.execute_batch("BEGIN IMMEDIATE").map_err(map_err)?;
        tracing::debug!("SQLite transaction started");
        Ok(Box::new(SqliteUnitOfWork {
            conn,
            finished: false,
        }))
    }

    fn find_account(&self, username: &str) -> Result<Option<Account>, StorageError> {
        let conn = self.connection()?;
        select_account_by_username(&conn, username)
    }

    fn history(&self, account_id: AccountId) -> Result<Vec<JournalEntry>, StorageError> {
        let conn = self.connection()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM journal WHERE account_id = ?1 ORDER BY id",
                JOURNAL_COLUMNS
            ))
            .map_err(map_err)?;
        let rows = stmt
            .query_map(params![account_id], journal_from_row)
            .map_err(map_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(map_err)?;
        Ok(rows)
    }

    fn create_account(
        &self,
        username: &str,
        opening_balance: f64,
    ) -> Result<Account, StorageError> {
        let conn = self.connection()?;
        conn.query_row(
            &format!(
                "INSERT INTO accounts (username, balance) VALUES (?1, ?2) RETURNING {}",
                ACCOUNT_COLUMNS
            ),
            params![username, opening_balance],
            account_from_row,
        )
        .map_err(|e| match e.sqlite_error_code() {
            Some(ErrorCode::ConstraintViolation) => {
                StorageError::AccountExists(username.to_string())
            }
            _ => map_err(e),
        })
    }

    fn ping(&self) -> Result<(), StorageError> {
        let conn = self.connection()?;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;
        Ok(())
    }
}

struct SqliteUnitOfWork<'a> {
    conn: MutexGuard<'a, Connection>,
    finished: bool,
}

impl SqliteUnitOfWork<'_> {
    fn update_returning(
        &mut self,
        sql: &str,
        id: AccountId,
        amount: f64,
    ) -> Result<Option<Account>, StorageError> {
        self.conn
            .query_row(sql, params![amount, id], account_from_row)
            .optional()
            .map_err(map_err)
    }
}

impl UnitOfWork for SqliteUnitOfWork<'_> {
    fn find_account(&mut self, username: &str) -> Result<Option<Account>, StorageError> {
        select_account_by_username(&self.conn, username)
    }

    fn lock_account(&mut self, id: AccountId) -> Result<Option<Account>, StorageError> {
        // BEGIN IMMEDIATE already holds the database write lock.
        self.conn
            .query_row(
                &format!("SELECT {} FROM accounts WHERE id = ?1", ACCOUNT_COLUMNS),
                params![id],
                account_from_row,
            )
            .optional()
            .map_err(map_err)
    }

    fn credit(&mut self, id: AccountId, amount: f64) -> Result<Option<Account>, StorageError> {
        self.update_returning(
            &format!(
                "UPDATE accounts SET balance = balance + ?1 WHERE id = ?2 RETURNING {}",
                ACCOUNT_COLUMNS
            ),
            id,
            amount,
        )
    }

    fn debit(&mut self, id: AccountId, amount: f64) -> Result<Option<Account>, StorageError> {
        self.update_returning(
            &format!(
                "UPDATE accounts SET balance = balance - ?1 \
                 WHERE id = ?2 AND balance >= ?1 RETURNING {}",
                ACCOUNT_COLUMNS
            ),
            id,
            amount,
        )
    }

    fn append_journal(&mut self, entry: &NewJournalEntry) -> Result<JournalEntry, StorageError> {
        self.conn
            .query_row(
                &format!(
                    "INSERT INTO journal (account_id, amount, kind) \
                     VALUES (?1, ?2, ?3) RETURNING {}",
                    JOURNAL_COLUMNS
                ),
                params![entry.account_id, entry.amount, entry.kind.as_str()],
                journal_from_row,
            )
            .map_err(map_err)
    }

    fn commit(mut self: Box<Self>) -> Result<(), StorageError> {
        self.conn.execute_batch("COMMIT").map_err(map_err)?;
        self.finished = true;
        tracing::debug!("SQLite transaction committed");
        Ok(())
    }

    fn rollback(mut self: Box<Self>) -> Result<(), StorageError> {
        self.finished = true;
        self.conn.execute_batch("ROLLBACK").map_err(map_err)?;
        tracing::debug!("SQLite transaction rolled back");
        Ok(())
    }
}

impl Drop for SqliteUnitOfWork<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(e) = self.conn.execute_batch("ROLLBACK") {
            tracing::warn!(error = %e, "SQLite rollback on drop failed");
        } else {
            tracing::debug!("SQLite transaction dropped, rolled back");
        }
    }
}
