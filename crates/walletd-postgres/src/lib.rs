use std::time::Duration;

use postgres::{error::SqlState, NoTls, Row};
use r2d2::{Pool, PooledConnection};
use r2d2_postgres::PostgresConnectionManager;
use time::OffsetDateTime;

use walletd_core::{
    Account, AccountId, JournalEntry, JournalKind, LedgerStore, NewJournalEntry, StorageError,
    UnitOfWork,
};

pub use postgres::config::{Config as PgConfig, SslMode};

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_POOL_SIZE: u32 = 10;

const ACCOUNT_COLUMNS: &str = "id, username, balance";
const JOURNAL_COLUMNS: &str = "id, account_id, amount, kind, created_at";

type PgPool = Pool<PostgresConnectionManager<NoTls>>;
type PgConnection = PooledConnection<PostgresConnectionManager<NoTls>>;

#[derive(Debug, Clone)]
pub struct PostgresOptions {
    pub pool_size: u32,
    /// Bounds both row-lock waits (`lock_timeout`) and pool checkout.
    pub lock_timeout: Duration,
}

impl Default for PostgresOptions {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }
}

/// PostgreSQL-backed ledger. Each unit of work owns one pooled connection
/// for its lifetime so that row locks are per transaction.
pub struct PostgresStore {
    pool: PgPool,
    lock_timeout: Duration,
}

impl PostgresStore {
    pub fn new(connection_string: &str) -> Result<Self, StorageError> {
        let config = connection_string
            .parse::<PgConfig>()
            .map_err(|e| StorageError::Other(format!("invalid connection string: {}", e)))?;
        Self::with_options(config, PostgresOptions::default())
    }

    pub fn with_options(config: PgConfig, options: PostgresOptions) -> Result<Self, StorageError> {
        let manager = PostgresConnectionManager::new(config, NoTls);
        let pool = Pool::builder()
            .max_size(options.pool_size.max(1))
            .connection_timeout(options.lock_timeout)
            .build(manager)
            .map_err(pool_err)?;
        let storage = Self {
            pool,
            lock_timeout: options.lock_timeout,
        };
        storage.init_schema()?;
        Ok(storage)
    }

    fn connection(&self) -> Result<PgConnection, StorageError> {
        self.pool.get().map_err(pool_err)
    }

    /// Opens a transaction and runs `setup` inside it. A failing `setup`
    /// rolls the transaction back before the connection returns to the pool.
    fn begin_with(&self, setup: &str) -> Result<PostgresUnitOfWork, StorageError> {
        let mut client = self.connection()?;
        client.batch_execute("BEGIN").map_err(map_err)?;
        let mut uow = PostgresUnitOfWork {
            client,
            finished: false,
        };
        uow.client.batch_execute(setup).map_err(map_err)?;
        Ok(uow)
    }

    fn init_schema(&self) -> Result<(), StorageError> {
        let mut client = self.connection()?;
        client
            .batch_execute(
                "
            CREATE TABLE IF NOT EXISTS accounts (
                id BIGSERIAL PRIMARY KEY,
                username TEXT NOT NULL UNIQUE,
                balance DOUBLE PRECISION NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS journal (
                id BIGSERIAL PRIMARY KEY,
                account_id BIGINT NOT NULL REFERENCES accounts(id),
                amount DOUBLE PRECISION NOT NULL,
                kind TEXT NOT NULL CHECK (kind IN ('deposit', 'withdraw', 'transfer')),
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            );

            CREATE INDEX IF NOT EXISTS idx_pg_journal_account
                ON journal(account_id, id);
            ",
            )
            .map_err(map_err)?;
        Ok(())
    }
}

fn pool_err(e: r2d2::Error) -> StorageError {
    StorageError::Unavailable(format!("PostgreSQL connection pool: {}", e))
}

fn map_err(e: postgres::Error) -> StorageError {
    if e.is_closed() {
        return StorageError::Unavailable(e.to_string());
    }
    match e.code() {
        Some(code) if *code == SqlState::LOCK_NOT_AVAILABLE => StorageError::LockTimeout,
        Some(code)
            if *code == SqlState::T_R_DEADLOCK_DETECTED
                || *code == SqlState::T_R_SERIALIZATION_FAILURE =>
        {
            StorageError::Conflict(e.to_string())
        }
        _ => StorageError::Other(e.to_string()),
    }
}

fn account_from_row(row: &Row) -> Account {
    Account {
        id: row.get(0),
        username: row.get(1),
        balance: row.get(2),
    }
}

fn journal_from_row(row: &Row) -> Result<JournalEntry, StorageError> {
    let kind: String = row.get(3);
    let created_at: OffsetDateTime = row.get(4);
    Ok(JournalEntry {
        id: row.get(0),
        account_id: row.get(1),
        amount: row.get(2),
        kind: kind.parse::<JournalKind>().map_err(StorageError::Other)?,
        created_at,
    })
}

impl LedgerStore for PostgresStore {
    fn begin(&self) -> Result<Box<dyn UnitOfWork + '_>, StorageError> {
        let uow = self.begin_with(&format!(
            "SET LOCAL lock_timeout = '{}ms'",
            self.lock_timeout.as_millis()
        ))?;
        tracing::debug!("PostgreSQL transaction started");
        Ok(Box::new(uow))
    }

    fn find_account(&self, username: &str) -> Result<Option<Account>, StorageError> {
        let mut client = self.connection()?;
        let row = client
            .query_opt(
                &format!("SELECT {} FROM accounts WHERE username = $1", ACCOUNT_COLUMNS),
                &[&username],
            )
            .map_err(map_err)?;
        Ok(row.as_ref().map(account_from_row))
    }

    fn history(&self, account_id: AccountId) -> Result<Vec<JournalEntry>, StorageError> {
        let mut client = self.connection()?;
        let rows = client
            .query(
                &format!(
                    "SELECT {} FROM journal WHERE account_id = $1 ORDER BY id",
                    JOURNAL_COLUMNS
                ),
                &[&account_id],
            )
            .map_err(map_err)?;
        rows.iter().map(journal_from_row).collect()
    }

    fn create_account(
        &self,
        username: &str,
        opening_balance: f64,
    ) -> Result<Account, StorageError> {
        let mut client = self.connection()?;
        client
            .query_one(
                &format!(
                    "INSERT INTO accounts (username, balance) VALUES ($1, $2) RETURNING {}",
                    ACCOUNT_COLUMNS
                ),
                &[&username, &opening_balance],
            )
            .map(|row| account_from_row(&row))
            .map_err(|e| match e.code() {
                Some(code) if *code == SqlState::UNIQUE_VIOLATION => {
                    StorageError::AccountExists(username.to_string())
                }
                _ => map_err(e),
            })
    }

    fn ping(&self) -> Result<(), StorageError> {
        let mut client = self.connection()?;
        client
            .simple_query("SELECT 1")
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;
        Ok(())
    }
}

struct PostgresUnitOfWork {
    client: PgConnection,
    finished: bool,
}

impl PostgresUnitOfWork {
    fn query_account(
        &mut self,
        sql: &str,
        id: AccountId,
        amount: Option<f64>,
    ) -> Result<Option<Account>, StorageError> {
        let row = match amount {
            Some(amount) => self.client.query_opt(sql, &[&amount, &id]),
            None => self.client.query_opt(sql, &[&id]),
        }
        .map_err(map_err)?;
        Ok(row.as_ref().map(account_from_row))
    }
}

impl UnitOfWork for PostgresUnitOfWork {
    fn find_account(&mut self, username: &str) -> Result<Option<Account>, StorageError> {
        let row = self
            .client
            .query_opt(
                &format!("SELECT {} FROM accounts WHERE username = $1", ACCOUNT_COLUMNS),
                &[&username],
            )
            .map_err(map_err)?;
        Ok(row.as_ref().map(account_from_row))
    }

    fn lock_account(&mut self, id: AccountId) -> Result<Option<Account>, StorageError> {
        self.query_account(
            &format!("SELECT {} FROM accounts WHERE id = $1 FOR UPDATE", ACCOUNT_COLUMNS),
            id,
            None,
        )
    }

    fn credit(&mut self, id: AccountId, amount: f64) -> Result<Option<Account>, StorageError> {
        self.query_account(
            &format!(
                "UPDATE accounts SET balance = balance + $1 WHERE id = $2 RETURNING {}",
                ACCOUNT_COLUMNS
            ),
            id,
            Some(amount),
        )
    }

    fn debit(&mut self, id: AccountId, amount: f64) -> Result<Option<Account>, StorageError> {
        self.query_account(
            &format!(
                "UPDATE accounts SET balance = balance - $1 \
                 WHERE id = $2 AND balance >= $1 RETURNING {}",
                ACCOUNT_COLUMNS
            ),
            id,
            Some(amount),
        )
    }

    fn append_journal(&mut self, entry: &NewJournalEntry) -> Result<JournalEntry, StorageError> {
        let row = self
            .client
            .query_one(
                &format!(
                    "INSERT INTO journal (account_id, amount, kind) \
                     VALUES ($1, $2, $3) RETURNING {}",
                    JOURNAL_COLUMNS
                ),
                &[&entry.account_id, &entry.amount, &entry.kind.as_str()],
            )
            .map_err(map_err)?;
        journal_from_row(&row)
    }

    fn commit(mut self: Box<Self>) -> Result<(), StorageError> {
        self.finished = true;
        self.client.batch_execute("COMMIT").map_err(map_err)?;
        tracing::debug!("PostgreSQL transaction committed");
        Ok(())
    }

    fn rollback(mut self: Box<Self>) -> Result<(), StorageError> {
        self.finished = true;
        self.client.batch_execute("ROLLBACK").map_err(map_err)?;
        tracing::debug!("PostgreSQL transaction rolled back");
        Ok(())
    }
}

impl Drop for PostgresUnitOfWork {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        // The connection goes back to the pool; it must not carry an open transaction.
        if let Err(e) = self.client.batch_execute("ROLLBACK") {
            tracing::warn!(error = %e, "PostgreSQL rollback on drop failed");
        }
    }
}
