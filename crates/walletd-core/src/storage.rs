use thiserror::Error;

use crate::models::{Account, AccountId, JournalEntry, NewJournalEntry};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{0}")]
    Other(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("timed out waiting for a row lock")]
    LockTimeout,
    #[error("transaction conflict: {0}")]
    Conflict(String),
    #[error("account already exists: {0}")]
    AccountExists(String),
}

impl StorageError {
    /// True when the store itself could not be reached, as opposed to a
    /// statement failing inside a live connection.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StorageError::Unavailable(_))
    }
}

/// Durable account and journal tables.
///
/// Reads outside a unit of work see committed state only. All balance
/// mutation goes through [`UnitOfWork`].
pub trait LedgerStore: Send + Sync {
    fn begin(&self) -> Result<Box<dyn UnitOfWork + '_>, StorageError>;
    fn find_account(&self, username: &str) -> Result<Option<Account>, StorageError>;
    /// Journal entries of one account, oldest first.
    fn history(&self, account_id: AccountId) -> Result<Vec<JournalEntry>, StorageError>;
    /// Provisioning path; never used by the mutation protocol.
    fn create_account(&self, username: &str, opening_balance: f64) -> Result<Account, StorageError>;
    fn ping(&self) -> Result<(), StorageError>;
}

/// One all-or-nothing group of store operations.
///
/// Dropping a unit of work that was neither committed nor rolled back
/// discards its writes and releases its row locks.
pub trait UnitOfWork {
    fn find_account(&mut self, username: &str) -> Result<Option<Account>, StorageError>;
    /// Exclusive row lock held until commit or rollback. Waits at most the
    /// store's lock timeout, then fails with `StorageError::LockTimeout`.
    fn lock_account(&mut self, id: AccountId) -> Result<Option<Account>, StorageError>;
    /// `balance = balance + amount`. `None` when no row matched.
    fn credit(&mut self, id: AccountId, amount: f64) -> Result<Option<Account>, StorageError>;
    /// `balance = balance - amount WHERE balance >= amount`. `None` when no
    /// row matched, including when the predicate failed.
    fn debit(&mut self, id: AccountId, amount: f64) -> Result<Option<Account>, StorageError>;
    fn append_journal(&mut self, entry: &NewJournalEntry) -> Result<JournalEntry, StorageError>;
    fn commit(self: Box<Self>) -> Result<(), StorageError>;
    fn rollback(self: Box<Self>) -> Result<(), StorageError>;
}
