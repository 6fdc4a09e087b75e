//! In-memory backends for walletd.
//!
//! `MemoryStore` keeps row-lock semantics close to a relational store:
//! each account row has its own exclusive lock, taken by `lock_account`,
//! `credit` and `debit`, and held until the unit of work ends. Writes are
//! buffered in the unit of work and applied atomically on commit.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use parking_lot::{lock_api::ArcMutexGuard, Mutex, RawMutex, RwLock};
use time::OffsetDateTime;

use walletd_core::{
    Account, AccountId, BalanceCache, CacheError, JournalEntry, LedgerStore, NewJournalEntry,
    StorageError, UnitOfWork,
};

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

struct AccountRow {
    username: String,
    balance: f64,
}

struct Tables {
    accounts: BTreeMap<AccountId, AccountRow>,
    by_username: HashMap<String, AccountId>,
    journal: Vec<JournalEntry>,
    next_account_id: AccountId,
}

impl Tables {
    fn account(&self, id: AccountId) -> Option<Account> {
        self.accounts.get(&id).map(|row| Account {
            id,
            username: row.username.clone(),
            balance: row.balance,
        })
    }
}

pub struct MemoryStore {
    tables: RwLock<Tables>,
    row_locks: Mutex<HashMap<AccountId, Arc<Mutex<()>>>>,
    journal_seq: AtomicI64,
    tx_counter: AtomicU64,
    lock_timeout: Duration,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_lock_timeout(DEFAULT_LOCK_TIMEOUT)
    }

    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        Self {
            tables: RwLock::new(Tables {
                accounts: BTreeMap::new(),
                by_username: HashMap::new(),
                journal: Vec::new(),
                next_account_id: 1,
            }),
            row_locks: Mutex::new(HashMap::new()),
            journal_seq: AtomicI64::new(1),
            tx_counter: AtomicU64::new(1),
            lock_timeout,
        }
    }

    fn row_lock(&self, id: AccountId) -> Arc<Mutex<()>> {
        self.row_locks
            .lock()
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

impl LedgerStore for MemoryStore {
    fn begin(&self) -> Result<Box<dyn UnitOfWork + '_>, StorageError> {
        let tx_id = self.tx_counter.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(tx_id, "Memory transaction started");
        Ok(Box::new(MemoryUnitOfWork {
            store: self,
            tx_id,
            held: BTreeMap::new(),
            deltas: BTreeMap::new(),
            journal: Vec::new(),
            finished: false,
        }))
    }

    fn find_account(&self, username: &str) -> Result<Option<Account>, StorageError> {
        let tables = self.tables.read();
        Ok(tables
            .by_username
            .get(username)
            .and_then(|id| tables.account(*id)))
    }

    fn history(&self, account_id: AccountId) -> Result<Vec<JournalEntry>, StorageError> {
        let tables = self.tables.read();
        let mut entries: Vec<JournalEntry> = tables
            .journal
            .iter()
            .filter(|e| e.account_id == account_id)
            .cloned()
            .collect();
        // Units of work may commit out of id order.
        entries.sort_by_key(|e| e.id);
        Ok(entries)
    }

    fn create_account(
        &self,
        username: &str,
        opening_balance: f64,
    ) -> Result<Account, StorageError> {
        let mut tables = self.tables.write();
        if tables.by_username.contains_key(username) {
            return Err(StorageError::AccountExists(username.to_string()));
        }
        let id = tables.next_account_id;
        tables.next_account_id += 1;
        tables.accounts.insert(
            id,
            AccountRow {
                username: username.to_string(),
                balance: opening_balance,
            },
        );
        tables.by_username.insert(username.to_string(), id);
        Ok(Account {
            id,
            username: username.to_string(),
            balance: opening_balance,
        })
    }

    fn ping(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

struct MemoryUnitOfWork<'a> {
    store: &'a MemoryStore,
    tx_id: u64,
    held: BTreeMap<AccountId, ArcMutexGuard<RawMutex, ()>>,
    deltas: BTreeMap<AccountId, f64>,
    journal: Vec<JournalEntry>,
    finished: bool,
}

impl MemoryUnitOfWork<'_> {
    /// Committed row overlaid with this unit's own pending delta.
    fn view(&self, id: AccountId) -> Option<Account> {
        let mut account = self.store.tables.read().account(id)?;
        if let Some(delta) = self.deltas.get(&id) {
            account.balance += delta;
        }
        Some(account)
    }

    fn acquire(&mut self, id: AccountId) -> Result<bool, StorageError> {
        if self.held.contains_key(&id) {
            return Ok(true);
        }
        if !self.store.tables.read().accounts.contains_key(&id) {
            return Ok(false);
        }
        let lock = self.store.row_lock(id);
        let guard = lock
            .try_lock_arc_for(self.store.lock_timeout)
            .ok_or(StorageError::LockTimeout)?;
        tracing::trace!(tx_id = self.tx_id, account_id = id, "Row lock acquired");
        self.held.insert(id, guard);
        Ok(true)
    }
}

impl UnitOfWork for MemoryUnitOfWork<'_> {
    fn find_account(&mut self, username: &str) -> Result<Option<Account>, StorageError> {
        let id = match self.store.tables.read().by_username.get(username) {
            Some(id) => *id,
            None => return Ok(None),
        };
        Ok(self.view(id))
    }

    fn lock_account(&mut self, id: AccountId) -> Result<Option<Account>, StorageError> {
        if !self.acquire(id)? {
            return Ok(None);
        }
        Ok(self.view(id))
    }

    fn credit(&mut self, id: AccountId, amount: f64) -> Result<Option<Account>, StorageError> {
        if !self.acquire(id)? {
            return Ok(None);
        }
        *self.deltas.entry(id).or_insert(0.0) += amount;
        Ok(self.view(id))
    }

    fn debit(&mut self, id: AccountId, amount: f64) -> Result<Option<Account>, StorageError> {
        if !self.acquire(id)? {
            return Ok(None);
        }
        match self.view(id) {
            Some(account) if account.balance >= amount => {
                *self.deltas.entry(id).or_insert(0.0) -= amount;
                Ok(self.view(id))
            }
            _ => Ok(None),
        }
    }

    fn append_journal(&mut self, entry: &NewJournalEntry) -> Result<JournalEntry, StorageError> {
        if !self.store.tables.read().accounts.contains_key(&entry.account_id) {
            return Err(StorageError::Other(format!(
                "journal references unknown account {}",
                entry.account_id
            )));
        }
        let written = JournalEntry {
            id: self.store.journal_seq.fetch_add(1, Ordering::SeqCst),
            account_id: entry.account_id,
            amount: entry.amount,
            kind: entry.kind,
            created_at: OffsetDateTime::now_utc(),
        };
        self.journal.push(written.clone());
        Ok(written)
    }

    fn commit(mut self: Box<Self>) -> Result<(), StorageError> {
        let store = self.store;
        {
            let mut tables = store.tables.write();
            for (id, delta) in &self.deltas {
                let row = tables
                    .accounts
                    .get_mut(id)
                    .ok_or_else(|| StorageError::Other(format!("account {} vanished", id)))?;
                row.balance += delta;
            }
            tables.journal.append(&mut self.journal);
        }
        self.finished = true;
        tracing::debug!(tx_id = self.tx_id, "Memory transaction committed");
        Ok(())
    }

    fn rollback(mut self: Box<Self>) -> Result<(), StorageError> {
        self.finished = true;
        tracing::debug!(tx_id = self.tx_id, "Memory transaction rolled back");
        Ok(())
    }
}

impl Drop for MemoryUnitOfWork<'_> {
    fn drop(&mut self) {
        if !self.finished {
            tracing::debug!(tx_id = self.tx_id, "Memory transaction dropped, discarding writes");
        }
        // Row guards in `held` are released here.
    }
}

/// Process-local `BalanceCache`.
#[derive(Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, (String, Option<Instant>)>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BalanceCache for MemoryCache {
    fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let entries = self.entries.read();
        Ok(match entries.get(key) {
            Some((_, Some(expires))) if *expires <= Instant::now() => None,
            Some((value, _)) => Some(value.clone()),
            None => None,
        })
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
        let expires = ttl.map(|ttl| Instant::now() + ttl);
        self.entries
            .write()
            .insert(key.to_string(), (value.to_string(), expires));
        Ok(())
    }

    fn delete(&self, keys: &[&str]) -> Result<(), CacheError> {
        let mut entries = self.entries.write();
        for key in keys {
            entries.remove(*key);
        }
        Ok(())
    }

    fn ping(&self) -> Result<(), CacheError> {
        Ok(())
    }
}
