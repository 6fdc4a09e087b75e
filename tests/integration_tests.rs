use std::{
    sync::{Arc, Barrier},
    thread,
    time::Duration,
};

use walletd::{BalanceReader, EngineOptions, LedgerEngine, LedgerError, Operation};
use walletd_core::{
    Account, AccountId, BalanceCache, CacheError, JournalEntry, JournalKind, LedgerStore,
    NewJournalEntry, StorageError, UnitOfWork,
};
use walletd_memory::{MemoryCache, MemoryStore};

struct Harness {
    store: Arc<MemoryStore>,
    cache: Arc<MemoryCache>,
    engine: Arc<LedgerEngine>,
}

fn setup(accounts: &[(&str, f64)]) -> Harness {
    let store = Arc::new(MemoryStore::with_lock_timeout(Duration::from_secs(2)));
    for (username, balance) in accounts {
        store.create_account(username, *balance).unwrap();
    }
    let cache = Arc::new(MemoryCache::new());
    let reader = Arc::new(BalanceReader::new(store.clone(), cache.clone(), None));
    let engine = Arc::new(LedgerEngine::new(
        store.clone(),
        cache.clone(),
        reader,
        EngineOptions::default(),
    ));
    Harness {
        store,
        cache,
        engine,
    }
}

fn stored_balance(store: &MemoryStore, username: &str) -> f64 {
    store.find_account(username).unwrap().unwrap().balance
}

fn history(store: &MemoryStore, username: &str) -> Vec<JournalEntry> {
    let id = store.find_account(username).unwrap().unwrap().id;
    store.history(id).unwrap()
}

#[test]
fn test_deposit_then_read_back() {
    let h = setup(&[("user1", 100.0)]);

    assert_eq!(h.engine.deposit("user1", 50.0).unwrap(), 150.0);
    assert_eq!(h.engine.get_balance("user1").unwrap(), 150.0);

    let entries = history(&h.store, "user1");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].amount, 50.0);
    assert_eq!(entries[0].kind, JournalKind::Deposit);
}

#[test]
fn test_withdraw_more_than_balance() {
    let h = setup(&[("user1", 100.0)]);

    let err = h.engine.withdraw("user1", 150.0).unwrap_err();
    assert!(matches!(err, LedgerError::InsufficientFunds { .. }), "{:?}", err);
    assert_eq!(h.engine.get_balance("user1").unwrap(), 100.0);
    assert!(history(&h.store, "user1").is_empty());
}

#[test]
fn test_transfer_between_accounts() {
    let h = setup(&[("user1", 100.0), ("user2", 100.0)]);

    let receipt = h.engine.transfer("user1", "user2", 30.0).unwrap();

    assert_eq!(h.engine.get_balance("user1").unwrap(), 70.0);
    assert_eq!(h.engine.get_balance("user2").unwrap(), 130.0);

    let sender = history(&h.store, "user1");
    let receiver = history(&h.store, "user2");
    assert_eq!(sender.len(), 1);
    assert_eq!(receiver.len(), 1);
    assert_eq!(sender[0].id, receipt.debit_entry_id);
    assert_eq!(sender[0].amount, -30.0);
    assert_eq!(sender[0].kind, JournalKind::Transfer);
    assert_eq!(receiver[0].id, receipt.credit_entry_id);
    assert_eq!(receiver[0].amount, 30.0);
}

#[test]
fn test_balance_of_unknown_account() {
    let h = setup(&[]);
    assert!(matches!(
        h.engine.get_balance("unknown"),
        Err(LedgerError::AccountNotFound(name)) if name == "unknown"
    ));
    assert!(h.cache.is_empty());
}

#[test]
fn test_opposite_concurrent_transfers_conserve_total() {
    let h = setup(&[("user1", 100.0), ("user2", 100.0)]);
    let barrier = Arc::new(Barrier::new(2));

    let forward = {
        let engine = h.engine.clone();
        let barrier = barrier.clone();
        thread::spawn(move || {
            barrier.wait();
            engine.transfer("user1", "user2", 10.0)
        })
    };
    let backward = {
        let engine = h.engine.clone();
        let barrier = barrier.clone();
        thread::spawn(move || {
            barrier.wait();
            engine.transfer("user2", "user1", 20.0)
        })
    };

    forward.join().unwrap().unwrap();
    backward.join().unwrap().unwrap();

    assert_eq!(stored_balance(&h.store, "user1"), 110.0);
    assert_eq!(stored_balance(&h.store, "user2"), 90.0);
}

#[test]
fn test_concurrent_transfers_never_deadlock() {
    let names = ["a", "b", "c", "d"];
    let h = setup(&names.iter().map(|n| (*n, 1_000.0)).collect::<Vec<_>>());

    let workers: Vec<_> = (0..8)
        .map(|worker| {
            let engine = h.engine.clone();
            thread::spawn(move || {
                for i in 0..50 {
                    let from = names[(worker + i) % names.len()];
                    let to = names[(worker + i + 1 + worker % 3) % names.len()];
                    if from == to {
                        continue;
                    }
                    match engine.transfer(from, to, 1.0) {
                        Ok(_) | Err(LedgerError::InsufficientFunds { .. }) => {}
                        Err(e) => panic!("transfer {} -> {} failed: {}", from, to, e),
                    }
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let total: f64 = names.iter().map(|n| stored_balance(&h.store, n)).sum();
    assert_eq!(total, 4_000.0);

    // Every journal row has a mirrored partner.
    let journal_total: f64 = names
        .iter()
        .flat_map(|n| history(&h.store, n))
        .map(|e| e.amount)
        .sum();
    assert_eq!(journal_total, 0.0);
}

#[test]
fn test_only_one_of_two_withdrawals_succeeds() {
    for _ in 0..20 {
        let h = setup(&[("user1", 100.0)]);
        let barrier = Arc::new(Barrier::new(2));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let engine = h.engine.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    engine.withdraw("user1", 80.0)
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|t| t.join().unwrap()).collect();

        let succeeded = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(succeeded, 1, "{:?}", results);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(LedgerError::InsufficientFunds { .. }))));
        assert_eq!(stored_balance(&h.store, "user1"), 20.0);
        assert_eq!(history(&h.store, "user1").len(), 1);
    }
}

#[test]
fn test_interleaved_deposits_and_withdrawals_balance_matches_journal() {
    let h = setup(&[("user1", 500.0)]);

    let workers: Vec<_> = (0..4)
        .map(|worker| {
            let engine = h.engine.clone();
            thread::spawn(move || {
                for _ in 0..25 {
                    if worker % 2 == 0 {
                        engine.deposit("user1", 2.0).unwrap();
                    } else {
                        engine.withdraw("user1", 1.0).unwrap();
                    }
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let journal_sum: f64 = history(&h.store, "user1").iter().map(|e| e.amount).sum();
    assert_eq!(stored_balance(&h.store, "user1"), 500.0 + journal_sum);
    assert_eq!(stored_balance(&h.store, "user1"), 550.0);
}

#[test]
fn test_cache_reflects_every_committed_mutation() {
    let h = setup(&[("user1", 100.0), ("user2", 100.0)]);

    // Warm both keys so each mutation has something to invalidate.
    h.engine.get_balance("user1").unwrap();
    h.engine.get_balance("user2").unwrap();

    h.engine.deposit("user1", 5.0).unwrap();
    assert_eq!(h.engine.get_balance("user1").unwrap(), 105.0);

    h.engine.withdraw("user2", 25.0).unwrap();
    assert_eq!(h.engine.get_balance("user2").unwrap(), 75.0);

    h.engine.transfer("user1", "user2", 5.0).unwrap();
    assert_eq!(h.engine.get_balance("user1").unwrap(), 100.0);
    assert_eq!(h.engine.get_balance("user2").unwrap(), 80.0);
    assert_eq!(h.cache.get("user2").unwrap().as_deref(), Some("80"));
}

#[test]
fn test_get_history_of_account_without_entries() {
    let h = setup(&[("user1", 100.0)]);
    assert_eq!(h.engine.get_history("user1").unwrap(), Vec::<JournalEntry>::new());
}

#[test]
fn test_get_history_oldest_first() {
    let h = setup(&[("user1", 10.0), ("user2", 0.0)]);
    h.engine.deposit("user1", 5.0).unwrap();
    h.engine.withdraw("user1", 3.0).unwrap();
    h.engine.transfer("user1", "user2", 2.0).unwrap();

    let entries = h.engine.get_history("user1").unwrap();
    let kinds: Vec<_> = entries.iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        vec![JournalKind::Deposit, JournalKind::Withdraw, JournalKind::Transfer]
    );
    assert!(entries.windows(2).all(|w| w[0].id < w[1].id));

    assert!(matches!(
        h.engine.get_history("ghost"),
        Err(LedgerError::AccountNotFound(_))
    ));
}

/// Delegates to a `MemoryStore` but fails every journal append after the
/// first `allowed` ones.
struct FlakyJournalStore {
    inner: MemoryStore,
    allowed: usize,
    appended: std::sync::atomic::AtomicUsize,
}

struct FlakyJournalUnit<'a> {
    inner: Box<dyn UnitOfWork + 'a>,
    store: &'a FlakyJournalStore,
}

impl LedgerStore for FlakyJournalStore {
    fn begin(&self) -> Result<Box<dyn UnitOfWork + '_>, StorageError> {
        Ok(Box::new(FlakyJournalUnit {
            inner: self.inner.begin()?,
            store: self,
        }))
    }
    fn find_account(&self, username: &str) -> Result<Option<Account>, StorageError> {
        self.inner.find_account(username)
    }
    fn history(&self, account_id: AccountId) -> Result<Vec<JournalEntry>, StorageError> {
        self.inner.history(account_id)
    }
    fn create_account(
        &self,
        username: &str,
        opening_balance: f64,
    ) -> Result<Account, StorageError> {
        self.inner.create_account(username, opening_balance)
    }
    fn ping(&self) -> Result<(), StorageError> {
        self.inner.ping()
    }
}

impl UnitOfWork for FlakyJournalUnit<'_> {
    fn find_account(&mut self, username: &str) -> Result<Option<Account>, StorageError> {
        self.inner.find_account(username)
    }
    fn lock_account(&mut self, id: AccountId) -> Result<Option<Account>, StorageError> {
        self.inner.lock_account(id)
    }
    fn credit(&mut self, id: AccountId, amount: f64) -> Result<Option<Account>, StorageError> {
        self.inner.credit(id, amount)
    }
    fn debit(&mut self, id: AccountId, amount: f64) -> Result<Option<Account>, StorageError> {
        self.inner.debit(id, amount)
    }
    fn append_journal(&mut self, entry: &NewJournalEntry) -> Result<JournalEntry, StorageError> {
        let n = self
            .store
            .appended
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        if n >= self.store.allowed {
            return Err(StorageError::Other("journal disk full".to_string()));
        }
        self.inner.append_journal(entry)
    }
    fn commit(self: Box<Self>) -> Result<(), StorageError> {
        self.inner.commit()
    }
    fn rollback(self: Box<Self>) -> Result<(), StorageError> {
        self.inner.rollback()
    }
}

#[test]
fn test_failed_second_journal_write_rolls_back_transfer() {
    let inner = MemoryStore::new();
    inner.create_account("user1", 100.0).unwrap();
    inner.create_account("user2", 100.0).unwrap();
    let store = Arc::new(FlakyJournalStore {
        inner,
        allowed: 1,
        appended: Default::default(),
    });
    let cache = Arc::new(MemoryCache::new());
    let reader = Arc::new(BalanceReader::new(store.clone(), cache.clone(), None));
    let engine = LedgerEngine::new(store.clone(), cache, reader, EngineOptions::default());

    let err = engine.transfer("user1", "user2", 30.0).unwrap_err();
    assert!(
        matches!(
            err,
            LedgerError::MutationFailed {
                operation: Operation::Transfer,
                source: StorageError::Other(_)
            }
        ),
        "{:?}",
        err
    );

    for username in ["user1", "user2"] {
        let account = store.find_account(username).unwrap().unwrap();
        assert_eq!(account.balance, 100.0);
        assert!(store.history(account.id).unwrap().is_empty());
    }
    assert_eq!(engine.get_balance("user1").unwrap(), 100.0);
}

#[test]
fn test_failed_journal_write_rolls_back_deposit() {
    let inner = MemoryStore::new();
    inner.create_account("user1", 100.0).unwrap();
    let store = Arc::new(FlakyJournalStore {
        inner,
        allowed: 0,
        appended: Default::default(),
    });
    let cache = Arc::new(MemoryCache::new());
    let reader = Arc::new(BalanceReader::new(store.clone(), cache.clone(), None));
    let engine = LedgerEngine::new(store.clone(), cache, reader, EngineOptions::default());

    assert!(matches!(
        engine.deposit("user1", 10.0),
        Err(LedgerError::MutationFailed { operation: Operation::Deposit, .. })
    ));
    assert_eq!(store.find_account("user1").unwrap().unwrap().balance, 100.0);
}

#[test]
fn test_lock_wait_is_bounded() {
    let store = Arc::new(MemoryStore::with_lock_timeout(Duration::from_millis(50)));
    let account = store.create_account("user1", 100.0).unwrap();
    let cache = Arc::new(MemoryCache::new());
    let reader = Arc::new(BalanceReader::new(store.clone(), cache.clone(), None));
    let engine = LedgerEngine::new(store.clone(), cache, reader, EngineOptions::default());

    // Another unit of work holds the row.
    let mut holder = store.begin().unwrap();
    holder.lock_account(account.id).unwrap().unwrap();

    let err = engine.deposit("user1", 1.0).unwrap_err();
    assert!(
        matches!(
            err,
            LedgerError::MutationFailed {
                source: StorageError::LockTimeout,
                ..
            }
        ),
        "{:?}",
        err
    );

    holder.rollback().unwrap();
    assert_eq!(engine.deposit("user1", 1.0).unwrap(), 101.0);
}

/// Cache whose deletes fail a fixed number of times before succeeding.
struct StubbornCache {
    inner: MemoryCache,
    failures_left: std::sync::Mutex<u32>,
}

impl BalanceCache for StubbornCache {
    fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.inner.get(key)
    }
    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
        self.inner.set(key, value, ttl)
    }
    fn delete(&self, keys: &[&str]) -> Result<(), CacheError> {
        let mut left = self.failures_left.lock().unwrap();
        if *left > 0 {
            *left -= 1;
            return Err(CacheError::Unavailable("timeout".to_string()));
        }
        self.inner.delete(keys)
    }
    fn ping(&self) -> Result<(), CacheError> {
        Ok(())
    }
}

type StubbornFixture = (Arc<MemoryStore>, Arc<StubbornCache>, LedgerEngine);

fn engine_with_stubborn_cache(failures: u32) -> StubbornFixture {
    let store = Arc::new(MemoryStore::new());
    store.create_account("user1", 100.0).unwrap();
    let cache = Arc::new(StubbornCache {
        inner: MemoryCache::new(),
        failures_left: std::sync::Mutex::new(failures),
    });
    let reader = Arc::new(BalanceReader::new(store.clone(), cache.clone(), None));
    let engine = LedgerEngine::new(
        store.clone(),
        cache.clone(),
        reader,
        EngineOptions {
            invalidation_retries: 2,
        },
    );
    (store, cache, engine)
}

#[test]
fn test_invalidation_retried_after_transient_failure() {
    let (_, cache, engine) = engine_with_stubborn_cache(2);
    engine.get_balance("user1").unwrap();

    assert_eq!(engine.deposit("user1", 10.0).unwrap(), 110.0);
    assert_eq!(cache.get("user1").unwrap().as_deref(), Some("110"));
}

#[test]
fn test_commit_survives_invalidation_failure() {
    let (store, _, engine) = engine_with_stubborn_cache(10);
    engine.get_balance("user1").unwrap();

    // The mutation stays committed even though the stale entry remains, and
    // the caller sees the committed balance rather than the cached one.
    assert_eq!(engine.deposit("user1", 10.0).unwrap(), 110.0);
    assert_eq!(store.find_account("user1").unwrap().unwrap().balance, 110.0);
    assert_eq!(history(&store, "user1").len(), 1);
}
