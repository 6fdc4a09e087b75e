use std::{sync::Arc, time::Instant};

use serde::Serialize;
use walletd_core::{
    Account, BalanceCache, JournalEntry, JournalKind, LedgerStore, NewJournalEntry, StorageError,
    UnitOfWork,
};

use crate::{
    balance::BalanceReader,
    error::{read_failure, LedgerError, Operation},
};

pub const MAX_USERNAME_LEN: usize = 64;

pub(crate) fn validate_username(username: &str) -> Result<(), LedgerError> {
    if username.trim().is_empty() {
        return Err(LedgerError::Validation("username must not be empty".to_string()));
    }
    if username.len() > MAX_USERNAME_LEN {
        return Err(LedgerError::Validation(format!(
            "username must be at most {} bytes",
            MAX_USERNAME_LEN
        )));
    }
    Ok(())
}

/// Every operation moves a strictly positive, finite amount.
pub(crate) fn validate_amount(amount: f64) -> Result<(), LedgerError> {
    if !amount.is_finite() || amount <= 0.0 {
        return Err(LedgerError::Validation(format!(
            "amount must be a positive finite number, got {}",
            amount
        )));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Extra cache delete attempts after a commit before giving up.
    pub invalidation_retries: u32,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            invalidation_retries: 2,
        }
    }
}

/// Journal entry ids written by a committed transfer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransferReceipt {
    pub debit_entry_id: i64,
    pub credit_entry_id: i64,
}

/// Why a unit of work is being abandoned.
enum Abort {
    Storage(StorageError),
    Rejected(LedgerError),
}

impl From<StorageError> for Abort {
    fn from(e: StorageError) -> Self {
        Abort::Storage(e)
    }
}

impl From<LedgerError> for Abort {
    fn from(e: LedgerError) -> Self {
        Abort::Rejected(e)
    }
}

impl Abort {
    fn into_ledger_error(self, operation: Operation) -> LedgerError {
        match self {
            Abort::Storage(source) => LedgerError::MutationFailed { operation, source },
            Abort::Rejected(e) => e,
        }
    }
}

/// Applies balance mutations and their journal entries as single units of
/// work, then invalidates the cached balances they touched.
pub struct LedgerEngine {
    store: Arc<dyn LedgerStore>,
    cache: Arc<dyn BalanceCache>,
    reader: Arc<BalanceReader>,
    options: EngineOptions,
}

impl LedgerEngine {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        cache: Arc<dyn BalanceCache>,
        reader: Arc<BalanceReader>,
        options: EngineOptions,
    ) -> Self {
        Self {
            store,
            cache,
            reader,
            options,
        }
    }

    pub fn deposit(&self, username: &str, amount: f64) -> Result<f64, LedgerError> {
        self.observe(Operation::Deposit, || {
            validate_username(username)?;
            validate_amount(amount)?;

            let committed = self.unit_of_work(Operation::Deposit, |uow| {
                let account = find(uow, username)?;
                let account = uow
                    .credit(account.id, amount)?
                    .ok_or_else(|| LedgerError::AccountNotFound(username.to_string()))?;
                uow.append_journal(&NewJournalEntry {
                    account_id: account.id,
                    amount,
                    kind: JournalKind::Deposit,
                })?;
                Ok(account)
            })?;

            let invalidated = self.invalidate(Operation::Deposit, &[username]);
            Ok(self.fresh_balance(username, &committed, invalidated))
        })
    }

    pub fn withdraw(&self, username: &str, amount: f64) -> Result<f64, LedgerError> {
        self.observe(Operation::Withdraw, || {
            validate_username(username)?;
            validate_amount(amount)?;
            self.precheck_funds(username, amount)?;

            let committed = self.unit_of_work(Operation::Withdraw, |uow| {
                let account = find(uow, username)?;
                let account = uow
                    .debit(account.id, amount)?
                    .ok_or_else(|| insufficient(username, amount))?;
                uow.append_journal(&NewJournalEntry {
                    account_id: account.id,
                    amount: -amount,
                    kind: JournalKind::Withdraw,
                })?;
                Ok(account)
            })?;

            let invalidated = self.invalidate(Operation::Withdraw, &[username]);
            Ok(self.fresh_balance(username, &committed, invalidated))
        })
    }

    pub fn transfer(
        &self,
        from: &str,
        to: &str,
        amount: f64,
    ) -> Result<TransferReceipt, LedgerError> {
        self.observe(Operation::Transfer, || {
            validate_username(from)?;
            validate_username(to)?;
            validate_amount(amount)?;
            if from == to {
                return Err(LedgerError::Validation(
                    "cannot transfer to the same account".to_string(),
                ));
            }
            self.precheck_funds(from, amount)?;

            let receipt = self.unit_of_work(Operation::Transfer, |uow| {
                let sender = find(uow, from)?;
                let receiver = find(uow, to)?;

                // One global lock order regardless of direction.
                let (first, second) = if sender.id < receiver.id {
                    (&sender, &receiver)
                } else {
                    (&receiver, &sender)
                };
                for account in [first, second] {
                    uow.lock_account(account.id)?
                        .ok_or_else(|| LedgerError::AccountNotFound(account.username.clone()))?;
                }

                uow.debit(sender.id, amount)?
                    .ok_or_else(|| insufficient(from, amount))?;
                uow.credit(receiver.id, amount)?
                    .ok_or_else(|| LedgerError::AccountNotFound(to.to_string()))?;

                let debit = uow.append_journal(&NewJournalEntry {
                    account_id: sender.id,
                    amount: -amount,
                    kind: JournalKind::Transfer,
                })?;
                let credit = uow.append_journal(&NewJournalEntry {
                    account_id: receiver.id,
                    amount,
                    kind: JournalKind::Transfer,
                })?;
                Ok(TransferReceipt {
                    debit_entry_id: debit.id,
                    credit_entry_id: credit.id,
                })
            })?;

            self.invalidate(Operation::Transfer, &[from, to]);
            Ok(receipt)
        })
    }

    pub fn get_balance(&self, username: &str) -> Result<f64, LedgerError> {
        self.reader.get_balance(username)
    }

    /// Journal of one account, oldest entry first. Always read from the store.
    pub fn get_history(&self, username: &str) -> Result<Vec<JournalEntry>, LedgerError> {
        validate_username(username)?;
        let account = self
            .store
            .find_account(username)
            .map_err(read_failure)?
            .ok_or_else(|| LedgerError::AccountNotFound(username.to_string()))?;
        self.store.history(account.id).map_err(read_failure)
    }

    /// Advisory check against a possibly stale balance. The conditional
    /// debit inside the unit of work is what actually enforces sufficiency.
    fn precheck_funds(&self, username: &str, amount: f64) -> Result<(), LedgerError> {
        let available = self.reader.get_balance(username)?;
        if available < amount {
            return Err(insufficient(username, amount));
        }
        Ok(())
    }

    fn unit_of_work<T>(
        &self,
        operation: Operation,
        steps: impl FnOnce(&mut dyn UnitOfWork) -> Result<T, Abort>,
    ) -> Result<T, LedgerError> {
        let mut uow = self.store.begin().map_err(|e| {
            if e.is_unavailable() {
                LedgerError::DependencyUnavailable(format!("account store: {}", e))
            } else {
                LedgerError::MutationFailed {
                    operation,
                    source: e,
                }
            }
        })?;

        match steps(uow.as_mut()) {
            Ok(value) => {
                uow.commit().map_err(|source| {
                    tracing::error!(%operation, error = %source, "Commit failed");
                    LedgerError::MutationFailed { operation, source }
                })?;
                tracing::debug!(%operation, "Unit of work committed");
                Ok(value)
            }
            Err(abort) => {
                if let Err(e) = uow.rollback() {
                    // The store discards the transaction with the connection.
                    tracing::warn!(%operation, error = %e, "Rollback failed");
                }
                let err = abort.into_ledger_error(operation);
                tracing::debug!(%operation, error = %err, "Unit of work rolled back");
                Err(err)
            }
        }
    }

    /// Returns false when the keys could not be deleted. A committed
    /// mutation is never undone because the cache misbehaves.
    fn invalidate(&self, operation: Operation, keys: &[&str]) -> bool {
        let mut attempt = 0;
        loop {
            match self.cache.delete(keys) {
                Ok(()) => return true,
                Err(e) if attempt < self.options.invalidation_retries => {
                    attempt += 1;
                    tracing::warn!(
                        %operation,
                        ?keys,
                        attempt,
                        error = %e,
                        "Retrying cache invalidation"
                    );
                }
                Err(e) => {
                    metrics::counter!(
                        "wallet_cache_invalidation_failures_total",
                        1,
                        "operation" => operation.as_str()
                    );
                    tracing::error!(
                        %operation,
                        ?keys,
                        error = %e,
                        "Cache invalidation failed, balances may be stale"
                    );
                    return false;
                }
            }
        }
    }

    /// Post-commit balance through the reader. Uses the value the unit of
    /// work committed when the cache still holds the pre-commit entry or
    /// the read path fails.
    fn fresh_balance(&self, username: &str, committed: &Account, invalidated: bool) -> f64 {
        if !invalidated {
            return committed.balance;
        }
        match self.reader.get_balance(username) {
            Ok(balance) => balance,
            Err(e) => {
                tracing::warn!(username, error = %e, "Post-commit balance read failed");
                committed.balance
            }
        }
    }

    fn observe<T>(
        &self,
        operation: Operation,
        f: impl FnOnce() -> Result<T, LedgerError>,
    ) -> Result<T, LedgerError> {
        let started = Instant::now();
        let result = f();
        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => e.kind(),
        };
        metrics::counter!(
            "wallet_operations_total",
            1,
            "operation" => operation.as_str(),
            "outcome" => outcome
        );
        metrics::histogram!(
            "wallet_operation_duration_seconds",
            started.elapsed().as_secs_f64(),
            "operation" => operation.as_str()
        );
        match &result {
            Err(e) if e.is_rejection() => {
                tracing::info!(%operation, error = %e, "Operation rejected")
            }
            Err(e) => tracing::error!(%operation, error = %e, "Operation failed"),
            Ok(_) => {}
        }
        result
    }
}

fn find(uow: &mut dyn UnitOfWork, username: &str) -> Result<Account, Abort> {
    Ok(uow
        .find_account(username)?
        .ok_or_else(|| LedgerError::AccountNotFound(username.to_string()))?)
}

fn insufficient(username: &str, amount: f64) -> LedgerError {
    LedgerError::InsufficientFunds {
        username: username.to_string(),
        requested: amount,
    }
}
