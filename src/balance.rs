use std::{sync::Arc, time::Duration};

use walletd_core::{BalanceCache, LedgerStore};

use crate::{
    error::{read_failure, LedgerError},
    ledger::validate_username,
};

/// Read-through balance lookup: cache first, store on miss.
///
/// Populates the cache on a miss but never invalidates it; invalidation
/// belongs to the committing side.
pub struct BalanceReader {
    store: Arc<dyn LedgerStore>,
    cache: Arc<dyn BalanceCache>,
    ttl: Option<Duration>,
}

impl BalanceReader {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        cache: Arc<dyn BalanceCache>,
        ttl: Option<Duration>,
    ) -> Self {
        Self { store, cache, ttl }
    }

    pub fn get_balance(&self, username: &str) -> Result<f64, LedgerError> {
        validate_username(username)?;

        if let Some(raw) = self.cache.get(username)? {
            match raw.parse::<f64>() {
                Ok(balance) if balance.is_finite() => {
                    metrics::counter!("wallet_balance_cache_total", 1, "result" => "hit");
                    return Ok(balance);
                }
                _ => tracing::warn!(username, value = %raw, "Ignoring unparseable cached balance"),
            }
        }
        metrics::counter!("wallet_balance_cache_total", 1, "result" => "miss");

        let account = self
            .store
            .find_account(username)
            .map_err(read_failure)?
            .ok_or_else(|| LedgerError::AccountNotFound(username.to_string()))?;

        if let Err(e) = self.cache.set(username, &account.balance.to_string(), self.ttl) {
            tracing::warn!(username, error = %e, "Failed to populate balance cache");
        }
        Ok(account.balance)
    }
}
