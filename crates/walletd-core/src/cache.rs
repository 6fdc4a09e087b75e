use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache unavailable: {0}")]
    Unavailable(String),
    #[error("{0}")]
    Other(String),
}

/// Key/value cache for last-known balances.
///
/// Not authoritative. A missing key means "not yet warmed", never zero.
pub trait BalanceCache: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, CacheError>;
    /// `ttl` of `None` keeps the value until it is deleted.
    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError>;
    fn delete(&self, keys: &[&str]) -> Result<(), CacheError>;
    fn ping(&self) -> Result<(), CacheError>;
}
