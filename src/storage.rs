use std::sync::Arc;

use thiserror::Error;
use walletd_core::{BalanceCache, CacheError, LedgerStore, StorageError};
use walletd_memory::{MemoryCache, MemoryStore};
use walletd_postgres::{PostgresOptions, PostgresStore};
use walletd_redis::{redis_url, RedisCache, DEFAULT_TIMEOUT};
use walletd_sqlite::SqliteStore;

use crate::config::{CacheBackendKind, CacheConfig, StorageBackendKind, StorageConfig};

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("failed to open {backend} store: {source}")]
    Store {
        backend: &'static str,
        #[source]
        source: StorageError,
    },
    #[error("failed to open {backend} cache: {source}")]
    Cache {
        backend: &'static str,
        #[source]
        source: CacheError,
    },
}

/// Opens the configured account store and creates its schema if needed.
pub fn open_store(config: &StorageConfig) -> Result<Arc<dyn LedgerStore>, BackendError> {
    let lock_timeout = config.lock_timeout();
    let store: Arc<dyn LedgerStore> = match config.backend {
        StorageBackendKind::Memory => Arc::new(MemoryStore::with_lock_timeout(lock_timeout)),
        StorageBackendKind::Sqlite => {
            let store = SqliteStore::with_lock_timeout(&config.sqlite.path, lock_timeout)
                .map_err(|source| BackendError::Store {
                    backend: "sqlite",
                    source,
                })?;
            Arc::new(store)
        }
        StorageBackendKind::Postgres => {
            let options = PostgresOptions {
                pool_size: config.postgres.pool_size,
                lock_timeout,
            };
            let store = PostgresStore::with_options(config.postgres.pg_config(), options)
                .map_err(|source| BackendError::Store {
                    backend: "postgres",
                    source,
                })?;
            Arc::new(store)
        }
    };
    tracing::info!(
        backend = ?config.backend,
        lock_timeout_ms = config.lock_timeout_ms,
        "Account store ready"
    );
    Ok(store)
}

pub fn open_cache(config: &CacheConfig) -> Result<Arc<dyn BalanceCache>, BackendError> {
    let cache: Arc<dyn BalanceCache> = match config.backend {
        CacheBackendKind::Memory => Arc::new(MemoryCache::new()),
        CacheBackendKind::Redis => {
            let url = redis_url(&config.redis.addr, Some(&config.redis.password), config.redis.db);
            let cache = RedisCache::with_options(&url, config.redis.pool_size, DEFAULT_TIMEOUT)
                .map_err(|source| BackendError::Cache {
                    backend: "redis",
                    source,
                })?;
            Arc::new(cache)
        }
    };
    tracing::info!(backend = ?config.backend, ttl_secs = config.ttl_secs, "Balance cache ready");
    Ok(cache)
}
