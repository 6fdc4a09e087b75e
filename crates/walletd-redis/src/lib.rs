use std::time::Duration;

use r2d2::{Pool, PooledConnection};
use redis::{Client, RedisError};

use walletd_core::{BalanceCache, CacheError};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_POOL_SIZE: u32 = 16;

/// `BalanceCache` over a pool of Redis connections. Broken connections are
/// detected and replaced by the pool.
pub struct RedisCache {
    pool: Pool<Client>,
    timeout: Duration,
}

impl RedisCache {
    pub fn new(url: &str) -> Result<Self, CacheError> {
        Self::with_options(url, DEFAULT_POOL_SIZE, DEFAULT_TIMEOUT)
    }

    pub fn with_options(url: &str, pool_size: u32, timeout: Duration) -> Result<Self, CacheError> {
        let client = Client::open(url).map_err(|e| CacheError::Other(e.to_string()))?;
        let pool = Pool::builder()
            .max_size(pool_size.max(1))
            .connection_timeout(timeout)
            .build(client)
            .map_err(pool_err)?;
        Ok(Self { pool, timeout })
    }

    fn connection(&self) -> Result<PooledConnection<Client>, CacheError> {
        let conn = self.pool.get().map_err(pool_err)?;
        conn.set_read_timeout(Some(self.timeout)).map_err(map_err)?;
        conn.set_write_timeout(Some(self.timeout)).map_err(map_err)?;
        Ok(conn)
    }
}

fn pool_err(e: r2d2::Error) -> CacheError {
    CacheError::Unavailable(format!("redis connection pool: {}", e))
}

fn map_err(e: RedisError) -> CacheError {
    if e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped() || e.is_timeout() {
        CacheError::Unavailable(e.to_string())
    } else {
        CacheError::Other(e.to_string())
    }
}

impl BalanceCache for RedisCache {
    fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.connection()?;
        redis::cmd("GET").arg(key).query(&mut *conn).map_err(map_err)
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
        let mut conn = self.connection()?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis() as u64);
        }
        cmd.query(&mut *conn).map_err(map_err)
    }

    fn delete(&self, keys: &[&str]) -> Result<(), CacheError> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection()?;
        let mut cmd = redis::cmd("DEL");
        for key in keys {
            cmd.arg(*key);
        }
        let _removed: i64 = cmd.query(&mut *conn).map_err(map_err)?;
        Ok(())
    }

    fn ping(&self) -> Result<(), CacheError> {
        let mut conn = self.connection()?;
        let _pong: String = redis::cmd("PING").query(&mut *conn).map_err(map_err)?;
        Ok(())
    }
}

/// Builds a `redis://` URL from the address/password/db triple used in
/// configuration files.
pub fn redis_url(addr: &str, password: Option<&str>, db: i64) -> String {
    match password {
        Some(password) if !password.is_empty() => format!("redis://:{}@{}/{}", password, addr, db),
        _ => format!("redis://{}/{}", addr, db),
    }
}
