use std::{net::SocketAddr, time::Duration};

use clap::Parser;
use serde::Deserialize;
use thiserror::Error;
use walletd_postgres::{PgConfig, SslMode};

#[derive(Parser, Debug)]
#[command(name = "walletd", about = "walletd - transactional wallet ledger service")]
pub struct CliArgs {
    /// Path to config file
    #[arg(short, long, default_value = "walletd.toml")]
    pub config: String,

    /// Port to listen on (overrides config file)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Log level (overrides config file)
    #[arg(short, long)]
    pub log_level: Option<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid listen address {0}")]
    ListenAddr(String),
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    /// Accounts created at startup when missing.
    #[serde(default)]
    pub accounts: Vec<AccountFixture>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackendKind {
    #[default]
    Memory,
    Sqlite,
    Postgres,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackendKind,

    /// Upper bound on how long a unit of work waits for a row lock.
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    #[serde(default)]
    pub sqlite: SqliteConfig,

    #[serde(default)]
    pub postgres: PostgresConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackendKind::default(),
            lock_timeout_ms: default_lock_timeout_ms(),
            sqlite: SqliteConfig::default(),
            postgres: PostgresConfig::default(),
        }
    }
}

impl StorageConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SqliteConfig {
    #[serde(default = "default_sqlite_path")]
    pub path: String,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: default_sqlite_path(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PostgresConfig {
    #[serde(default = "default_pg_host")]
    pub host: String,

    #[serde(default = "default_pg_port")]
    pub port: u16,

    #[serde(default = "default_pg_user")]
    pub user: String,

    #[serde(default)]
    pub password: String,

    #[serde(default = "default_pg_dbname")]
    pub dbname: String,

    #[serde(default)]
    pub sslmode: PgSslMode,

    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            host: default_pg_host(),
            port: default_pg_port(),
            user: default_pg_user(),
            password: String::new(),
            dbname: default_pg_dbname(),
            sslmode: PgSslMode::default(),
            pool_size: default_pool_size(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PgSslMode {
    #[default]
    Disable,
    Prefer,
    Require,
}

impl PostgresConfig {
    pub fn pg_config(&self) -> PgConfig {
        let mut config = PgConfig::new();
        config
            .host(&self.host)
            .port(self.port)
            .user(&self.user)
            .dbname(&self.dbname)
            .ssl_mode(match self.sslmode {
                PgSslMode::Disable => SslMode::Disable,
                PgSslMode::Prefer => SslMode::Prefer,
                PgSslMode::Require => SslMode::Require,
            });
        if !self.password.is_empty() {
            config.password(&self.password);
        }
        config
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackendKind {
    #[default]
    Memory,
    Redis,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default)]
    pub backend: CacheBackendKind,

    /// Lifetime of populated balance entries. 0 keeps them until invalidated.
    #[serde(default)]
    pub ttl_secs: u64,

    #[serde(default = "default_invalidation_retries")]
    pub invalidation_retries: u32,

    #[serde(default)]
    pub redis: RedisConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackendKind::default(),
            ttl_secs: 0,
            invalidation_retries: default_invalidation_retries(),
            redis: RedisConfig::default(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Option<Duration> {
        match self.ttl_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RedisConfig {
    #[serde(default = "default_redis_addr")]
    pub addr: String,

    #[serde(default)]
    pub password: String,

    #[serde(default)]
    pub db: i64,

    #[serde(default = "default_redis_pool_size")]
    pub pool_size: u32,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            addr: default_redis_addr(),
            password: String::new(),
            db: 0,
            pool_size: default_redis_pool_size(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct AccountFixture {
    pub username: String,
    #[serde(default)]
    pub balance: f64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_lock_timeout_ms() -> u64 {
    5000
}

fn default_sqlite_path() -> String {
    "walletd.db".to_string()
}

fn default_pg_host() -> String {
    "localhost".to_string()
}

fn default_pg_port() -> u16 {
    5432
}

fn default_pg_user() -> String {
    "postgres".to_string()
}

fn default_pg_dbname() -> String {
    "wallet".to_string()
}

fn default_pool_size() -> u32 {
    10
}

fn default_invalidation_retries() -> u32 {
    2
}

fn default_redis_addr() -> String {
    "localhost:6379".to_string()
}

fn default_redis_pool_size() -> u32 {
    16
}

impl Config {
    /// Reads the config file named on the command line, falling back to
    /// defaults when it does not exist, then applies CLI overrides.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let mut config = match std::fs::read_to_string(&cli.config) {
            Ok(contents) => Self::parse(&cli.config, &contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Config::default(),
            Err(source) => {
                return Err(ConfigError::Read {
                    path: cli.config.clone(),
                    source,
                })
            }
        };

        // CLI overrides
        if let Some(port) = cli.port {
            config.server.port = port;
        }
        if let Some(ref level) = cli.log_level {
            config.logging.level = level.clone();
        }

        Ok(config)
    }

    pub fn parse(path: &str, contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        let addr = format!("{}:{}", self.server.host, self.server.port);
        addr.parse().map_err(|_| ConfigError::ListenAddr(addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(config: &str) -> CliArgs {
        CliArgs {
            config: config.to_string(),
            port: None,
            log_level: None,
        }
    }

    #[test]
    fn test_defaults() {
        let config = Config::parse("walletd.toml", "").unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.storage.backend, StorageBackendKind::Memory);
        assert_eq!(config.storage.lock_timeout(), Duration::from_secs(5));
        assert_eq!(config.cache.backend, CacheBackendKind::Memory);
        assert_eq!(config.cache.ttl(), None);
        assert_eq!(config.cache.invalidation_retries, 2);
        assert!(config.accounts.is_empty());
    }

    #[test]
    fn test_full_file() {
        let config = Config::parse(
            "walletd.toml",
            r#"
            [server]
            host = "127.0.0.1"
            port = 9000

            [logging]
            level = "debug"
            json = true

            [storage]
            backend = "postgres"
            lock_timeout_ms = 250

            [storage.postgres]
            host = "db"
            user = "wallet"
            password = "p w'\"x"
            dbname = "ledger"
            pool_size = 4

            [cache]
            backend = "redis"
            ttl_secs = 30

            [cache.redis]
            addr = "cache:6379"
            db = 3

            [[accounts]]
            username = "user1"
            balance = 100.0

            [[accounts]]
            username = "user2"
            "#,
        )
        .unwrap();

        assert_eq!(config.listen_addr().unwrap(), "127.0.0.1:9000".parse().unwrap());
        assert!(config.logging.json);
        assert_eq!(config.storage.backend, StorageBackendKind::Postgres);
        assert_eq!(config.storage.lock_timeout(), Duration::from_millis(250));
        assert_eq!(config.storage.postgres.pool_size, 4);
        let pg = config.storage.postgres.pg_config();
        assert_eq!(pg.get_user(), Some("wallet"));
        assert_eq!(pg.get_dbname(), Some("ledger"));
        assert_eq!(pg.get_ports(), &[5432]);
        assert_eq!(pg.get_password(), Some(&b"p w'\"x"[..]));
        assert_eq!(config.cache.backend, CacheBackendKind::Redis);
        assert_eq!(config.cache.ttl(), Some(Duration::from_secs(30)));
        assert_eq!(config.cache.redis.db, 3);
        assert_eq!(
            config.accounts,
            vec![
                AccountFixture {
                    username: "user1".into(),
                    balance: 100.0,
                },
                AccountFixture {
                    username: "user2".into(),
                    balance: 0.0,
                },
            ]
        );
    }

    #[test]
    fn test_unsupported_sslmode_is_an_error() {
        let toml = "[storage.postgres]\nsslmode = \"verify-full\"\n";
        let result = Config::parse("walletd.toml", toml);
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_unknown_backend_is_an_error() {
        let result = Config::parse("walletd.toml", "[storage]\nbackend = \"mongo\"\n");
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_missing_file_uses_defaults_and_cli_overrides() {
        let mut args = cli("/nonexistent/walletd.toml");
        args.port = Some(7000);
        args.log_level = Some("trace".into());
        let config = Config::load(&args).unwrap();
        assert_eq!(config.server.port, 7000);
        assert_eq!(config.logging.level, "trace");
    }
}
