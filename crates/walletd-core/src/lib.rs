//! Core types and traits for walletd storage and cache backends.
//!
//! This crate provides the `LedgerStore`/`UnitOfWork` and `BalanceCache`
//! capability traits, enabling pluggable backends in separate crates.

pub mod cache;
pub mod models;
pub mod storage;

// Re-export key types at crate root for convenience
pub use cache::{BalanceCache, CacheError};
pub use models::{Account, AccountId, JournalEntry, JournalKind, NewJournalEntry};
pub use storage::{LedgerStore, StorageError, UnitOfWork};
