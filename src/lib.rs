pub mod api;
pub mod balance;
pub mod config;
pub mod error;
pub mod fixtures;
pub mod ledger;
pub mod storage;
pub mod telemetry;

pub use balance::BalanceReader;
pub use error::{LedgerError, Operation};
pub use ledger::{EngineOptions, LedgerEngine, TransferReceipt};
