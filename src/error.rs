use std::fmt;

use thiserror::Error;
use walletd_core::{CacheError, StorageError};

/// Balance-changing operations, used for error context and metric labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Deposit,
    Withdraw,
    Transfer,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Deposit => "deposit",
            Operation::Withdraw => "withdraw",
            Operation::Transfer => "transfer",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("{0}")]
    Validation(String),

    #[error("account not found: {0}")]
    AccountNotFound(String),

    #[error("insufficient funds: {username} cannot cover {requested}")]
    InsufficientFunds { username: String, requested: f64 },

    #[error("{operation} failed: {source}")]
    MutationFailed {
        operation: Operation,
        #[source]
        source: StorageError,
    },

    #[error("dependency unavailable: {0}")]
    DependencyUnavailable(String),
}

impl LedgerError {
    /// Machine-readable error kind for API payloads and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            LedgerError::Validation(_) => "validation_error",
            LedgerError::AccountNotFound(_) => "account_not_found",
            LedgerError::InsufficientFunds { .. } => "insufficient_funds",
            LedgerError::MutationFailed { .. } => "mutation_failed",
            LedgerError::DependencyUnavailable(_) => "dependency_unavailable",
        }
    }

    /// Business rejections are expected outcomes, not faults.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            LedgerError::Validation(_)
                | LedgerError::AccountNotFound(_)
                | LedgerError::InsufficientFunds { .. }
        )
    }
}

impl From<CacheError> for LedgerError {
    fn from(e: CacheError) -> Self {
        LedgerError::DependencyUnavailable(format!("balance cache: {}", e))
    }
}

/// Failures of the read path. Reads never mutate, so every store failure
/// there is reported as the store being unusable.
pub(crate) fn read_failure(e: StorageError) -> LedgerError {
    LedgerError::DependencyUnavailable(format!("account store: {}", e))
}
