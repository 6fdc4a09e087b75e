use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub type AccountId = i64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub username: String,
    pub balance: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JournalKind {
    Deposit,
    Withdraw,
    Transfer,
}

impl JournalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JournalKind::Deposit => "deposit",
            JournalKind::Withdraw => "withdraw",
            JournalKind::Transfer => "transfer",
        }
    }
}

impl fmt::Display for JournalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JournalKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deposit" => Ok(JournalKind::Deposit),
            "withdraw" => Ok(JournalKind::Withdraw),
            "transfer" => Ok(JournalKind::Transfer),
            other => Err(format!("unknown journal kind: {}", other)),
        }
    }
}

/// A committed, immutable record of one balance change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub id: i64,
    pub account_id: AccountId,
    /// Signed delta applied to the account balance.
    pub amount: f64,
    pub kind: JournalKind,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewJournalEntry {
    pub account_id: AccountId,
    pub amount: f64,
    pub kind: JournalKind,
}
