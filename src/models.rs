use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which side of the ledger an event lands on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Deposit,
    Withdraw,
}

impl EventKind {
    /// Storage name for the `event_type` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Deposit => "deposit",
            EventKind::Withdraw => "withdraw",
        }
    }
}

/// One decoded staking event, keyed by transaction hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEvent {
    pub user: String,
    /// Decimal digits only; round-trips the on-chain uint256 exactly.
    pub amount: String,
    pub kind: EventKind,
    pub block_number: u64,
    pub tx_hash: String,
    pub timestamp: DateTime<Utc>,
}
