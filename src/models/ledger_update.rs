use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LedgerKind {
    Deposit,
    Withdraw,
    InternalTransfer,
    SubAccountTransfer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerDirection {
    In,
    Out,
}

/// Exchange-originated ledger event. `tx_hash` is the deduplication key
/// (invariant 10: each applied at most once).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerUpdate {
    pub tx_hash: String,
    pub subaccount_address: Option<String>,
    pub kind: LedgerKind,
    pub direction: Option<LedgerDirection>,
    pub amount: f64,
    pub timestamp: DateTime<Utc>,
}

impl LedgerUpdate {
    /// Direction inference for transfer events that omit an explicit
    /// direction: use the sign of the delta (spec §4.10).
    pub fn resolved_direction(&self) -> LedgerDirection {
        self.direction.unwrap_or(if self.amount >= 0.0 {
            LedgerDirection::In
        } else {
            LedgerDirection::Out
        })
    }
}
