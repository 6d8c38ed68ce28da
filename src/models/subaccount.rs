use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SubaccountStatus {
    Active,
    Paused,
    Stopped,
}

impl SubaccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubaccountStatus::Active => "ACTIVE",
            SubaccountStatus::Paused => "PAUSED",
            SubaccountStatus::Stopped => "STOPPED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ACTIVE" => Some(Self::Active),
            "PAUSED" => Some(Self::Paused),
            "STOPPED" => Some(Self::Stopped),
            _ => None,
        }
    }
}

/// Exchange-side trading silo; the atomic unit of capital allocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subaccount {
    pub id: i64,
    pub address: String,
    pub status: SubaccountStatus,
    pub strategy_id: Option<String>,
    pub allocated_capital: f64,
    pub current_balance: f64,
    pub peak_balance: f64,
    pub open_positions_count: u32,
    pub last_trade_at: Option<DateTime<Utc>>,
}

impl Subaccount {
    pub fn is_free(&self) -> bool {
        self.strategy_id.is_none() && self.status == SubaccountStatus::Paused
    }
}
