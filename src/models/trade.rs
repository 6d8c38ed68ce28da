use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::strategy::Direction;

/// A realized round-trip, either produced by `BacktestEngine` or reconstructed
/// live by `TradeSyncer`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: String,
    pub strategy_id: String,
    pub subaccount_id: Option<i64>,
    pub symbol: String,
    pub direction: Direction,
    pub size: f64,
    pub entry_price: f64,
    pub exit_price: Option<f64>,
    pub entry_time: DateTime<Utc>,
    pub exit_time: Option<DateTime<Utc>>,
    pub entry_fee: f64,
    pub exit_fee: f64,
    pub net_pnl: Option<f64>,
    pub exit_reason: Option<String>,
    /// Dedup key for live-synced trades: the closing fill's exchange id.
    pub exit_fill_id: Option<String>,
    pub leverage: f64,
    pub margin: f64,
}

impl Trade {
    pub fn is_open(&self) -> bool {
        self.exit_time.is_none()
    }
}
