use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A tradable symbol's current tradability attributes (spec §4.3). Refreshed
/// wholesale from the store's `coins` table by `CoinRegistry::refresh`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoinInfo {
    pub symbol: String,
    pub max_leverage: u32,
    pub volume_24h: f64,
    pub price: f64,
    pub is_active: bool,
    pub updated_at: DateTime<Utc>,
}
