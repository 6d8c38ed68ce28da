//! In-memory coin registry (spec §4.3), refreshed wholesale from the store.
//!
//! Grounded on `signals::detector`'s in-memory-snapshot pattern (build the
//! whole view fresh on each refresh rather than patching it incrementally)
//! and `original_source/src/api/routes/coins.py`'s
//! `CoinRegistryStatsResponse` (total/active counts, cache age) for the
//! stats surface.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::DataError;
use crate::models::CoinInfo;
use crate::store::StrategyStore;

#[derive(Debug, Clone, Copy)]
pub struct CoinRegistryStats {
    pub total_coins: usize,
    pub active_coins: usize,
    pub last_updated_at: Option<DateTime<Utc>>,
}

pub struct CoinRegistry {
    store: StrategyStore,
    snapshot: RwLock<Arc<HashMap<String, CoinInfo>>>,
}

impl CoinRegistry {
    pub fn new(store: StrategyStore) -> Self {
        Self {
            store,
            snapshot: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    /// Rebuild the whole snapshot from the store's `coins` table. Cache
    /// invalidation is simply "replace everything" — the latest
    /// `updated_at` of any row is what a caller would use to decide whether
    /// to bother calling this again (spec §4.3).
    pub async fn refresh(&self) -> anyhow::Result<()> {
        let coins = self.store.list_coins().await?;
        let map: HashMap<String, CoinInfo> = coins.into_iter().map(|c| (c.symbol.clone(), c)).collect();
        *self.snapshot.write() = Arc::new(map);
        Ok(())
    }

    pub fn active_symbols(&self) -> Vec<String> {
        self.snapshot
            .read()
            .values()
            .filter(|c| c.is_active)
            .map(|c| c.symbol.clone())
            .collect()
    }

    /// Fails with `DataError::UnknownSymbol` rather than defaulting — a
    /// strategy must not silently trade an unregistered symbol at unbounded
    /// leverage (spec §4.3, §7).
    pub fn max_leverage(&self, symbol: &str) -> Result<u32, DataError> {
        self.snapshot
            .read()
            .get(symbol)
            .map(|c| c.max_leverage)
            .ok_or_else(|| DataError::UnknownSymbol(symbol.to_string()))
    }

    pub fn is_active(&self, symbol: &str) -> bool {
        self.snapshot.read().get(symbol).map(|c| c.is_active).unwrap_or(false)
    }

    pub fn price(&self, symbol: &str) -> Option<f64> {
        self.snapshot.read().get(symbol).map(|c| c.price)
    }

    pub fn stats(&self) -> CoinRegistryStats {
        let snapshot = self.snapshot.read();
        CoinRegistryStats {
            total_coins: snapshot.len(),
            active_coins: snapshot.values().filter(|c| c.is_active).count(),
            last_updated_at: snapshot.values().map(|c| c.updated_at).max(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_symbol_fails_instead_of_defaulting() {
        let store = StrategyStore::in_memory().unwrap();
        let registry = CoinRegistry::new(store);
        registry.refresh().await.unwrap();

        let err = registry.max_leverage("DOGE").unwrap_err();
        assert!(matches!(err, DataError::UnknownSymbol(s) if s == "DOGE"));
    }

    #[tokio::test]
    async fn refresh_picks_up_active_coins() {
        let store = StrategyStore::in_memory().unwrap();
        store
            .upsert_coins(&[CoinInfo {
                symbol: "BTC".to_string(),
                max_leverage: 20,
                volume_24h: 1_000_000.0,
                price: 60_000.0,
                is_active: true,
                updated_at: Utc::now(),
            }])
            .await
            .unwrap();

        let registry = CoinRegistry::new(store);
        registry.refresh().await.unwrap();

        assert_eq!(registry.active_symbols(), vec!["BTC".to_string()]);
        assert_eq!(registry.max_leverage("BTC").unwrap(), 20);
    }
}
