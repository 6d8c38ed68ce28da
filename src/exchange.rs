//! External collaborator capabilities (spec §6).
//!
//! The exchange transport itself (gRPC/HTTP/WebSocket framing, credentials)
//! is explicitly out of scope (spec §1); this module only defines the seam
//! the pipeline core programs against, plus deterministic fakes used by
//! tests. Pattern grounded on `barter-execution`'s `ExecutionClient` trait
//! in the pack — the teacher itself never defines a capability trait, it
//! pulls in `async-trait` but doesn't use it, so this is new plumbing built
//! in the teacher's idiom (typed structs, `anyhow::Result` at call sites).

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::models::{LedgerDirection, LedgerKind, LedgerUpdate};

/// A candle as returned by the exchange's market-data endpoint (spec §6
/// "OHLCV file format").
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Candle {
    pub timestamp_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// An open position as reported by the exchange.
#[derive(Debug, Clone)]
pub struct Position {
    pub symbol: String,
    pub size: f64,
    pub entry_price: f64,
    pub unrealized_pnl: f64,
}

/// A fill confirmation (spec §4.11 / Glossary "Fill").
#[derive(Debug, Clone)]
pub struct Fill {
    pub id: String,
    pub symbol: String,
    pub side: String,
    pub size: f64,
    pub price: f64,
    pub fee: f64,
    pub closed_pnl: f64,
    pub timestamp: DateTime<Utc>,
}

/// Callback invoked for each live ledger update pushed by the exchange's
/// streaming feed (spec §4.10 "Live updates"). Boxed rather than generic so
/// the trait stays object-safe.
pub type LedgerUpdateCallback = Box<dyn Fn(LedgerUpdate) + Send + Sync>;

/// Required exchange operations (spec §6). Production wiring of a real
/// exchange client is out of scope — only the trait plus `FakeExchangeClient`
/// ship here.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    async fn get_positions(&self, subaccount_id: i64) -> Result<Vec<Position>>;
    async fn get_account_balance(&self, subaccount_id: i64) -> Result<f64>;
    async fn get_ledger_updates(
        &self,
        subaccount_id: i64,
        t0_ms: i64,
        t1_ms: i64,
    ) -> Result<Vec<LedgerUpdate>>;
    async fn close_all_positions(&self, subaccount_id: i64) -> Result<()>;
    async fn fetch_fills(&self, user_address: &str, limit: usize) -> Result<Vec<Fill>>;

    /// Register a callback for the exchange's real-time ledger-update
    /// stream (spec §4.10 "Live updates"). Production clients wire this to
    /// their WebSocket subscription; `FakeExchangeClient` stores the
    /// callback and replays updates pushed via `push_live_ledger_update`.
    fn subscribe_ledger_updates(&self, callback: LedgerUpdateCallback);
}

/// Historical candle fetcher, injected into `MarketDataCache` (spec §4.2).
#[async_trait]
pub trait ExchangeCandleFetcher: Send + Sync {
    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        interval: &str,
        since_ms: i64,
        limit: usize,
    ) -> Result<Vec<Candle>>;
}

/// Deterministic in-memory exchange used by tests, grounded on the
/// fixture-driven style of `tests/backtest_run_integration.rs`.
#[derive(Default)]
pub struct FakeExchangeClient {
    balances: Mutex<HashMap<i64, f64>>,
    positions: Mutex<HashMap<i64, Vec<Position>>>,
    ledger: Mutex<HashMap<i64, Vec<LedgerUpdate>>>,
    fills: Mutex<HashMap<String, Vec<Fill>>>,
    ledger_subscribers: Mutex<Vec<LedgerUpdateCallback>>,
}

impl FakeExchangeClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_balance(&self, subaccount_id: i64, balance: f64) {
        self.balances.lock().insert(subaccount_id, balance);
    }

    pub fn set_positions(&self, subaccount_id: i64, positions: Vec<Position>) {
        self.positions.lock().insert(subaccount_id, positions);
    }

    pub fn push_ledger_update(&self, subaccount_id: i64, update: LedgerUpdate) {
        self.ledger.lock().entry(subaccount_id).or_default().push(update);
    }

    pub fn set_fills(&self, user_address: &str, fills: Vec<Fill>) {
        self.fills.lock().insert(user_address.to_string(), fills);
    }

    /// Test-only: simulate the exchange pushing a live ledger update to
    /// every registered subscriber, as a real WebSocket feed would.
    pub fn push_live_ledger_update(&self, update: LedgerUpdate) {
        for callback in self.ledger_subscribers.lock().iter() {
            callback(update.clone());
        }
    }
}

#[async_trait]
impl ExchangeClient for FakeExchangeClient {
    async fn get_positions(&self, subaccount_id: i64) -> Result<Vec<Position>> {
        Ok(self
            .positions
            .lock()
            .get(&subaccount_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_account_balance(&self, subaccount_id: i64) -> Result<f64> {
        Ok(*self.balances.lock().get(&subaccount_id).unwrap_or(&0.0))
    }

    async fn get_ledger_updates(
        &self,
        subaccount_id: i64,
        t0_ms: i64,
        t1_ms: i64,
    ) -> Result<Vec<LedgerUpdate>> {
        Ok(self
            .ledger
            .lock()
            .get(&subaccount_id)
            .map(|updates| {
                updates
                    .iter()
                    .filter(|u| {
                        let ts = u.timestamp.timestamp_millis();
                        ts >= t0_ms && ts <= t1_ms
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn close_all_positions(&self, subaccount_id: i64) -> Result<()> {
        self.positions.lock().remove(&subaccount_id);
        Ok(())
    }

    async fn fetch_fills(&self, user_address: &str, limit: usize) -> Result<Vec<Fill>> {
        Ok(self
            .fills
            .lock()
            .get(user_address)
            .map(|fills| fills.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    fn subscribe_ledger_updates(&self, callback: LedgerUpdateCallback) {
        self.ledger_subscribers.lock().push(callback);
    }
}

/// Deterministic candle source used by tests and the `backtest_run` CLI
/// fixture path.
#[derive(Default)]
pub struct FakeCandleFetcher {
    series: Mutex<HashMap<(String, String), Arc<Vec<Candle>>>>,
}

impl FakeCandleFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_series(&self, symbol: &str, interval: &str, candles: Vec<Candle>) {
        self.series
            .lock()
            .insert((symbol.to_string(), interval.to_string()), Arc::new(candles));
    }
}

#[async_trait]
impl ExchangeCandleFetcher for FakeCandleFetcher {
    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        interval: &str,
        since_ms: i64,
        limit: usize,
    ) -> Result<Vec<Candle>> {
        let key = (symbol.to_string(), interval.to_string());
        Ok(self
            .series
            .lock()
            .get(&key)
            .map(|candles| {
                candles
                    .iter()
                    .filter(|c| c.timestamp_ms >= since_ms)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// Direction inference helper shared by the ledger/reconciler paths
/// (re-exported here since `LedgerUpdate` lives in `models`).
pub fn infer_ledger_kind(kind: &str) -> LedgerKind {
    match kind {
        "deposit" => LedgerKind::Deposit,
        "withdraw" => LedgerKind::Withdraw,
        "internalTransfer" => LedgerKind::InternalTransfer,
        _ => LedgerKind::SubAccountTransfer,
    }
}

pub fn infer_ledger_direction(amount: f64) -> LedgerDirection {
    if amount >= 0.0 {
        LedgerDirection::In
    } else {
        LedgerDirection::Out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn subscribers_receive_pushed_ledger_updates() {
        let client = FakeExchangeClient::new();
        let received = Arc::new(AtomicUsize::new(0));
        let counter = received.clone();
        client.subscribe_ledger_updates(Box::new(move |_update| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        client.push_live_ledger_update(LedgerUpdate {
            tx_hash: "0xabc".to_string(),
            subaccount_address: None,
            kind: LedgerKind::Deposit,
            direction: Some(LedgerDirection::In),
            amount: 100.0,
            timestamp: Utc::now(),
        });

        assert_eq!(received.load(Ordering::SeqCst), 1);
    }
}
