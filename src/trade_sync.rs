//! Trade syncer (spec §4.11), grounded on
//! `examples/original_source/src/executor/trade_sync.py`'s `TradeSync`:
//! compare this cycle's open positions against last cycle's, and for every
//! symbol that disappeared, pull fills and reconstruct the closed trade —
//! weighted-average entry price across the matching opening fills, net P&L
//! as `closed_pnl - total_fees` — then patch the matching open `Trade` row.
//! Hyperliquid (or whichever exchange) is the source of truth; the
//! `trades` table is an audit trail that lags it by at most one tick.

use std::collections::HashMap;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::exchange::{ExchangeClient, Fill, Position};
use crate::models::Direction;
use crate::store::StrategyStore;

/// Fills whose size is below this are treated as fully consumed when
/// matching entries against an exit (Python's `remaining_size <= 0.0001`).
const SIZE_EPSILON: f64 = 0.0001;

pub struct ReconstructedTrade {
    pub symbol: String,
    pub direction: Direction,
    pub size: f64,
    pub entry_price: f64,
    pub entry_time: DateTime<Utc>,
    pub entry_fee: f64,
    pub exit_price: f64,
    pub exit_time: DateTime<Utc>,
    pub exit_fee: f64,
    pub net_pnl: f64,
    pub exit_fill_id: String,
}

pub struct TradeSyncer<E: ExchangeClient + ?Sized> {
    store: StrategyStore,
    exchange: std::sync::Arc<E>,
    last_positions: HashMap<(i64, String), Position>,
}

impl<E: ExchangeClient + ?Sized> TradeSyncer<E> {
    pub fn new(store: StrategyStore, exchange: std::sync::Arc<E>) -> Self {
        Self { store, exchange, last_positions: HashMap::new() }
    }

    /// One sync cycle for a single subaccount (spec §4.11 "Detection").
    /// Detects symbols whose position vanished since the last call, fetches
    /// fills, reconstructs the closed trade, and patches the matching open
    /// `Trade` row. Returns the number of trades synced.
    pub async fn sync_subaccount(&mut self, subaccount_id: i64, user_address: &str) -> Result<usize> {
        let current = self.exchange.get_positions(subaccount_id).await?;
        let current_map: HashMap<String, Position> =
            current.into_iter().map(|p| (p.symbol.clone(), p)).collect();

        let previous_symbols: Vec<String> = self
            .last_positions
            .keys()
            .filter(|(id, _)| *id == subaccount_id)
            .map(|(_, symbol)| symbol.clone())
            .collect();
        let closed_symbols: Vec<String> = previous_symbols
            .into_iter()
            .filter(|symbol| !current_map.contains_key(symbol))
            .collect();

        let mut synced = 0usize;
        if !closed_symbols.is_empty() {
            let fills = self.exchange.fetch_fills(user_address, 500).await?;
            let trades = reconstruct_trades_from_fills(&fills);
            for trade in trades.into_iter().filter(|t| closed_symbols.contains(&t.symbol)) {
                if self.apply_trade(subaccount_id, trade).await? {
                    synced += 1;
                }
            }
        }

        self.last_positions.retain(|(id, _), _| *id != subaccount_id);
        for (symbol, position) in current_map {
            self.last_positions.insert((subaccount_id, symbol), position);
        }

        Ok(synced)
    }

    async fn apply_trade(&self, subaccount_id: i64, trade: ReconstructedTrade) -> Result<bool> {
        if self.store.fill_already_synced(&trade.exit_fill_id).await? {
            return Ok(false);
        }

        let Some(open_trade) = self.store.find_open_trade(subaccount_id, &trade.symbol).await? else {
            warn!(
                subaccount_id,
                symbol = %trade.symbol,
                "no matching open trade for closed position, may have opened outside the pipeline"
            );
            return Ok(false);
        };

        self.store
            .close_trade(
                &open_trade.id,
                trade.exit_price,
                trade.exit_time,
                trade.exit_fee,
                trade.net_pnl,
                "synced",
                &trade.exit_fill_id,
            )
            .await?;

        info!(
            subaccount_id,
            symbol = %trade.symbol,
            net_pnl = trade.net_pnl,
            "synced closed trade"
        );
        Ok(true)
    }
}

/// `_reconstruct_trades_from_fills`: group by symbol, walk each symbol's
/// fills in time order, and for every closing fill (nonzero `closed_pnl`)
/// walk backwards consuming opening fills until the exit size is covered.
fn reconstruct_trades_from_fills(fills: &[Fill]) -> Vec<ReconstructedTrade> {
    let mut by_symbol: HashMap<&str, Vec<&Fill>> = HashMap::new();
    for fill in fills {
        by_symbol.entry(fill.symbol.as_str()).or_default().push(fill);
    }
    for fills in by_symbol.values_mut() {
        fills.sort_by_key(|f| f.timestamp);
    }

    let mut trades = Vec::new();
    for (symbol, symbol_fills) in by_symbol {
        for (i, exit_fill) in symbol_fills.iter().enumerate() {
            if exit_fill.closed_pnl == 0.0 {
                continue;
            }

            let direction = match exit_fill.side.as_str() {
                "close_long" => Direction::Long,
                "close_short" => Direction::Short,
                _ => continue,
            };

            let exit_size = exit_fill.size.abs();
            let mut remaining = exit_size;
            let mut entry_fills = Vec::new();
            let opening_side = match direction {
                Direction::Long => "open_long",
                Direction::Short => "open_short",
                Direction::Bidi => "",
            };

            for prev in symbol_fills[..i].iter().rev() {
                if remaining <= SIZE_EPSILON {
                    break;
                }
                if prev.side == opening_side {
                    remaining -= prev.size.abs();
                    entry_fills.push(*prev);
                }
            }

            let (entry_price, entry_time, entry_fee) = if entry_fills.is_empty() {
                (exit_fill.price, exit_fill.timestamp, 0.0)
            } else {
                let total_size: f64 = entry_fills.iter().map(|f| f.size.abs()).sum();
                let total_value: f64 = entry_fills.iter().map(|f| f.price * f.size.abs()).sum();
                let total_fee: f64 = entry_fills.iter().map(|f| f.fee.abs()).sum();
                let avg_price = if total_size > 0.0 { total_value / total_size } else { exit_fill.price };
                let earliest = entry_fills.iter().map(|f| f.timestamp).min().unwrap_or(exit_fill.timestamp);
                (avg_price, earliest, total_fee)
            };

            let exit_fee = exit_fill.fee.abs();
            let net_pnl = exit_fill.closed_pnl - entry_fee - exit_fee;

            trades.push(ReconstructedTrade {
                symbol: symbol.to_string(),
                direction,
                size: exit_size,
                entry_price,
                entry_time,
                entry_fee,
                exit_price: exit_fill.price,
                exit_time: exit_fill.timestamp,
                exit_fee,
                net_pnl,
                exit_fill_id: exit_fill.id.clone(),
            });
        }
    }
    trades
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::FakeExchangeClient;
    use crate::models::Trade;
    use chrono::Duration;

    fn fill(id: &str, symbol: &str, side: &str, size: f64, price: f64, fee: f64, closed_pnl: f64, t: DateTime<Utc>) -> Fill {
        Fill { id: id.to_string(), symbol: symbol.to_string(), side: side.to_string(), size, price, fee, closed_pnl, timestamp: t }
    }

    #[test]
    fn reconstructs_weighted_average_entry_across_two_fills() {
        let t0 = Utc::now();
        let fills = vec![
            fill("f1", "BTC", "open_long", 1.0, 100.0, 1.0, 0.0, t0),
            fill("f2", "BTC", "open_long", 1.0, 120.0, 1.0, 0.0, t0 + Duration::minutes(1)),
            fill("f3", "BTC", "close_long", 2.0, 130.0, 2.0, 40.0, t0 + Duration::minutes(5)),
        ];

        let trades = reconstruct_trades_from_fills(&fills);
        assert_eq!(trades.len(), 1);
        let t = &trades[0];
        assert_eq!(t.entry_price, 110.0);
        assert_eq!(t.entry_fee, 2.0);
        assert_eq!(t.net_pnl, 40.0 - 2.0 - 2.0);
        assert_eq!(t.exit_fill_id, "f3");
    }

    #[tokio::test]
    async fn sync_cycle_patches_the_matching_open_trade() {
        let store = StrategyStore::in_memory().unwrap();
        store.ensure_subaccounts(1).await.unwrap();
        let t0 = Utc::now();
        store
            .insert_trade(&Trade {
                id: "trade-1".to_string(),
                strategy_id: "s1".to_string(),
                subaccount_id: Some(1),
                symbol: "BTC".to_string(),
                direction: Direction::Long,
                size: 1.0,
                entry_price: 100.0,
                exit_price: None,
                entry_time: t0,
                exit_time: None,
                entry_fee: 0.5,
                exit_fee: 0.0,
                net_pnl: None,
                exit_reason: None,
                exit_fill_id: None,
                leverage: 1.0,
                margin: 100.0,
            })
            .await
            .unwrap();

        let exchange = std::sync::Arc::new(FakeExchangeClient::new());
        exchange.set_positions(
            1,
            vec![crate::exchange::Position {
                symbol: "BTC".to_string(),
                size: 1.0,
                entry_price: 100.0,
                unrealized_pnl: 5.0,
            }],
        );

        let mut syncer = TradeSyncer::new(store.clone(), exchange.clone());
        syncer.sync_subaccount(1, "0xuser").await.unwrap();

        // Position closes on the exchange.
        exchange.set_positions(1, vec![]);
        exchange.set_fills(
            "0xuser",
            vec![fill("exit-1", "BTC", "close_long", 1.0, 110.0, 0.5, 10.0, t0 + Duration::minutes(5))],
        );

        let synced = syncer.sync_subaccount(1, "0xuser").await.unwrap();
        assert_eq!(synced, 1);

        let closed = store.find_open_trade(1, "BTC").await.unwrap();
        assert!(closed.is_none());
        assert!(store.fill_already_synced("exit-1").await.unwrap());
    }
}
