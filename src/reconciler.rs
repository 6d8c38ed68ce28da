//! Balance reconciler (spec §4.10), grounded on
//! `examples/original_source/src/executor/balance_reconciliation.py`'s
//! `BalanceReconciliationService`: solves the "phantom capital" problem
//! where a subaccount's `allocated_capital` drifts from what's actually on
//! the exchange. Two code paths, both converging on
//! `StrategyStore::update_subaccount_balance`:
//!
//! - `startup_catchup`: for every ACTIVE subaccount, pull the real balance
//!   and overwrite `allocated_capital`/`peak_balance` to match — the
//!   "simple rule" the Python source uses (`allocated_capital = actual_balance`)
//!   rather than applying deltas, since deltas could have been missed while
//!   the pipeline was down. Ledger history in the lookback window is also
//!   walked here purely to seed the dedup set, so a live update the
//!   exchange later replays during the same window isn't double-applied.
//! - `on_ledger_update`: the live path, invoked from
//!   `ExchangeClient::subscribe_ledger_updates`'s callback. Applies a single
//!   deposit/withdraw delta, deduplicated by `tx_hash` (invariant 10),
//!   clamped so `allocated_capital` never goes negative.

use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration, Utc};
use tracing::{debug, info, warn};

use crate::exchange::ExchangeClient;
use crate::models::{EventType, LedgerDirection, LedgerUpdate, SubaccountStatus};
use crate::store::{NewEvent, StrategyStore};

/// Only fix differences larger than this (Python's `diff > 1.0`) — avoids
/// rewriting rows for floating-point noise.
const RECONCILIATION_EPSILON: f64 = 1.0;

pub struct BalanceReconciler<E: ExchangeClient + ?Sized> {
    store: StrategyStore,
    exchange: Arc<E>,
    enabled: bool,
    catchup_lookback_days: u32,
}

impl<E: ExchangeClient + ?Sized> BalanceReconciler<E> {
    pub fn new(store: StrategyStore, exchange: Arc<E>, enabled: bool, catchup_lookback_days: u32) -> Self {
        Self { store, exchange, enabled, catchup_lookback_days }
    }

    /// Run once at process startup (spec §4.10 "Startup catch-up"). Returns
    /// the number of subaccounts whose allocated capital was corrected.
    pub async fn startup_catchup(&self) -> Result<usize> {
        if !self.enabled {
            info!("balance reconciliation disabled, skipping startup catch-up");
            return Ok(0);
        }

        info!("starting balance reconciliation catch-up");
        let now = Utc::now();
        let lookback_start = now - Duration::days(self.catchup_lookback_days as i64);

        let mut reconciled = 0usize;
        let subaccounts = self.store.list_subaccounts().await?;

        for sa in subaccounts.into_iter().filter(|s| s.status == SubaccountStatus::Active) {
            let actual_balance = match self.exchange.get_account_balance(sa.id).await {
                Ok(b) => b,
                Err(e) => {
                    warn!(subaccount_id = sa.id, error = %e, "cannot fetch balance, skipping");
                    continue;
                }
            };

            let mut needs_update = false;
            let mut new_allocated = sa.allocated_capital;
            let mut new_peak = sa.peak_balance;

            if actual_balance <= 0.0 {
                if sa.allocated_capital > 0.0 {
                    info!(
                        subaccount_id = sa.id,
                        allocated = sa.allocated_capital,
                        "phantom capital detected, zeroing"
                    );
                    new_allocated = 0.0;
                    new_peak = 0.0;
                    needs_update = true;
                }
            } else {
                let diff = (sa.allocated_capital - actual_balance).abs();
                if diff > RECONCILIATION_EPSILON {
                    info!(
                        subaccount_id = sa.id,
                        old = sa.allocated_capital,
                        new = actual_balance,
                        "balance mismatch, realigning allocated capital"
                    );
                    new_allocated = actual_balance;
                    new_peak = sa.peak_balance.max(actual_balance);
                    needs_update = true;
                }
            }

            if needs_update {
                self.store
                    .update_subaccount_balance(sa.id, new_allocated, actual_balance, new_peak)
                    .await?;
                reconciled += 1;

                // spec §8 S4: record the correction against the bound
                // strategy so it survives strategy deletion in the event log.
                if let Some(strategy_id) = &sa.strategy_id {
                    self.store
                        .append_event(NewEvent {
                            strategy_id: strategy_id.clone(),
                            stage: "balance_reconciliation".to_string(),
                            event_type: EventType::BalanceReconciliation,
                            status: "corrected".to_string(),
                            duration_ms: None,
                            payload: Some(serde_json::json!({
                                "subaccount_id": sa.id,
                                "old_allocated": sa.allocated_capital,
                                "new_allocated": new_allocated,
                                "exchange_balance": actual_balance,
                            })),
                        })
                        .await?;
                }
            } else {
                self.store
                    .update_subaccount_balance(sa.id, sa.allocated_capital, actual_balance, sa.peak_balance)
                    .await?;
            }

            // Seed the dedup set so a ledger event the live callback sees
            // later in this same window isn't double-applied.
            if let Ok(events) = self
                .exchange
                .get_ledger_updates(sa.id, lookback_start.timestamp_millis(), now.timestamp_millis())
                .await
            {
                for event in events {
                    self.store.mark_ledger_hash_seen(&event.tx_hash, now).await?;
                }
            }
        }

        info!(reconciled, "balance reconciliation catch-up complete");
        Ok(reconciled)
    }

    /// Live path invoked from `ExchangeClient::subscribe_ledger_updates`'s
    /// callback (spec §4.10 "Live updates"). The update is resolved to a
    /// subaccount by address; if that can't be determined, it falls back to
    /// the lowest subaccount id, exactly as the Python source's
    /// `_resolve_subaccount_id` does for the master-address WebSocket feed.
    pub async fn on_ledger_update(&self, update: LedgerUpdate, known_subaccounts: &[(i64, String)]) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        if self.store.ledger_hash_seen(&update.tx_hash).await? {
            debug!(tx_hash = %update.tx_hash, "ledger update already processed, skipping");
            return Ok(());
        }
        self.store.mark_ledger_hash_seen(&update.tx_hash, update.timestamp).await?;

        let Some(subaccount_id) = resolve_subaccount_id(&update, known_subaccounts) else {
            warn!(tx_hash = %update.tx_hash, "could not resolve subaccount for ledger update");
            return Ok(());
        };

        let Some(sa) = self.store.get_subaccount(subaccount_id).await? else {
            warn!(subaccount_id, "subaccount not found for ledger update");
            return Ok(());
        };

        if update.amount <= 0.0 {
            return Ok(());
        }

        let (new_allocated, new_peak) = match update.resolved_direction() {
            LedgerDirection::In => {
                let allocated = sa.allocated_capital + update.amount;
                (allocated, sa.peak_balance.max(allocated))
            }
            LedgerDirection::Out => ((sa.allocated_capital - update.amount).max(0.0), sa.peak_balance),
        };

        self.store
            .update_subaccount_balance(subaccount_id, new_allocated, sa.current_balance, new_peak)
            .await?;

        if let Some(strategy_id) = &sa.strategy_id {
            self.store
                .append_event(NewEvent {
                    strategy_id: strategy_id.clone(),
                    stage: "balance_reconciliation".to_string(),
                    event_type: EventType::BalanceReconciliation,
                    status: "corrected".to_string(),
                    duration_ms: None,
                    payload: Some(serde_json::json!({
                        "subaccount_id": subaccount_id,
                        "tx_hash": update.tx_hash,
                        "direction": update.resolved_direction(),
                        "amount": update.amount,
                        "new_allocated": new_allocated,
                    })),
                })
                .await?;
        }

        info!(
            subaccount_id,
            direction = ?update.resolved_direction(),
            amount = update.amount,
            "applied live ledger update"
        );
        Ok(())
    }
}

/// `_resolve_subaccount_id`: match the update's address against known
/// subaccount addresses, falling back to the lowest known id.
fn resolve_subaccount_id(update: &LedgerUpdate, known_subaccounts: &[(i64, String)]) -> Option<i64> {
    if let Some(address) = &update.subaccount_address {
        let address = address.to_lowercase();
        if let Some((id, _)) = known_subaccounts.iter().find(|(_, a)| a.to_lowercase() == address) {
            return Some(*id);
        }
    }
    known_subaccounts.iter().map(|(id, _)| *id).min()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::FakeExchangeClient;
    use crate::models::LedgerKind;

    #[tokio::test]
    async fn phantom_capital_is_zeroed_when_exchange_balance_is_zero() {
        let store = StrategyStore::in_memory().unwrap();
        store.ensure_subaccounts(1).await.unwrap();
        store.update_subaccount_balance(1, 500.0, 0.0, 500.0).await.unwrap();
        // Bind the subaccount so it reads as ACTIVE.
        let strategy = test_strategy();
        store.insert_strategy(&strategy).await.unwrap();
        store.deploy_transaction(&strategy.id, 1, 500.0, Utc::now()).await.unwrap();

        let exchange = Arc::new(FakeExchangeClient::new());
        exchange.set_balance(1, 0.0);

        let reconciler = BalanceReconciler::new(store.clone(), exchange, true, 7);
        let count = reconciler.startup_catchup().await.unwrap();

        assert_eq!(count, 1);
        let sa = store.get_subaccount(1).await.unwrap().unwrap();
        assert_eq!(sa.allocated_capital, 0.0);
        assert_eq!(sa.peak_balance, 0.0);

        // spec §8 S4: a single balance_reconciliation event is recorded.
        let events = store.events_since(Utc::now() - Duration::minutes(1)).await.unwrap();
        let recon_events: Vec<_> = events
            .iter()
            .filter(|e| e.stage == "balance_reconciliation")
            .collect();
        assert_eq!(recon_events.len(), 1);
        assert_eq!(recon_events[0].event_type, EventType::BalanceReconciliation);
        assert_eq!(recon_events[0].strategy_id, strategy.id);
    }

    #[tokio::test]
    async fn mismatched_balance_is_realigned() {
        let store = StrategyStore::in_memory().unwrap();
        store.ensure_subaccounts(1).await.unwrap();
        let strategy = test_strategy();
        store.insert_strategy(&strategy).await.unwrap();
        store.deploy_transaction(&strategy.id, 1, 100.0, Utc::now()).await.unwrap();

        let exchange = Arc::new(FakeExchangeClient::new());
        exchange.set_balance(1, 250.0);

        let reconciler = BalanceReconciler::new(store.clone(), exchange, true, 7);
        reconciler.startup_catchup().await.unwrap();

        let sa = store.get_subaccount(1).await.unwrap().unwrap();
        assert_eq!(sa.allocated_capital, 250.0);
    }

    #[tokio::test]
    async fn disabled_reconciler_is_a_no_op() {
        let store = StrategyStore::in_memory().unwrap();
        let exchange = Arc::new(FakeExchangeClient::new());
        let reconciler = BalanceReconciler::new(store, exchange, false, 7);
        assert_eq!(reconciler.startup_catchup().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn duplicate_ledger_update_is_applied_once() {
        let store = StrategyStore::in_memory().unwrap();
        store.ensure_subaccounts(1).await.unwrap();
        store.update_subaccount_balance(1, 0.0, 0.0, 0.0).await.unwrap();

        let exchange = Arc::new(FakeExchangeClient::new());
        let reconciler = BalanceReconciler::new(store.clone(), exchange, true, 7);

        let known = vec![(1i64, "sub-1".to_string())];
        let update = LedgerUpdate {
            tx_hash: "0xabc".to_string(),
            subaccount_address: Some("sub-1".to_string()),
            kind: LedgerKind::Deposit,
            direction: Some(LedgerDirection::In),
            amount: 100.0,
            timestamp: Utc::now(),
        };

        reconciler.on_ledger_update(update.clone(), &known).await.unwrap();
        reconciler.on_ledger_update(update, &known).await.unwrap();

        let sa = store.get_subaccount(1).await.unwrap().unwrap();
        assert_eq!(sa.allocated_capital, 100.0);
    }

    fn test_strategy() -> crate::models::Strategy {
        use crate::models::{Direction, StrategyStatus, Timeframe};
        crate::models::Strategy {
            id: "s1".to_string(),
            name: "s1".to_string(),
            kind: "MOM".to_string(),
            timeframe: Timeframe::parse("1h").unwrap(),
            direction: Direction::Long,
            code: "{}".to_string(),
            base_code_hash: "hash".to_string(),
            parameters: std::collections::HashMap::new(),
            trading_coins: vec!["BTC".to_string()],
            status: StrategyStatus::Active,
            score_backtest: Some(80.0),
            claim_worker_id: None,
            claim_started_at: None,
            created_at: Utc::now(),
            validated_at: None,
            tested_at: None,
            live_since: None,
            retired_at: None,
            generation_mode: "manual".to_string(),
        }
    }
}
