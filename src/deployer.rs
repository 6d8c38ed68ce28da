//! Strategy deployer (spec §4.9), grounded directly on
//! `examples/original_source/src/rotator/deployer.py`'s `StrategyDeployer`:
//! deploy binds a free subaccount to an ACTIVE strategy with an equal-split
//! capital allocation that includes the new subaccount in the count, then
//! flips the strategy to LIVE; undeploy closes exchange positions first,
//! then frees the subaccount and retires the strategy. Both operations are
//! thin wrappers around `StrategyStore::deploy_transaction` /
//! `undeploy_transaction`, which hold the actual two-phase commit (spec
//! §4.1's claim-protocol style re-verification inside one transaction).

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tracing::{error, info, warn};

use crate::exchange::ExchangeClient;
use crate::models::{Strategy, SubaccountStatus};
use crate::store::StrategyStore;

pub struct Deployer<E: ExchangeClient + ?Sized> {
    store: StrategyStore,
    exchange: Arc<E>,
    total_capital: f64,
}

impl<E: ExchangeClient + ?Sized> Deployer<E> {
    pub fn new(store: StrategyStore, exchange: Arc<E>, total_capital: f64) -> Self {
        Self { store, exchange, total_capital }
    }

    /// `StrategyDeployer.deploy`: take the lowest-id free subaccount, split
    /// `total_capital` equally across all ACTIVE subaccounts including the
    /// one about to be bound, and commit the two-sided transition.
    pub async fn deploy(&self, strategy: &Strategy) -> Result<bool> {
        let free = self.store.free_subaccounts().await?;
        let Some(subaccount) = free.first() else {
            warn!(strategy_id = %strategy.id, "no free subaccount available for deployment");
            return Ok(false);
        };

        let subaccounts = self.store.list_subaccounts().await?;
        let active_count = subaccounts
            .iter()
            .filter(|s| s.status == SubaccountStatus::Active)
            .count();
        let capital_per = self.total_capital / (active_count as f64 + 1.0);

        let deployed = self
            .store
            .deploy_transaction(&strategy.id, subaccount.id, capital_per, Utc::now())
            .await?;

        if deployed {
            info!(
                strategy_id = %strategy.id,
                subaccount_id = subaccount.id,
                capital_per,
                "deployed strategy to subaccount"
            );
        } else {
            warn!(
                strategy_id = %strategy.id,
                subaccount_id = subaccount.id,
                "deploy transaction rolled back: strategy or subaccount no longer available"
            );
        }

        Ok(deployed)
    }

    /// `StrategyDeployer.undeploy`: close exchange-side positions before
    /// freeing the subaccount, since Hyperliquid is the source of truth for
    /// what's actually open (spec §9).
    pub async fn undeploy(&self, strategy_id: &str, subaccount_id: i64) -> Result<()> {
        if let Err(e) = self.exchange.close_all_positions(subaccount_id).await {
            error!(strategy_id, subaccount_id, error = %e, "failed to close positions before undeploy");
            return Err(e);
        }

        self.store.undeploy_transaction(strategy_id, subaccount_id, Utc::now()).await?;
        info!(strategy_id, subaccount_id, "undeployed strategy, subaccount freed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::FakeExchangeClient;
    use crate::models::{Direction, StrategyStatus, Timeframe};
    use std::collections::HashMap;

    fn strategy(id: &str) -> Strategy {
        Strategy {
            id: id.to_string(),
            name: id.to_string(),
            kind: "MOM".to_string(),
            timeframe: Timeframe::parse("1h").unwrap(),
            direction: Direction::Long,
            code: "{}".to_string(),
            base_code_hash: "hash".to_string(),
            parameters: HashMap::new(),
            trading_coins: vec!["BTC".to_string()],
            status: StrategyStatus::Active,
            score_backtest: Some(90.0),
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

    #[tokio::test]
    async fn deploy_splits_capital_across_active_plus_new_subaccount() {
        let store = StrategyStore::in_memory().unwrap();
        store.ensure_subaccounts(2).await.unwrap();
        let s = strategy("s1");
        store.insert_strategy(&s).await.unwrap();

        let exchange = Arc::new(FakeExchangeClient::new());
        let deployer = Deployer::new(store.clone(), exchange, 10_000.0);

        let ok = deployer.deploy(&s).await.unwrap();
        assert!(ok);

        let sub = store.get_subaccount(1).await.unwrap().unwrap();
        assert_eq!(sub.allocated_capital, 10_000.0); // no other ACTIVE subaccounts yet
        assert_eq!(sub.strategy_id.as_deref(), Some("s1"));

        let refreshed = store.get_strategy("s1").await.unwrap().unwrap();
        assert_eq!(refreshed.status, StrategyStatus::Live);
    }

    #[tokio::test]
    async fn deploy_fails_gracefully_with_no_free_subaccount() {
        let store = StrategyStore::in_memory().unwrap();
        let s = strategy("s1");
        store.insert_strategy(&s).await.unwrap();

        let exchange = Arc::new(FakeExchangeClient::new());
        let deployer = Deployer::new(store, exchange, 10_000.0);

        assert!(!deployer.deploy(&s).await.unwrap());
    }

    #[tokio::test]
    async fn undeploy_closes_positions_then_frees_subaccount() {
        let store = StrategyStore::in_memory().unwrap();
        store.ensure_subaccounts(1).await.unwrap();
        let s = strategy("s1");
        store.insert_strategy(&s).await.unwrap();

        let exchange = Arc::new(FakeExchangeClient::new());
        let deployer = Deployer::new(store.clone(), exchange, 10_000.0);
        assert!(deployer.deploy(&s).await.unwrap());

        deployer.undeploy("s1", 1).await.unwrap();

        let sub = store.get_subaccount(1).await.unwrap().unwrap();
        assert!(sub.strategy_id.is_none());
        let refreshed = store.get_strategy("s1").await.unwrap().unwrap();
        assert_eq!(refreshed.status, StrategyStatus::Retired);
    }
}
