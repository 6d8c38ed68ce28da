//! Pipeline supervisor (spec §4.12), transliterated from the matching
//! `original_source` worker loops (`src/rotator/*`, `src/validator/*`,
//! `src/backtester/*`'s scheduler glue) into `tokio::spawn` +
//! `tokio::time::interval` tasks, the way the teacher's `main.rs` wires
//! `storage_pruning_polling`/`wallet_analytics_polling`. Every loop shares
//! one `watch::Receiver<bool>` shutdown signal so `main` can ask all of them
//! to finish their current batch and exit cleanly (spec §5).

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::watch;
use tokio::time::{interval, Duration as TokioDuration};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::backtest::{BacktestConfig, BacktestEngine, StrategyRule};
use crate::config::Config;
use crate::deployer::Deployer;
use crate::exchange::ExchangeClient;
use crate::market_data::{CoinRegistry, MarketDataCache};
use crate::metrics_recorder::MetricsRecorder;
use crate::models::{Direction, PeriodType, StrategyStatus};
use crate::reconciler::BalanceReconciler;
use crate::scorer::Scorer;
use crate::selector::Selector;
use crate::store::{NewEvent, StrategyPatch, StrategyStore};
use crate::trade_sync::TradeSyncer;
use crate::models::EventType;

const VALIDATION_WORKER_ID: &str = "validation-worker";
const BACKTEST_WORKER_ID: &str = "backtest-worker";
const VALIDATION_BATCH_SIZE: usize = 10;
const BACKTEST_BATCH_SIZE: usize = 5;
const SHUFFLE_ITERATIONS: usize = 200;

/// Bars per day for a timeframe string, used to size the candle window
/// pulled for a `(is_days + oos_days)` backtest (spec §4.4 "Full period").
fn bars_per_day(timeframe: &str) -> f64 {
    let minutes = match timeframe {
        "1m" => 1.0,
        "3m" => 3.0,
        "5m" => 5.0,
        "15m" => 15.0,
        "30m" => 30.0,
        "1h" => 60.0,
        "2h" => 120.0,
        "4h" => 240.0,
        "8h" => 480.0,
        "12h" => 720.0,
        "1d" => 1440.0,
        _ => 60.0,
    };
    1440.0 / minutes
}

pub struct PipelineSupervisor<E: ExchangeClient + ?Sized + 'static> {
    store: StrategyStore,
    market_data: Arc<MarketDataCache>,
    coin_registry: Arc<CoinRegistry>,
    engine: Arc<BacktestEngine>,
    lookahead_validator: Arc<crate::validator::LookaheadValidator>,
    multi_window_validator: Arc<crate::validator::MultiWindowValidator>,
    scorer: Arc<Scorer>,
    selector: Arc<Selector>,
    deployer: Arc<Deployer<E>>,
    reconciler: Arc<BalanceReconciler<E>>,
    exchange: Arc<E>,
    /// Bounds in-batch CPU parallelism for the validation/backtest loops to
    /// `backtesting.parallel_workers` (spec §5), the way `main.rs`'s
    /// `parallel_data_collection` bounds its own rayon fan-out.
    compute_pool: Arc<rayon::ThreadPool>,
    config: Config,
}

impl<E: ExchangeClient + ?Sized + 'static> PipelineSupervisor<E> {
    pub fn new(
        store: StrategyStore,
        market_data: Arc<MarketDataCache>,
        coin_registry: Arc<CoinRegistry>,
        exchange: Arc<E>,
        config: Config,
    ) -> Self {
        let engine = Arc::new(BacktestEngine::new(
            BacktestConfig {
                initial_capital: config.backtesting.initial_capital,
                fee_rate: config.hyperliquid.fee_rate,
                slippage: config.hyperliquid.slippage,
                default_leverage: 1,
            },
            coin_registry.clone(),
        ));
        let lookahead_validator = Arc::new(crate::validator::LookaheadValidator::new(SHUFFLE_ITERATIONS));
        let multi_window_validator = Arc::new(crate::validator::MultiWindowValidator::new(
            config.backtesting.multi_window.min_avg_sharpe,
            config.backtesting.multi_window.max_cv,
        ));
        let scorer = Arc::new(Scorer::new(
            config.backtesting.thresholds.clone(),
            config.backtesting.multi_window.clone(),
        ));
        let selector = Arc::new(Selector::new(&config.active_pool, &config.rotator));
        let deployer = Arc::new(Deployer::new(store.clone(), exchange.clone(), config.trading.total_capital));
        let reconciler = Arc::new(BalanceReconciler::new(
            store.clone(),
            exchange.clone(),
            config.hyperliquid.balance_reconciliation.enabled,
            config.hyperliquid.balance_reconciliation.catchup_lookback_days,
        ));
        let compute_pool = Arc::new(
            rayon::ThreadPoolBuilder::new()
                .num_threads(config.backtesting.parallel_workers.max(1))
                .build()
                .expect("building compute thread pool"),
        );

        Self {
            store,
            market_data,
            coin_registry,
            engine,
            lookahead_validator,
            multi_window_validator,
            scorer,
            selector,
            deployer,
            reconciler,
            exchange,
            compute_pool,
            config,
        }
    }

    /// Run every worker loop until `shutdown` fires, then let each loop
    /// finish its in-flight batch and return. Mirrors the teacher's
    /// `tokio::try_join!` of its polling tasks in `main.rs`.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        self.reconciler.startup_catchup().await.context("balance reconciliation startup catch-up")?;

        let max_claim_age = chrono::Duration::seconds(self.config.max_claim_age_secs as i64);

        let validation = {
            let sup = self.clone();
            let mut rx = shutdown.clone();
            tokio::spawn(async move { sup.validation_worker_loop(&mut rx, max_claim_age).await })
        };
        let backtest = {
            let sup = self.clone();
            let mut rx = shutdown.clone();
            tokio::spawn(async move { sup.backtest_worker_loop(&mut rx, max_claim_age).await })
        };
        let rotator = {
            let sup = self.clone();
            let mut rx = shutdown.clone();
            tokio::spawn(async move { sup.rotator_loop(&mut rx).await })
        };
        let sweeper = {
            let sup = self.clone();
            let mut rx = shutdown.clone();
            tokio::spawn(async move { sup.sweep_loop(&mut rx, max_claim_age).await })
        };
        let trade_sync = {
            let sup = self.clone();
            let mut rx = shutdown.clone();
            tokio::spawn(async move { sup.trade_sync_loop(&mut rx).await })
        };
        let metrics = {
            let sup = self.clone();
            let mut rx = shutdown.clone();
            tokio::spawn(async move { sup.metrics_loop(&mut rx).await })
        };

        let _ = shutdown.changed().await;
        info!("shutdown signal received, waiting for worker loops to drain");

        for handle in [validation, backtest, rotator, sweeper, trade_sync, metrics] {
            if let Err(e) = handle.await {
                error!(error = %e, "worker loop panicked");
            }
        }
        info!("pipeline supervisor stopped");
        Ok(())
    }

    fn window_bars(&self, timeframe: &str) -> usize {
        let days = (self.config.backtesting.is_days + self.config.backtesting.oos_days) as f64;
        (days * bars_per_day(timeframe)).ceil() as usize
    }

    async fn validation_worker_loop(&self, shutdown: &mut watch::Receiver<bool>, max_claim_age: chrono::Duration) {
        let mut ticker = interval(TokioDuration::from_secs(5));
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            if let Err(e) = self.run_validation_batch(max_claim_age).await {
                error!(error = %e, "validation batch failed");
            }
        }
    }

    async fn run_validation_batch(&self, max_claim_age: chrono::Duration) -> Result<()> {
        let claimed = self
            .store
            .claim_batch(StrategyStatus::Generated, VALIDATION_WORKER_ID, VALIDATION_BATCH_SIZE, max_claim_age)
            .await?;

        let mut loaded = Vec::with_capacity(claimed.len());
        for strategy in claimed {
            match self.load_for_validation(&strategy).await {
                Ok(input) => loaded.push(input),
                Err(e) => {
                    warn!(strategy_id = %strategy.id, error = %e, "validation worker releasing claim after error");
                    let _ = self.store.release_claim(&strategy.id, VALIDATION_WORKER_ID).await;
                }
            }
        }

        // The CPU-bound static check and shuffle test run across the whole
        // batch in the compute pool, bounded to `parallel_workers` (spec §5),
        // while the store round-trips above/below stay on the async runtime.
        let validator = self.lookahead_validator.clone();
        let results: Vec<_> = self.compute_pool.install(|| {
            use rayon::prelude::*;
            loaded
                .par_iter()
                .map(|(strategy, rule, candles)| {
                    let seed = seed_from_id(&strategy.id);
                    (strategy.id.clone(), validator.validate(rule, candles, seed))
                })
                .collect()
        });

        for (strategy_id, validation) in results {
            if let Err(e) = self.commit_validation_result(&strategy_id, &validation).await {
                warn!(strategy_id = %strategy_id, error = %e, "validation worker releasing claim after commit error");
                let _ = self.store.release_claim(&strategy_id, VALIDATION_WORKER_ID).await;
            }
        }
        Ok(())
    }

    async fn load_for_validation(
        &self,
        strategy: &crate::models::Strategy,
    ) -> Result<(crate::models::Strategy, StrategyRule, Vec<crate::exchange::Candle>)> {
        let rule = StrategyRule::from_code(&strategy.code).context("parsing strategy code")?;
        let symbol = strategy.trading_coins.first().context("strategy has no trading coins")?;
        let limit = self.window_bars(strategy.timeframe.as_str());
        let candles = self
            .market_data
            .load(symbol, strategy.timeframe.as_str(), 0, limit)
            .await
            .context("loading candles for validation")?;
        Ok((strategy.clone(), rule, candles))
    }

    /// GENERATED -> VALIDATED/FAILED (spec §4.5). Static lookahead check plus
    /// the empirical shuffle test against the strategy's primary symbol.
    async fn commit_validation_result(
        &self,
        strategy_id: &str,
        validation: &crate::validator::LookaheadValidation,
    ) -> Result<()> {
        let (to_status, event_type, event_status) = if validation.passed {
            (StrategyStatus::Validated, EventType::ValidationPassed, "passed")
        } else {
            (StrategyStatus::Failed, EventType::ValidationFailed, "failed")
        };

        let patch = StrategyPatch {
            code: None,
            score_backtest: None,
            validated_at: Some(Utc::now()),
            tested_at: None,
            live_since: None,
            retired_at: None,
        };
        let events = vec![NewEvent {
            strategy_id: strategy_id.to_string(),
            stage: "validation".to_string(),
            event_type,
            status: event_status.to_string(),
            duration_ms: None,
            payload: Some(serde_json::json!({
                "static_passed": validation.static_check.passed,
                "shuffle_p_value": validation.shuffle_test.p_value,
            })),
        }];

        self.store
            .commit_transition(strategy_id, VALIDATION_WORKER_ID, StrategyStatus::Generated, to_status, patch, events)
            .await?;

        info!(strategy_id, passed = validation.passed, "validation complete");
        Ok(())
    }

    async fn backtest_worker_loop(&self, shutdown: &mut watch::Receiver<bool>, max_claim_age: chrono::Duration) {
        let mut ticker = interval(TokioDuration::from_secs(10));
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            if let Err(e) = self.run_backtest_batch(max_claim_age).await {
                error!(error = %e, "backtest batch failed");
            }
        }
    }

    async fn run_backtest_batch(&self, max_claim_age: chrono::Duration) -> Result<()> {
        let claimed = self
            .store
            .claim_batch(StrategyStatus::Validated, BACKTEST_WORKER_ID, BACKTEST_BATCH_SIZE, max_claim_age)
            .await?;

        let mut loaded = Vec::with_capacity(claimed.len());
        for strategy in claimed {
            match self.load_for_backtest(&strategy).await {
                Ok(input) => loaded.push(input),
                Err(e) => {
                    warn!(strategy_id = %strategy.id, error = %e, "backtest worker releasing claim after error");
                    let _ = self.store.release_claim(&strategy.id, BACKTEST_WORKER_ID).await;
                }
            }
        }

        // Portfolio backtest + optional multi-window pass is the CPU-bound
        // part of this loop; run the batch across the compute pool bounded
        // to `parallel_workers` (spec §5) while store I/O stays sequential.
        let results: Vec<_> = self.compute_pool.install(|| {
            use rayon::prelude::*;
            loaded
                .par_iter()
                .map(|(strategy, rule, data)| {
                    let allowed_direction = strategy.direction;
                    let metrics = self.engine.backtest_portfolio(rule, data, allowed_direction, None);

                    let multi_window = if self.config.backtesting.multi_window.enabled {
                        self.run_multi_window(rule, data, allowed_direction)
                    } else {
                        crate::validator::MultiWindowResult {
                            passed: true,
                            reason: "multi_window_disabled".to_string(),
                            avg_sharpe: metrics.sharpe,
                            std_sharpe: 0.0,
                            cv: 0.0,
                            windows_with_trades: 0,
                        }
                    };

                    let result = metrics.to_backtest_result(
                        Uuid::new_v4().to_string(),
                        strategy.id.clone(),
                        PeriodType::Full,
                        true,
                        true,
                        multi_window.passed,
                        0.0,
                        multi_window.avg_sharpe,
                        multi_window.std_sharpe,
                        multi_window.cv,
                    );
                    (strategy.id.clone(), result)
                })
                .collect()
        });

        for (strategy_id, result) in results {
            if let Err(e) = self.commit_backtest_result(&strategy_id, result).await {
                warn!(strategy_id = %strategy_id, error = %e, "backtest worker releasing claim after commit error");
                let _ = self.store.release_claim(&strategy_id, BACKTEST_WORKER_ID).await;
            }
        }
        Ok(())
    }

    async fn load_for_backtest(
        &self,
        strategy: &crate::models::Strategy,
    ) -> Result<(crate::models::Strategy, StrategyRule, HashMap<String, Vec<crate::exchange::Candle>>)> {
        let rule = StrategyRule::from_code(&strategy.code).context("parsing strategy code")?;
        let limit = self.window_bars(strategy.timeframe.as_str());
        let mut data: HashMap<String, Vec<crate::exchange::Candle>> = HashMap::new();
        for symbol in &strategy.trading_coins {
            let candles = self
                .market_data
                .load(symbol, strategy.timeframe.as_str(), 0, limit)
                .await
                .with_context(|| format!("loading candles for {symbol}"))?;
            data.insert(symbol.clone(), candles);
        }
        Ok((strategy.clone(), rule, data))
    }

    /// VALIDATED -> ACTIVE/FAILED (spec §4.4/§4.6/§4.7), once the engine and
    /// Scorer have already produced `result` in the compute pool.
    async fn commit_backtest_result(&self, strategy_id: &str, result: crate::models::BacktestResult) -> Result<()> {
        self.store.insert_backtest_result(&result).await?;

        let score = self.scorer.score(&result);
        let passed = self.scorer.passes_gates(&result);

        let (to_status, event_type, event_status) = if passed {
            (StrategyStatus::Active, EventType::BacktestCompleted, "passed")
        } else {
            (StrategyStatus::Failed, EventType::BacktestFailed, "score_rejected")
        };

        let patch = StrategyPatch {
            code: None,
            // score_backtest stays null off the ACTIVE transition (spec
            // invariant 4: non-null iff status in {ACTIVE, LIVE, RETIRED}).
            score_backtest: if passed { Some(score) } else { None },
            validated_at: None,
            tested_at: Some(Utc::now()),
            live_since: None,
            retired_at: None,
        };
        let events = vec![NewEvent {
            strategy_id: strategy_id.to_string(),
            stage: "backtest".to_string(),
            event_type,
            status: event_status.to_string(),
            duration_ms: None,
            payload: Some(serde_json::json!({ "score": score, "sharpe": result.sharpe })),
        }];

        self.store
            .commit_transition(strategy_id, BACKTEST_WORKER_ID, StrategyStatus::Validated, to_status, patch, events)
            .await?;

        info!(strategy_id, score, sharpe = result.sharpe, "backtest complete");
        Ok(())
    }

    /// Slice each symbol's candles into `multi_window.windows` disjoint,
    /// equal-length chunks and run a portfolio backtest on each (spec §4.6).
    fn run_multi_window(
        &self,
        rule: &StrategyRule,
        data: &HashMap<String, Vec<crate::exchange::Candle>>,
        allowed_direction: Direction,
    ) -> crate::validator::MultiWindowResult {
        let windows = self.config.backtesting.multi_window.windows.max(1);
        let shortest = data.values().map(|c| c.len()).min().unwrap_or(0);
        let chunk_len = shortest / windows;
        if chunk_len == 0 {
            return self.multi_window_validator.validate(&[]);
        }

        let mut sharpes_with_trades = Vec::with_capacity(windows);
        for w in 0..windows {
            let start = w * chunk_len;
            let end = start + chunk_len;
            let window_data: HashMap<String, Vec<crate::exchange::Candle>> = data
                .iter()
                .map(|(symbol, candles)| (symbol.clone(), candles[start..end.min(candles.len())].to_vec()))
                .collect();
            let metrics = self.engine.backtest_portfolio(rule, &window_data, allowed_direction, None);
            sharpes_with_trades.push((metrics.sharpe, metrics.total_trades));
        }

        self.multi_window_validator.validate(&sharpes_with_trades)
    }

    async fn rotator_loop(&self, shutdown: &mut watch::Receiver<bool>) {
        let mut ticker = interval(TokioDuration::from_secs(self.config.rotator.check_interval_minutes * 60));
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            if let Err(e) = self.run_rotation().await {
                error!(error = %e, "rotation cycle failed");
            }
        }
    }

    /// ACTIVE -> LIVE (spec §4.8/§4.9). Select from the ACTIVE pool against
    /// the current LIVE population's diversification counts, deploy each
    /// winner to a free subaccount.
    async fn run_rotation(&self) -> Result<()> {
        let active_pool = self.store.list_by_status(StrategyStatus::Active).await?;
        let live_pool = self.store.list_by_status(StrategyStatus::Live).await?;
        let selected = self.selector.select(&active_pool, &live_pool);

        for strategy in &selected {
            match self.deployer.deploy(strategy).await {
                Ok(true) => info!(strategy_id = %strategy.id, "rotated strategy into LIVE"),
                Ok(false) => warn!(strategy_id = %strategy.id, "deploy skipped, no free subaccount"),
                Err(e) => error!(strategy_id = %strategy.id, error = %e, "deploy failed"),
            }
        }
        Ok(())
    }

    async fn sweep_loop(&self, shutdown: &mut watch::Receiver<bool>, max_claim_age: chrono::Duration) {
        let mut ticker = interval(TokioDuration::from_secs(max_claim_age.num_seconds().max(60) as u64));
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            match self.store.sweep_stale_claims(max_claim_age).await {
                Ok(n) if n > 0 => info!(released = n, "swept stale claims"),
                Ok(_) => {}
                Err(e) => error!(error = %e, "stale claim sweep failed"),
            }
        }
    }

    async fn trade_sync_loop(&self, shutdown: &mut watch::Receiver<bool>) {
        let mut syncer = TradeSyncer::new(self.store.clone(), self.exchange.clone());
        let mut ticker = interval(TokioDuration::from_secs(30));
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            let subaccounts = match self.store.list_subaccounts().await {
                Ok(s) => s,
                Err(e) => {
                    error!(error = %e, "failed to list subaccounts for trade sync");
                    continue;
                }
            };
            for sa in subaccounts.into_iter().filter(|s| s.status == crate::models::SubaccountStatus::Active) {
                if let Err(e) = syncer.sync_subaccount(sa.id, &sa.address).await {
                    error!(subaccount_id = sa.id, error = %e, "trade sync failed");
                }
            }
        }
    }

    async fn metrics_loop(&self, shutdown: &mut watch::Receiver<bool>) {
        let recorder = MetricsRecorder::new(self.store.clone(), &self.config.rotator);
        let mut ticker = interval(TokioDuration::from_secs(self.config.metrics_snapshot_interval_secs));
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            if let Err(e) = recorder.collect_and_persist().await {
                error!(error = %e, "metrics snapshot failed");
            }
        }
    }
}

/// Deterministic shuffle-test seed derived from the strategy id so repeated
/// validation runs of the same strategy always partition signals the same
/// way (spec §4.5 "Reproducibility").
fn seed_from_id(id: &str) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in id.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        ActivePoolConfig, BacktestingConfig, BalanceReconciliationConfig, ExchangeConfig,
        MultiWindowConfig, PipelineQueueConfig, QueueLimits, RotatorConfig, SelectionConfig,
        Thresholds, TradingConfig,
    };
    use crate::exchange::{FakeCandleFetcher, FakeExchangeClient};
    use crate::models::{BacktestResult, PeriodType, SymbolBreakdown, Timeframe};
    use std::collections::HashMap;

    fn test_config() -> Config {
        Config {
            database_path: ":memory:".to_string(),
            pipeline: PipelineQueueConfig {
                queue_limits: QueueLimits { generated: 100, validated: 100 },
            },
            active_pool: ActivePoolConfig { max_size: 10, min_score: 50.0 },
            rotator: RotatorConfig {
                check_interval_minutes: 15,
                max_live_strategies: 4,
                min_pool_size: 0,
                selection: SelectionConfig { max_per_type: 2, max_per_timeframe: 2 },
            },
            backtesting: BacktestingConfig {
                initial_capital: 10_000.0,
                is_days: 30,
                oos_days: 10,
                max_coins: 5,
                thresholds: Thresholds {
                    min_sharpe: 1.0,
                    min_win_rate: 0.4,
                    max_drawdown: 0.5,
                    min_total_trades: 10,
                },
                multi_window: MultiWindowConfig {
                    enabled: false,
                    windows: 3,
                    min_avg_sharpe: 0.5,
                    max_cv: 1.0,
                },
                parallel_workers: 1,
            },
            hyperliquid: ExchangeConfig {
                fee_rate: 0.0005,
                slippage: 0.0002,
                subaccounts_count: 2,
                balance_reconciliation: BalanceReconciliationConfig {
                    enabled: false,
                    catchup_lookback_days: 7,
                },
            },
            timeframes: vec!["15m".to_string(), "1h".to_string()],
            metrics_collection_interval_secs: 300,
            trading: TradingConfig { total_capital: 10_000.0 },
            max_claim_age_secs: 600,
            metrics_snapshot_interval_secs: 300,
        }
    }

    async fn test_supervisor() -> (Arc<PipelineSupervisor<FakeExchangeClient>>, StrategyStore) {
        let store = StrategyStore::in_memory().unwrap();
        store.ensure_subaccounts(2).await.unwrap();
        let coin_registry = Arc::new(CoinRegistry::new(store.clone()));
        let data_dir = tempfile::tempdir().unwrap();
        let market_data = Arc::new(
            MarketDataCache::new(data_dir.path(), Arc::new(FakeCandleFetcher::new())).unwrap(),
        );
        let exchange = Arc::new(FakeExchangeClient::new());
        let supervisor = Arc::new(PipelineSupervisor::new(
            store.clone(),
            market_data,
            coin_registry,
            exchange,
            test_config(),
        ));
        (supervisor, store)
    }

    fn test_strategy(id: &str) -> crate::models::Strategy {
        crate::models::Strategy {
            id: id.to_string(),
            name: id.to_string(),
            kind: "MOM".to_string(),
            timeframe: Timeframe::parse("1h").unwrap(),
            direction: Direction::Long,
            code: "{}".to_string(),
            base_code_hash: "hash".to_string(),
            parameters: HashMap::new(),
            trading_coins: vec!["BTC".to_string()],
            status: StrategyStatus::Validated,
            score_backtest: None,
            claim_worker_id: None,
            claim_started_at: None,
            created_at: Utc::now(),
            validated_at: Some(Utc::now()),
            tested_at: None,
            live_since: None,
            retired_at: None,
            generation_mode: "manual".to_string(),
        }
    }

    fn failing_backtest_result(strategy_id: &str) -> BacktestResult {
        // Below `min_sharpe`/`min_total_trades`, so `Scorer::passes_gates`
        // rejects it and `Scorer::score` returns `GATE_FAILED_SCORE`.
        BacktestResult {
            id: "bt-1".to_string(),
            strategy_id: strategy_id.to_string(),
            period_type: PeriodType::Full,
            sharpe: 0.1,
            sortino: 0.1,
            max_drawdown: -0.1,
            win_rate: 0.3,
            expectancy: 1.0,
            profit_factor: 1.0,
            total_trades: 1,
            total_return: 0.01,
            final_equity: 10_100.0,
            avg_leverage: 1.0,
            max_margin_pct: 0.2,
            per_symbol: vec![SymbolBreakdown {
                symbol: "BTC".to_string(),
                sharpe: 0.1,
                sortino: 0.1,
                max_drawdown: -0.1,
                win_rate: 0.3,
                expectancy: 1.0,
                profit_factor: 1.0,
                total_trades: 1,
                total_return: 0.01,
            }],
            lookahead_check_passed: true,
            shuffle_test_passed: true,
            multi_window_passed: true,
            shuffle_p_value: 0.01,
            multi_window_avg_sharpe: 0.1,
            multi_window_std_sharpe: 0.0,
            multi_window_cv: 0.0,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn failed_backtest_leaves_score_backtest_null() {
        let (supervisor, store) = test_supervisor().await;
        let strategy = test_strategy("s1");
        store.insert_strategy(&strategy).await.unwrap();
        store
            .claim_batch(StrategyStatus::Validated, BACKTEST_WORKER_ID, 10, chrono::Duration::seconds(60))
            .await
            .unwrap();

        supervisor
            .commit_backtest_result("s1", failing_backtest_result("s1"))
            .await
            .unwrap();

        let refreshed = store.get_strategy("s1").await.unwrap().unwrap();
        assert_eq!(refreshed.status, StrategyStatus::Failed);
        // spec invariant 4: score_backtest is non-null iff status in
        // {ACTIVE, LIVE, RETIRED}; FAILED must keep it null.
        assert!(refreshed.score_backtest.is_none());
    }
}

