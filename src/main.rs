//! `pipeline` binary: boots the strategy lifecycle pipeline — claim-protocol
//! worker loops moving strategies GENERATED -> VALIDATED -> ACTIVE ->
//! LIVE/FAILED/RETIRED, rotation/deployment, balance reconciliation, trade
//! syncing and metrics recording — and runs it until SIGTERM/SIGINT.

use std::env;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pipeline_core::config::Config;
use pipeline_core::exchange::{FakeCandleFetcher, FakeExchangeClient};
use pipeline_core::market_data::{CoinRegistry, MarketDataCache};
use pipeline_core::store::StrategyStore;
use pipeline_core::supervisor::PipelineSupervisor;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Config::load().context("loading configuration")?;
    info!(database_path = %config.database_path, "starting strategy lifecycle pipeline");

    let store = StrategyStore::new(&config.database_path).context("opening strategy store")?;
    store
        .ensure_subaccounts(config.hyperliquid.subaccounts_count)
        .await
        .context("provisioning subaccounts")?;

    let coin_registry = Arc::new(CoinRegistry::new(store.clone()));
    coin_registry.refresh().await.context("initial coin registry refresh")?;

    let data_dir = env::var("MARKET_DATA_DIR").unwrap_or_else(|_| "data/ohlcv".to_string());
    // No production exchange wiring ships with this crate (out of scope,
    // spec §1/§6) — a real deployment substitutes its own
    // `ExchangeClient`/`ExchangeCandleFetcher` at this seam.
    let candle_fetcher: Arc<dyn pipeline_core::exchange::ExchangeCandleFetcher> = Arc::new(FakeCandleFetcher::new());
    let market_data = Arc::new(MarketDataCache::new(&data_dir, candle_fetcher).context("opening market data cache")?);
    let exchange = Arc::new(FakeExchangeClient::new());

    let supervisor = Arc::new(PipelineSupervisor::new(
        store,
        market_data,
        coin_registry,
        exchange,
        config,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    supervisor.run(shutdown_rx).await?;
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pipeline_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
