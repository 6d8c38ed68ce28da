//! `backtest_run`: run a single strategy rule against cached OHLCV data and
//! print the resulting metrics, without touching the claim protocol or the
//! strategy store's lifecycle state. Useful for ad-hoc research and for
//! reproducing a pipeline-run backtest outside the worker loops.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use pipeline_core::backtest::{BacktestConfig, BacktestEngine, StrategyRule};
use pipeline_core::exchange::{Candle, ExchangeCandleFetcher, FakeCandleFetcher};
use pipeline_core::market_data::{CoinRegistry, MarketDataCache};
use pipeline_core::models::{Direction, PeriodType};
use pipeline_core::store::StrategyStore;
use uuid::Uuid;

/// Run a leveraged backtest for one strategy over one or more symbols.
#[derive(Parser, Debug)]
#[command(name = "backtest_run", about = "Run a strategy rule against cached OHLCV data")]
struct Cli {
    /// Path to a JSON file holding the strategy rule (`StrategyRule::from_code` input).
    #[arg(long)]
    rule: PathBuf,

    /// Symbols to backtest against, e.g. `-s BTC -s ETH`. A single symbol runs
    /// `backtest_single`; more than one runs `backtest_portfolio`.
    #[arg(short = 's', long = "symbol", required = true)]
    symbols: Vec<String>,

    /// Candle interval (one of the pipeline's supported timeframes).
    #[arg(long, default_value = "1h")]
    interval: String,

    /// Number of most recent candles to load per symbol.
    #[arg(long, default_value_t = 2000)]
    limit: usize,

    /// Directory holding cached OHLCV artefacts.
    #[arg(long, default_value = "data/ohlcv")]
    data_dir: PathBuf,

    /// Direction the strategy is allowed to take (`long`, `short`, or `bidi`).
    #[arg(long, default_value = "bidi")]
    direction: String,

    /// Starting equity for the run.
    #[arg(long, default_value_t = 10_000.0)]
    initial_capital: f64,

    /// Taker fee rate applied to each fill.
    #[arg(long, default_value_t = 0.0005)]
    fee_rate: f64,

    /// Slippage applied to entries/exits.
    #[arg(long, default_value_t = 0.0002)]
    slippage: f64,

    /// Fallback leverage when the coin registry has no entry for a symbol.
    #[arg(long, default_value_t = 1)]
    default_leverage: u32,

    /// Emit the full metrics payload as JSON instead of a summary table.
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "pipeline_core=info".into()),
        )
        .init();

    let cli = Cli::parse();

    let direction = Direction::parse(&cli.direction)
        .with_context(|| format!("invalid --direction {:?} (expected long, short, or bidi)", cli.direction))?;

    let code = std::fs::read_to_string(&cli.rule).with_context(|| format!("reading {}", cli.rule.display()))?;
    let rule = StrategyRule::from_code(&code).context("parsing strategy rule")?;

    let fetcher: Arc<dyn ExchangeCandleFetcher> = Arc::new(FakeCandleFetcher::new());
    let cache = MarketDataCache::new(&cli.data_dir, fetcher).context("opening market data cache")?;

    let mut data: HashMap<String, Vec<Candle>> = HashMap::new();
    for symbol in &cli.symbols {
        let candles = cache
            .load(symbol, &cli.interval, 0, cli.limit)
            .await
            .with_context(|| format!("loading candles for {symbol}"))?;
        if candles.is_empty() {
            anyhow::bail!(
                "no cached candles for {symbol}/{}; run the pipeline first to populate the cache",
                cli.interval
            );
        }
        data.insert(symbol.clone(), candles);
    }

    let store = StrategyStore::in_memory().context("opening scratch strategy store")?;
    let coin_registry = Arc::new(CoinRegistry::new(store));

    let engine = BacktestEngine::new(
        BacktestConfig {
            initial_capital: cli.initial_capital,
            fee_rate: cli.fee_rate,
            slippage: cli.slippage,
            default_leverage: cli.default_leverage,
        },
        coin_registry,
    );

    let metrics = if data.len() == 1 {
        let (symbol, candles) = data.iter().next().expect("checked len == 1 above");
        engine.backtest_single(&rule, candles, symbol, direction, None)
    } else {
        engine.backtest_portfolio(&rule, &data, direction, None)
    };

    let result = metrics.to_backtest_result(
        Uuid::new_v4().to_string(),
        "adhoc".to_string(),
        PeriodType::Full,
        false,
        false,
        false,
        0.0,
        metrics.sharpe,
        0.0,
        0.0,
    );

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!("symbols:        {}", cli.symbols.join(","));
        println!("total_trades:   {}", result.total_trades);
        println!("total_return:   {:.4}", result.total_return);
        println!("sharpe:         {:.4}", result.sharpe);
        println!("sortino:        {:.4}", result.sortino);
        println!("max_drawdown:   {:.4}", result.max_drawdown);
        println!("win_rate:       {:.4}", result.win_rate);
        println!("profit_factor:  {:.4}", result.profit_factor);
        println!("expectancy:     {:.4}", result.expectancy);
        println!("avg_leverage:   {:.2}", result.avg_leverage);
        println!("max_margin_pct: {:.4}", result.max_margin_pct);
        println!("final_equity:   {:.2}", result.final_equity);
        for breakdown in &result.per_symbol {
            println!(
                "  {:<10} trades={:<6} return={:.4}",
                breakdown.symbol, breakdown.total_trades, breakdown.total_return
            );
        }
    }

    if result.total_trades == 0 {
        eprintln!("warning: strategy produced no trades over the requested window");
    }

    Ok(())
}
