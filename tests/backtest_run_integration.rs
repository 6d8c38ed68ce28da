//! End-to-end exercise of the backtest engine through the public library
//! surface: build a strategy rule, run it against a synthetic candle series,
//! and check the metrics it produces make sense together (spec §4.4).

use std::collections::HashMap;
use std::sync::Arc;

use pipeline_core::backtest::{BacktestConfig, BacktestEngine, CmpOp, Expr, Field, RollOp, Signal, StopType, StrategyRule};
use pipeline_core::exchange::Candle;
use pipeline_core::market_data::CoinRegistry;
use pipeline_core::models::Direction;
use pipeline_core::store::StrategyStore;

fn candle(ts: i64, close: f64) -> Candle {
    Candle {
        timestamp_ms: ts,
        open: close,
        high: close * 1.001,
        low: close * 0.999,
        close,
        volume: 100.0,
    }
}

/// A rising-then-falling sawtooth so a "buy when price > its 3-bar mean"
/// rule gets both winning and losing round-trips.
fn sawtooth_candles(n: usize) -> Vec<Candle> {
    (0..n)
        .map(|i| {
            let phase = (i % 20) as f64;
            let price = 100.0 + if phase < 10.0 { phase } else { 20.0 - phase };
            candle(i as i64 * 60_000, price)
        })
        .collect()
}

fn crossover_rule() -> StrategyRule {
    let mean_3 = Expr::Rolling {
        inner: Box::new(Expr::Field(Field::Close)),
        window: 3,
        op: RollOp::Mean,
        center: false,
    };
    StrategyRule {
        entry_long: Some(Expr::Cmp(CmpOp::Gt, Box::new(Expr::Field(Field::Close)), Box::new(mean_3.clone()))),
        entry_short: None,
        exit: Some(Expr::Cmp(CmpOp::Lt, Box::new(Expr::Field(Field::Close)), Box::new(mean_3))),
        leverage: Some(2),
        atr_stop_multiplier: None,
        atr_take_multiplier: None,
        sl_type: StopType::Fixed,
        tp_type: StopType::Fixed,
    }
}

fn engine(initial_capital: f64) -> BacktestEngine {
    let store = StrategyStore::in_memory().expect("in-memory store");
    let coin_registry = Arc::new(CoinRegistry::new(store));
    BacktestEngine::new(
        BacktestConfig {
            initial_capital,
            fee_rate: 0.0005,
            slippage: 0.0002,
            default_leverage: 1,
        },
        coin_registry,
    )
}

#[test]
fn crossover_rule_round_trips_through_from_code_and_trades() {
    let rule = crossover_rule();
    let code = rule.to_code().expect("serialize rule");
    let reparsed = StrategyRule::from_code(&code).expect("parse rule back");

    let candles = sawtooth_candles(200);
    let metrics = engine(10_000.0).backtest_single(&reparsed, &candles, "BTC", Direction::Long, None);

    assert!(metrics.total_trades > 0, "sawtooth crossover rule should produce trades");
    assert_eq!(metrics.per_symbol.len(), 1);
    assert_eq!(metrics.per_symbol[0].symbol, "BTC");
    assert!(metrics.final_equity.is_finite());
    assert!(metrics.max_drawdown >= 0.0);
}

#[test]
fn flat_strategy_produces_no_trades_and_preserves_capital() {
    let rule = StrategyRule {
        entry_long: None,
        entry_short: None,
        exit: None,
        leverage: Some(1),
        atr_stop_multiplier: None,
        atr_take_multiplier: None,
        sl_type: StopType::Fixed,
        tp_type: StopType::Fixed,
    };
    let candles = sawtooth_candles(50);
    let metrics = engine(5_000.0).backtest_single(&rule, &candles, "ETH", Direction::Long, None);

    assert_eq!(metrics.total_trades, 0);
    assert_eq!(metrics.final_equity, 5_000.0);
    assert_eq!(metrics.total_return, 0.0);
}

#[test]
fn portfolio_backtest_aggregates_per_symbol_breakdowns() {
    let rule = crossover_rule();
    let mut data: HashMap<String, Vec<Candle>> = HashMap::new();
    data.insert("BTC".to_string(), sawtooth_candles(150));
    data.insert("ETH".to_string(), sawtooth_candles(150));

    let metrics = engine(20_000.0).backtest_portfolio(&rule, &data, Direction::Long, None);

    assert_eq!(metrics.per_symbol.len(), 2);
    let symbols: Vec<&str> = metrics.per_symbol.iter().map(|b| b.symbol.as_str()).collect();
    assert!(symbols.contains(&"BTC"));
    assert!(symbols.contains(&"ETH"));
    assert!(metrics.total_trades >= metrics.per_symbol[0].total_trades);
}

#[test]
fn exit_signal_takes_priority_over_entry_on_a_flat_to_flat_bar() {
    let rule = StrategyRule {
        entry_long: Some(Expr::Const(1.0)),
        entry_short: None,
        exit: Some(Expr::Const(1.0)),
        leverage: Some(1),
        atr_stop_multiplier: None,
        atr_take_multiplier: None,
        sl_type: StopType::Fixed,
        tp_type: StopType::Fixed,
    };
    let candles = vec![candle(0, 100.0), candle(60_000, 101.0)];
    assert_eq!(rule.generate_signal(&candles), Some(Signal::Close));
}
