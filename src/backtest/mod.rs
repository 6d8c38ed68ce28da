//! Backtesting subsystem (spec §4.4): the strategy-code IR, the leveraged
//! engine, and the walk-forward optimiser.

pub mod engine;
pub mod signal;
pub mod walk_forward;

pub use engine::{BacktestConfig, BacktestEngine, BacktestMetrics, LeveragedTrade};
pub use signal::{BinOp, CmpOp, Expr, Field, RollOp, Signal, StopType, StrategyRule};
pub use walk_forward::{WalkForwardConfig, WalkForwardOptimizer, WalkForwardResult};
