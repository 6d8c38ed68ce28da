//! Core entities (spec §3). Every persisted entity derives `Serialize,
//! Deserialize` (teacher convention, `src/models.rs`/`vault/vault_db.rs`) and
//! carries a `*_from_row`/`*_params` pair for `rusqlite` mapping — no ORM,
//! matching the teacher's choice of `rusqlite` over `diesel`/`sqlx`.

mod backtest_result;
mod coin;
mod event;
mod ledger_update;
mod strategy;
mod subaccount;
mod trade;

pub use backtest_result::{BacktestResult, PeriodType, SymbolBreakdown};
pub use coin::CoinInfo;
pub use event::{EventType, StrategyEvent};
pub use ledger_update::{LedgerDirection, LedgerKind, LedgerUpdate};
pub use strategy::{Direction, Strategy, StrategyStatus, Timeframe};
pub use subaccount::{Subaccount, SubaccountStatus};
pub use trade::Trade;
