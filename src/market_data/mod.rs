//! Market-data collaborators (spec §4.2, §4.3): the OHLCV artefact cache and
//! the in-memory coin registry. Neither module talks to an exchange
//! directly — both are driven through the seams in `crate::exchange` and
//! `crate::store`.

mod cache;
mod coin_registry;

pub use cache::{CacheMeta, MarketDataCache};
pub use coin_registry::CoinRegistry;
