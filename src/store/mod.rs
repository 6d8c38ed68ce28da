//! Persistent state and the atomic claim protocol (spec §4.1).
//!
//! Grounded on `vault::vault_db::VaultDb` (`Arc<Mutex<Connection>>`, WAL
//! pragmas, `CREATE TABLE IF NOT EXISTS` schema-in-const-string) and
//! `signals::db_storage::DbSignalStorage` (index strategy, prepared
//! statements). SQLite's single-writer model under `BEGIN IMMEDIATE` gives
//! the serialisability the claim protocol needs without a separate lock
//! manager (spec §9).

mod schema;
mod strategy_store;

pub use strategy_store::{NewEvent, StrategyPatch, StrategyStore};
