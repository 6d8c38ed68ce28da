//! `StrategyStore`: the sole source of truth for strategy state and the
//! atomic claim protocol (spec §4.1).
//!
//! Grounded on `vault::vault_db::VaultDb` (`Arc<tokio::sync::Mutex<Connection>>`,
//! WAL pragmas, schema-in-const-string, async methods that lock then issue
//! plain `rusqlite` calls) and `signals::db_storage::DbSignalStorage`
//! (prepared statements, index strategy). `claim_batch` and
//! `commit_transition` each run inside an explicit `BEGIN IMMEDIATE`
//! transaction — SQLite's single-writer model gives the serialisability the
//! protocol needs without a separate lock manager (spec §9).

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::StoreError;
use crate::models::{
    BacktestResult, Direction, EventType, LedgerUpdate, PeriodType, Strategy, StrategyEvent,
    StrategyStatus, Subaccount, SubaccountStatus, SymbolBreakdown, Timeframe, Trade,
};

use super::schema;

fn millis(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

fn opt_millis(dt: Option<DateTime<Utc>>) -> Option<i64> {
    dt.map(millis)
}

fn opt_from_millis(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.map(from_millis)
}

/// Fields a worker may write on `commit_transition` (spec §4.1). Everything
/// not named here is left untouched.
#[derive(Debug, Clone, Default)]
pub struct StrategyPatch {
    pub code: Option<String>,
    pub score_backtest: Option<f64>,
    pub validated_at: Option<DateTime<Utc>>,
    pub tested_at: Option<DateTime<Utc>>,
    pub live_since: Option<DateTime<Utc>>,
    pub retired_at: Option<DateTime<Utc>>,
}

/// A `StrategyEvent` row not yet persisted (store assigns the id).
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub strategy_id: String,
    pub stage: String,
    pub event_type: EventType,
    pub status: String,
    pub duration_ms: Option<i64>,
    pub payload: Option<serde_json::Value>,
}

#[derive(Clone)]
pub struct StrategyStore {
    conn: Arc<Mutex<Connection>>,
}

impl StrategyStore {
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).context("open strategy store db")?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON").ok();

        for stmt in schema::ALL_STATEMENTS {
            conn.execute(stmt, []).context("apply schema statement")?;
        }
        conn.execute(
            "INSERT INTO schema_metadata (key, value) VALUES ('schema_version', ?1)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![schema::SCHEMA_VERSION.to_string()],
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn in_memory() -> Result<Self> {
        Self::new(":memory:")
    }

    // ---- Strategy CRUD -------------------------------------------------

    pub async fn insert_strategy(&self, s: &Strategy) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO strategies (
                id, name, kind, timeframe, direction, code, base_code_hash,
                parameters, trading_coins, status, score_backtest,
                claim_worker_id, claim_started_at, created_at, validated_at,
                tested_at, live_since, retired_at, generation_mode
             ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19)",
            params![
                s.id,
                s.name,
                s.kind,
                s.timeframe.as_str(),
                s.direction.as_str(),
                s.code,
                s.base_code_hash,
                serde_json::to_string(&s.parameters)?,
                serde_json::to_string(&s.trading_coins)?,
                s.status.as_str(),
                s.score_backtest,
                s.claim_worker_id,
                opt_millis(s.claim_started_at),
                millis(s.created_at),
                opt_millis(s.validated_at),
                opt_millis(s.tested_at),
                opt_millis(s.live_since),
                opt_millis(s.retired_at),
                s.generation_mode,
            ],
        )?;
        Ok(())
    }

    pub async fn get_strategy(&self, id: &str) -> Result<Option<Strategy>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, name, kind, timeframe, direction, code, base_code_hash, parameters,
                    trading_coins, status, score_backtest, claim_worker_id, claim_started_at,
                    created_at, validated_at, tested_at, live_since, retired_at, generation_mode
             FROM strategies WHERE id = ?1",
        )?;
        stmt.query_row([id], row_to_strategy).optional().context("get_strategy")
    }

    /// Atomically select up to `limit` rows in `status` with no claim or a
    /// stale one, mark them claimed by `worker_id`, and return them (spec
    /// §4.1 `claim_batch`).
    pub async fn claim_batch(
        &self,
        status: StrategyStatus,
        worker_id: &str,
        limit: usize,
        max_age: chrono::Duration,
    ) -> Result<Vec<Strategy>> {
        let mut conn = self.conn.lock().await;
        let now = Utc::now();
        let stale_before = millis(now - max_age);
        let tx = conn.transaction()?;
        let ids: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT id FROM strategies
                 WHERE status = ?1
                   AND (claim_worker_id IS NULL OR claim_started_at < ?2)
                 ORDER BY created_at ASC
                 LIMIT ?3",
            )?;
            let rows = stmt.query_map(
                params![status.as_str(), stale_before, limit as i64],
                |row| row.get::<_, String>(0),
            )?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        for id in &ids {
            tx.execute(
                "UPDATE strategies SET claim_worker_id = ?1, claim_started_at = ?2
                 WHERE id = ?3",
                params![worker_id, millis(now), id],
            )?;
        }
        tx.commit()?;

        let mut out = Vec::with_capacity(ids.len());
        for id in &ids {
            let mut stmt = conn.prepare_cached(
                "SELECT id, name, kind, timeframe, direction, code, base_code_hash, parameters,
                        trading_coins, status, score_backtest, claim_worker_id, claim_started_at,
                        created_at, validated_at, tested_at, live_since, retired_at, generation_mode
                 FROM strategies WHERE id = ?1",
            )?;
            if let Some(s) = stmt.query_row([id], row_to_strategy).optional()? {
                out.push(s);
            }
        }
        Ok(out)
    }

    /// Atomically verify `from_status`/claim ownership, apply `patch`,
    /// transition to `to_status`, clear the claim, and append `events`
    /// (spec §4.1 `commit_transition`). Fails with `StaleClaim` if the
    /// status or claim changed since the caller's claim.
    pub async fn commit_transition(
        &self,
        strategy_id: &str,
        worker_id: &str,
        from_status: StrategyStatus,
        to_status: StrategyStatus,
        patch: StrategyPatch,
        events: Vec<NewEvent>,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().await;
        let tx = conn
            .transaction()
            .map_err(|e| StoreError::Transient(e.to_string()))?;

        let current: Option<(String, Option<String>)> = tx
            .query_row(
                "SELECT status, claim_worker_id FROM strategies WHERE id = ?1",
                [strategy_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(|e| StoreError::Transient(e.to_string()))?;

        let (status, claim_owner) = match current {
            Some(v) => v,
            None => {
                return Err(StoreError::Integrity(format!(
                    "strategy {strategy_id} does not exist"
                )))
            }
        };

        if status != from_status.as_str() || claim_owner.as_deref() != Some(worker_id) {
            return Err(StoreError::StaleClaim {
                strategy_id: strategy_id.to_string(),
                expected: from_status.as_str().to_string(),
                found: status,
            });
        }

        if !from_status.can_transition_to(to_status) {
            return Err(StoreError::Integrity(format!(
                "illegal transition {} -> {}",
                from_status.as_str(),
                to_status.as_str()
            )));
        }

        tx.execute(
            "UPDATE strategies SET
                status = ?1,
                code = COALESCE(?2, code),
                score_backtest = COALESCE(?3, score_backtest),
                validated_at = COALESCE(?4, validated_at),
                tested_at = COALESCE(?5, tested_at),
                live_since = COALESCE(?6, live_since),
                retired_at = COALESCE(?7, retired_at),
                claim_worker_id = NULL,
                claim_started_at = NULL
             WHERE id = ?8",
            params![
                to_status.as_str(),
                patch.code,
                patch.score_backtest,
                opt_millis(patch.validated_at),
                opt_millis(patch.tested_at),
                opt_millis(patch.live_since),
                opt_millis(patch.retired_at),
                strategy_id,
            ],
        )
        .map_err(|e| StoreError::Transient(e.to_string()))?;

        for ev in events {
            insert_event_tx(&tx, &ev).map_err(|e| StoreError::Transient(e.to_string()))?;
        }

        tx.commit().map_err(|e| StoreError::Transient(e.to_string()))?;
        Ok(())
    }

    /// Reset the claim if it is still owned by `worker_id`.
    pub async fn release_claim(&self, strategy_id: &str, worker_id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE strategies SET claim_worker_id = NULL, claim_started_at = NULL
             WHERE id = ?1 AND claim_worker_id = ?2",
            params![strategy_id, worker_id],
        )?;
        Ok(())
    }

    /// Release any claim older than `max_age`. Strategies are left in their
    /// current status (spec §4.1: the sweeper never moves strategies to
    /// FAILED; the next worker simply picks them up).
    pub async fn sweep_stale_claims(&self, max_age: chrono::Duration) -> Result<usize> {
        let conn = self.conn.lock().await;
        let stale_before = millis(Utc::now() - max_age);
        let n = conn.execute(
            "UPDATE strategies SET claim_worker_id = NULL, claim_started_at = NULL
             WHERE claim_worker_id IS NOT NULL AND claim_started_at < ?1",
            params![stale_before],
        )?;
        Ok(n)
    }

    pub async fn count_by_status(&self) -> Result<HashMap<String, i64>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached("SELECT status, COUNT(*) FROM strategies GROUP BY status")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
        let mut out = HashMap::new();
        for row in rows {
            let (status, count) = row?;
            out.insert(status, count);
        }
        Ok(out)
    }

    pub async fn list_by_status(&self, status: StrategyStatus) -> Result<Vec<Strategy>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, name, kind, timeframe, direction, code, base_code_hash, parameters,
                    trading_coins, status, score_backtest, claim_worker_id, claim_started_at,
                    created_at, validated_at, tested_at, live_since, retired_at, generation_mode
             FROM strategies WHERE status = ?1 ORDER BY score_backtest DESC",
        )?;
        let rows = stmt.query_map([status.as_str()], row_to_strategy)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().context("list_by_status")
    }

    // ---- Events ----------------------------------------------------------

    pub async fn append_event(&self, event: NewEvent) -> Result<()> {
        let conn = self.conn.lock().await;
        insert_event_tx(&conn, &event)?;
        Ok(())
    }

    /// Events survive strategy deletion; metrics derive from this log, not
    /// from current strategy counts (spec §9).
    pub async fn events_since(&self, since: DateTime<Utc>) -> Result<Vec<StrategyEvent>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, strategy_id, stage, event_type, status, duration_ms, payload, timestamp
             FROM strategy_events WHERE timestamp >= ?1 ORDER BY timestamp ASC",
        )?;
        let rows = stmt.query_map([millis(since)], row_to_event)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().context("events_since")
    }

    // ---- Backtest results --------------------------------------------------

    pub async fn insert_backtest_result(&self, result: &BacktestResult) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO backtest_results (
                id, strategy_id, period_type, sharpe, sortino, max_drawdown, win_rate,
                expectancy, profit_factor, total_trades, total_return, final_equity,
                avg_leverage, max_margin_pct, per_symbol, lookahead_check_passed,
                shuffle_test_passed, multi_window_passed, shuffle_p_value,
                multi_window_avg_sharpe, multi_window_std_sharpe, multi_window_cv, created_at
             ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21,?22,?23)",
            params![
                result.id,
                result.strategy_id,
                result.period_type.as_str(),
                result.sharpe,
                result.sortino,
                result.max_drawdown,
                result.win_rate,
                result.expectancy,
                result.profit_factor,
                result.total_trades as i64,
                result.total_return,
                result.final_equity,
                result.avg_leverage,
                result.max_margin_pct,
                serde_json::to_string(&result.per_symbol)?,
                result.lookahead_check_passed,
                result.shuffle_test_passed,
                result.multi_window_passed,
                result.shuffle_p_value,
                result.multi_window_avg_sharpe,
                result.multi_window_std_sharpe,
                result.multi_window_cv,
                millis(result.created_at),
            ],
        )?;
        Ok(())
    }

    pub async fn latest_backtest_result(&self, strategy_id: &str) -> Result<Option<BacktestResult>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, strategy_id, period_type, sharpe, sortino, max_drawdown, win_rate,
                    expectancy, profit_factor, total_trades, total_return, final_equity,
                    avg_leverage, max_margin_pct, per_symbol, lookahead_check_passed,
                    shuffle_test_passed, multi_window_passed, shuffle_p_value,
                    multi_window_avg_sharpe, multi_window_std_sharpe, multi_window_cv, created_at
             FROM backtest_results WHERE strategy_id = ?1 ORDER BY created_at DESC LIMIT 1",
        )?;
        stmt.query_row([strategy_id], row_to_backtest_result)
            .optional()
            .context("latest_backtest_result")
    }

    // ---- Subaccounts -------------------------------------------------------

    pub async fn ensure_subaccounts(&self, count: usize) -> Result<()> {
        let conn = self.conn.lock().await;
        for id in 1..=count as i64 {
            conn.execute(
                "INSERT OR IGNORE INTO subaccounts
                    (id, address, status, strategy_id, allocated_capital, current_balance,
                     peak_balance, open_positions_count, last_trade_at)
                 VALUES (?1, ?2, 'PAUSED', NULL, 0, 0, 0, 0, NULL)",
                params![id, format!("subaccount-{id}")],
            )?;
        }
        Ok(())
    }

    pub async fn list_subaccounts(&self) -> Result<Vec<Subaccount>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, address, status, strategy_id, allocated_capital, current_balance,
                    peak_balance, open_positions_count, last_trade_at
             FROM subaccounts ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([], row_to_subaccount)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().context("list_subaccounts")
    }

    pub async fn get_subaccount(&self, id: i64) -> Result<Option<Subaccount>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, address, status, strategy_id, allocated_capital, current_balance,
                    peak_balance, open_positions_count, last_trade_at
             FROM subaccounts WHERE id = ?1",
        )?;
        stmt.query_row([id], row_to_subaccount).optional().context("get_subaccount")
    }

    pub async fn free_subaccounts(&self) -> Result<Vec<Subaccount>> {
        Ok(self
            .list_subaccounts()
            .await?
            .into_iter()
            .filter(|s| s.is_free())
            .collect())
    }

    /// Two-phase deploy transaction (spec §4.9): bind strategy to
    /// subaccount, transition strategy to LIVE. Verifies both sides are
    /// still free/ACTIVE inside the transaction.
    pub async fn deploy_transaction(
        &self,
        strategy_id: &str,
        subaccount_id: i64,
        allocated_capital: f64,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let strategy_status: Option<String> = tx
            .query_row(
                "SELECT status FROM strategies WHERE id = ?1",
                [strategy_id],
                |row| row.get(0),
            )
            .optional()?;
        let subaccount_state: Option<(Option<String>, String)> = tx
            .query_row(
                "SELECT strategy_id, status FROM subaccounts WHERE id = ?1",
                [subaccount_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let still_active = strategy_status.as_deref() == Some(StrategyStatus::Active.as_str());
        let still_free = matches!(
            subaccount_state,
            Some((None, ref status)) if status == SubaccountStatus::Paused.as_str()
        );

        if !still_active || !still_free {
            tx.rollback()?;
            return Ok(false);
        }

        tx.execute(
            "UPDATE subaccounts SET strategy_id = ?1, status = 'ACTIVE', allocated_capital = ?2
             WHERE id = ?3",
            params![strategy_id, allocated_capital, subaccount_id],
        )?;
        tx.execute(
            "UPDATE strategies SET status = 'LIVE', live_since = ?1,
                    claim_worker_id = NULL, claim_started_at = NULL
             WHERE id = ?2",
            params![millis(now), strategy_id],
        )?;
        insert_event_tx(
            &tx,
            &NewEvent {
                strategy_id: strategy_id.to_string(),
                stage: "deployer".to_string(),
                event_type: EventType::DeploymentSucceeded,
                status: "LIVE".to_string(),
                duration_ms: None,
                payload: Some(serde_json::json!({ "subaccount_id": subaccount_id })),
            },
        )?;
        tx.commit()?;
        Ok(true)
    }

    /// Undeploy transaction (spec §4.9): clear the subaccount, retire the
    /// strategy. Exchange-side position closing happens before this call.
    pub async fn undeploy_transaction(
        &self,
        strategy_id: &str,
        subaccount_id: i64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE subaccounts SET strategy_id = NULL, status = 'PAUSED' WHERE id = ?1",
            params![subaccount_id],
        )?;
        conn.execute(
            "UPDATE strategies SET status = 'RETIRED', retired_at = ?1 WHERE id = ?2",
            params![millis(now), strategy_id],
        )?;
        insert_event_tx(
            &conn,
            &NewEvent {
                strategy_id: strategy_id.to_string(),
                stage: "deployer".to_string(),
                event_type: EventType::UndeploymentSucceeded,
                status: "RETIRED".to_string(),
                duration_ms: None,
                payload: Some(serde_json::json!({ "subaccount_id": subaccount_id })),
            },
        )?;
        Ok(())
    }

    pub async fn update_subaccount_balance(
        &self,
        id: i64,
        allocated_capital: f64,
        current_balance: f64,
        peak_balance: f64,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE subaccounts SET allocated_capital = ?1, current_balance = ?2, peak_balance = ?3
             WHERE id = ?4",
            params![allocated_capital, current_balance, peak_balance, id],
        )?;
        Ok(())
    }

    // ---- Ledger dedup -------------------------------------------------------

    pub async fn ledger_hash_seen(&self, tx_hash: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let seen: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM ledger_seen_hashes WHERE tx_hash = ?1",
                [tx_hash],
                |row| row.get(0),
            )
            .optional()?;
        Ok(seen.is_some())
    }

    pub async fn mark_ledger_hash_seen(&self, tx_hash: &str, applied_at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR IGNORE INTO ledger_seen_hashes (tx_hash, applied_at) VALUES (?1, ?2)",
            params![tx_hash, millis(applied_at)],
        )?;
        Ok(())
    }

    // ---- Trades -------------------------------------------------------------

    pub async fn insert_trade(&self, trade: &Trade) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO trades (
                id, strategy_id, subaccount_id, symbol, direction, size, entry_price,
                exit_price, entry_time, exit_time, entry_fee, exit_fee, net_pnl, exit_reason,
                exit_fill_id, leverage, margin
             ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17)",
            params![
                trade.id,
                trade.strategy_id,
                trade.subaccount_id,
                trade.symbol,
                trade.direction.as_str(),
                trade.size,
                trade.entry_price,
                trade.exit_price,
                millis(trade.entry_time),
                opt_millis(trade.exit_time),
                trade.entry_fee,
                trade.exit_fee,
                trade.net_pnl,
                trade.exit_reason,
                trade.exit_fill_id,
                trade.leverage,
                trade.margin,
            ],
        )?;
        Ok(())
    }

    /// Find the open trade for (subaccount, symbol) `TradeSyncer` patches on
    /// position close (spec §4.11).
    pub async fn find_open_trade(&self, subaccount_id: i64, symbol: &str) -> Result<Option<Trade>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, strategy_id, subaccount_id, symbol, direction, size, entry_price,
                    exit_price, entry_time, exit_time, entry_fee, exit_fee, net_pnl, exit_reason,
                    exit_fill_id, leverage, margin
             FROM trades WHERE subaccount_id = ?1 AND symbol = ?2 AND exit_time IS NULL
             ORDER BY entry_time ASC LIMIT 1",
        )?;
        stmt.query_row(params![subaccount_id, symbol], row_to_trade)
            .optional()
            .context("find_open_trade")
    }

    pub async fn close_trade(
        &self,
        trade_id: &str,
        exit_price: f64,
        exit_time: DateTime<Utc>,
        exit_fee: f64,
        net_pnl: f64,
        exit_reason: &str,
        exit_fill_id: &str,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE trades SET exit_price = ?1, exit_time = ?2, exit_fee = ?3, net_pnl = ?4,
                    exit_reason = ?5, exit_fill_id = ?6
             WHERE id = ?7",
            params![
                exit_price,
                millis(exit_time),
                exit_fee,
                net_pnl,
                exit_reason,
                exit_fill_id,
                trade_id,
            ],
        )?;
        Ok(())
    }

    pub async fn fill_already_synced(&self, exit_fill_id: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let seen: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM trades WHERE exit_fill_id = ?1",
                [exit_fill_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(seen.is_some())
    }

    // ---- Coins -------------------------------------------------------------

    /// Bulk upsert, used by whatever populates the `coins` table on its own
    /// cadence (pairs-update job; out of scope here — see spec §1/§4.3). The
    /// registry only ever reads through this store, it never originates coin
    /// data itself.
    pub async fn upsert_coins(&self, coins: &[crate::models::CoinInfo]) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        for coin in coins {
            tx.execute(
                "INSERT INTO coins (symbol, max_leverage, volume_24h, price, is_active, updated_at)
                 VALUES (?1,?2,?3,?4,?5,?6)
                 ON CONFLICT(symbol) DO UPDATE SET
                    max_leverage = excluded.max_leverage,
                    volume_24h = excluded.volume_24h,
                    price = excluded.price,
                    is_active = excluded.is_active,
                    updated_at = excluded.updated_at",
                params![
                    coin.symbol,
                    coin.max_leverage,
                    coin.volume_24h,
                    coin.price,
                    coin.is_active,
                    millis(coin.updated_at),
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub async fn list_coins(&self) -> Result<Vec<crate::models::CoinInfo>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT symbol, max_leverage, volume_24h, price, is_active, updated_at FROM coins",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(crate::models::CoinInfo {
                symbol: row.get(0)?,
                max_leverage: row.get::<_, i64>(1)? as u32,
                volume_24h: row.get(2)?,
                price: row.get(3)?,
                is_active: row.get(4)?,
                updated_at: from_millis(row.get(5)?),
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().context("list_coins")
    }

    // ---- Metrics snapshots ---------------------------------------------------

    pub async fn insert_metrics_snapshot(
        &self,
        timestamp: DateTime<Utc>,
        queue_depths: &serde_json::Value,
        throughput: &serde_json::Value,
        success_rate: f64,
        failure_rate: f64,
        utilisation: f64,
        avg_active_sharpe: f64,
        provenance_breakdown: &serde_json::Value,
        status_tag: &str,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO pipeline_metrics_snapshots (
                timestamp, queue_depths, throughput, success_rate, failure_rate,
                utilisation, avg_active_sharpe, provenance_breakdown, status_tag
             ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
            params![
                millis(timestamp),
                queue_depths.to_string(),
                throughput.to_string(),
                success_rate,
                failure_rate,
                utilisation,
                avg_active_sharpe,
                provenance_breakdown.to_string(),
                status_tag,
            ],
        )?;
        Ok(())
    }
}

fn insert_event_tx(conn: &Connection, ev: &NewEvent) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO strategy_events (strategy_id, stage, event_type, status, duration_ms, payload, timestamp)
         VALUES (?1,?2,?3,?4,?5,?6,?7)",
        params![
            ev.strategy_id,
            ev.stage,
            ev.event_type.as_str(),
            ev.status,
            ev.duration_ms,
            ev.payload.as_ref().map(|p| p.to_string()),
            millis(Utc::now()),
        ],
    )?;
    Ok(())
}

fn row_to_strategy(row: &rusqlite::Row) -> rusqlite::Result<Strategy> {
    let timeframe_raw: String = row.get(3)?;
    let direction_raw: String = row.get(4)?;
    let status_raw: String = row.get(9)?;
    let parameters_raw: String = row.get(7)?;
    let coins_raw: String = row.get(8)?;

    Ok(Strategy {
        id: row.get(0)?,
        name: row.get(1)?,
        kind: row.get(2)?,
        timeframe: Timeframe::parse(&timeframe_raw).unwrap_or_else(|| Timeframe::parse("1h").unwrap()),
        direction: Direction::parse(&direction_raw).unwrap_or(Direction::Long),
        code: row.get(5)?,
        base_code_hash: row.get(6)?,
        parameters: serde_json::from_str(&parameters_raw).unwrap_or_default(),
        trading_coins: serde_json::from_str(&coins_raw).unwrap_or_default(),
        status: StrategyStatus::parse(&status_raw).unwrap_or(StrategyStatus::Generated),
        score_backtest: row.get(10)?,
        claim_worker_id: row.get(11)?,
        claim_started_at: opt_from_millis(row.get(12)?),
        created_at: from_millis(row.get(13)?),
        validated_at: opt_from_millis(row.get(14)?),
        tested_at: opt_from_millis(row.get(15)?),
        live_since: opt_from_millis(row.get(16)?),
        retired_at: opt_from_millis(row.get(17)?),
        generation_mode: row.get(18)?,
    })
}

fn row_to_event(row: &rusqlite::Row) -> rusqlite::Result<StrategyEvent> {
    let event_type_raw: String = row.get(3)?;
    let payload_raw: Option<String> = row.get(6)?;
    Ok(StrategyEvent {
        id: row.get(0)?,
        strategy_id: row.get(1)?,
        stage: row.get(2)?,
        event_type: parse_event_type(&event_type_raw),
        status: row.get(4)?,
        duration_ms: row.get(5)?,
        payload: payload_raw.and_then(|p| serde_json::from_str(&p).ok()),
        timestamp: from_millis(row.get(7)?),
    })
}

fn parse_event_type(s: &str) -> EventType {
    match s {
        "validation.passed" => EventType::ValidationPassed,
        "validation.failed" => EventType::ValidationFailed,
        "backtest.completed" => EventType::BacktestCompleted,
        "backtest.failed" => EventType::BacktestFailed,
        "deployment.succeeded" => EventType::DeploymentSucceeded,
        "deployment.failed" => EventType::DeploymentFailed,
        "undeployment.succeeded" => EventType::UndeploymentSucceeded,
        "balance_reconciliation" => EventType::BalanceReconciliation,
        "trade.synced" => EventType::TradeSynced,
        _ => EventType::ClaimStale,
    }
}

fn row_to_backtest_result(row: &rusqlite::Row) -> rusqlite::Result<BacktestResult> {
    let period_raw: String = row.get(2)?;
    let per_symbol_raw: String = row.get(14)?;
    Ok(BacktestResult {
        id: row.get(0)?,
        strategy_id: row.get(1)?,
        period_type: parse_period_type(&period_raw),
        sharpe: row.get(3)?,
        sortino: row.get(4)?,
        max_drawdown: row.get(5)?,
        win_rate: row.get(6)?,
        expectancy: row.get(7)?,
        profit_factor: row.get(8)?,
        total_trades: row.get::<_, i64>(9)? as usize,
        total_return: row.get(10)?,
        final_equity: row.get(11)?,
        avg_leverage: row.get(12)?,
        max_margin_pct: row.get(13)?,
        per_symbol: serde_json::from_str::<Vec<SymbolBreakdown>>(&per_symbol_raw).unwrap_or_default(),
        lookahead_check_passed: row.get(15)?,
        shuffle_test_passed: row.get(16)?,
        multi_window_passed: row.get(17)?,
        shuffle_p_value: row.get(18)?,
        multi_window_avg_sharpe: row.get(19)?,
        multi_window_std_sharpe: row.get(20)?,
        multi_window_cv: row.get(21)?,
        created_at: from_millis(row.get(22)?),
    })
}

fn parse_period_type(s: &str) -> PeriodType {
    match s {
        "is" => PeriodType::Is,
        "oos" => PeriodType::Oos,
        "full" => PeriodType::Full,
        other => other
            .strip_prefix("window_")
            .and_then(|n| n.parse::<u32>().ok())
            .map(PeriodType::Window)
            .unwrap_or(PeriodType::Full),
    }
}

fn row_to_subaccount(row: &rusqlite::Row) -> rusqlite::Result<Subaccount> {
    let status_raw: String = row.get(2)?;
    Ok(Subaccount {
        id: row.get(0)?,
        address: row.get(1)?,
        status: SubaccountStatus::parse(&status_raw).unwrap_or(SubaccountStatus::Paused),
        strategy_id: row.get(3)?,
        allocated_capital: row.get(4)?,
        current_balance: row.get(5)?,
        peak_balance: row.get(6)?,
        open_positions_count: row.get::<_, i64>(7)? as u32,
        last_trade_at: opt_from_millis(row.get(8)?),
    })
}

fn row_to_trade(row: &rusqlite::Row) -> rusqlite::Result<Trade> {
    let direction_raw: String = row.get(4)?;
    Ok(Trade {
        id: row.get(0)?,
        strategy_id: row.get(1)?,
        subaccount_id: row.get(2)?,
        symbol: row.get(3)?,
        direction: Direction::parse(&direction_raw).unwrap_or(Direction::Long),
        size: row.get(5)?,
        entry_price: row.get(6)?,
        exit_price: row.get(7)?,
        entry_time: from_millis(row.get(8)?),
        exit_time: opt_from_millis(row.get(9)?),
        entry_fee: row.get(10)?,
        exit_fee: row.get(11)?,
        net_pnl: row.get(12)?,
        exit_reason: row.get(13)?,
        exit_fill_id: row.get(14)?,
        leverage: row.get(15)?,
        margin: row.get(16)?,
    })
}

/// Convenience used by `BalanceReconciler`'s ledger application (§4.10, not
/// part of the narrow claim-protocol surface but backed by the same
/// connection pool).
pub fn ledger_dedup_key(update: &LedgerUpdate) -> &str {
    &update.tx_hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;

    fn sample_strategy(id: &str, status: StrategyStatus) -> Strategy {
        Strategy {
            id: id.to_string(),
            name: format!("strat-{id}"),
            kind: "MOM".to_string(),
            timeframe: Timeframe::parse("15m").unwrap(),
            direction: Direction::Long,
            code: "{}".to_string(),
            base_code_hash: "hash".to_string(),
            parameters: Map::new(),
            trading_coins: vec!["BTC".to_string()],
            status,
            score_backtest: None,
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
    async fn claim_batch_is_mutually_exclusive() {
        let store = StrategyStore::in_memory().unwrap();
        store
            .insert_strategy(&sample_strategy("s1", StrategyStatus::Generated))
            .await
            .unwrap();

        let max_age = chrono::Duration::seconds(60);
        let claimed_a = store
            .claim_batch(StrategyStatus::Generated, "worker-a", 10, max_age)
            .await
            .unwrap();
        let claimed_b = store
            .claim_batch(StrategyStatus::Generated, "worker-b", 10, max_age)
            .await
            .unwrap();

        assert_eq!(claimed_a.len(), 1);
        assert_eq!(claimed_b.len(), 0);
    }

    #[tokio::test]
    async fn commit_transition_clears_claim_and_rejects_stale() {
        let store = StrategyStore::in_memory().unwrap();
        store
            .insert_strategy(&sample_strategy("s1", StrategyStatus::Generated))
            .await
            .unwrap();
        let max_age = chrono::Duration::seconds(60);
        store
            .claim_batch(StrategyStatus::Generated, "worker-a", 10, max_age)
            .await
            .unwrap();

        store
            .commit_transition(
                "s1",
                "worker-a",
                StrategyStatus::Generated,
                StrategyStatus::Validated,
                StrategyPatch::default(),
                vec![],
            )
            .await
            .unwrap();

        let s = store.get_strategy("s1").await.unwrap().unwrap();
        assert_eq!(s.status, StrategyStatus::Validated);
        assert!(s.claim_worker_id.is_none());

        // Second commit against the now-stale (pre-transition) status fails.
        let err = store
            .commit_transition(
                "s1",
                "worker-a",
                StrategyStatus::Generated,
                StrategyStatus::Validated,
                StrategyPatch::default(),
                vec![],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::StaleClaim { .. }));
    }

    #[tokio::test]
    async fn sweep_releases_stale_claims_without_changing_status() {
        let store = StrategyStore::in_memory().unwrap();
        store
            .insert_strategy(&sample_strategy("s1", StrategyStatus::Generated))
            .await
            .unwrap();
        store
            .claim_batch(StrategyStatus::Generated, "worker-a", 10, chrono::Duration::seconds(60))
            .await
            .unwrap();

        let swept = store.sweep_stale_claims(chrono::Duration::seconds(0)).await.unwrap();
        assert_eq!(swept, 1);

        let s = store.get_strategy("s1").await.unwrap().unwrap();
        assert!(s.claim_worker_id.is_none());
        assert_eq!(s.status, StrategyStatus::Generated);
    }
}
