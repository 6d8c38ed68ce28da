//! Schema DDL, in creation order (spec §6 "each table carries its creation
//! order"). One const string per table, applied in `StrategyStore::new`.

pub const SCHEMA_METADATA: &str = "CREATE TABLE IF NOT EXISTS schema_metadata (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
)";

pub const SCHEMA_STRATEGIES: &str = "CREATE TABLE IF NOT EXISTS strategies (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    kind TEXT NOT NULL,
    timeframe TEXT NOT NULL,
    direction TEXT NOT NULL,
    code TEXT NOT NULL,
    base_code_hash TEXT NOT NULL,
    parameters TEXT NOT NULL,
    trading_coins TEXT NOT NULL,
    status TEXT NOT NULL,
    score_backtest REAL,
    claim_worker_id TEXT,
    claim_started_at INTEGER,
    created_at INTEGER NOT NULL,
    validated_at INTEGER,
    tested_at INTEGER,
    live_since INTEGER,
    retired_at INTEGER,
    generation_mode TEXT NOT NULL
)";

pub const IDX_STRATEGIES_STATUS: &str =
    "CREATE INDEX IF NOT EXISTS idx_strategies_status ON strategies(status)";
pub const IDX_STRATEGIES_CLAIM: &str =
    "CREATE INDEX IF NOT EXISTS idx_strategies_claim ON strategies(status, claim_started_at)";

pub const SCHEMA_BACKTEST_RESULTS: &str = "CREATE TABLE IF NOT EXISTS backtest_results (
    id TEXT PRIMARY KEY,
    strategy_id TEXT NOT NULL,
    period_type TEXT NOT NULL,
    sharpe REAL NOT NULL,
    sortino REAL NOT NULL,
    max_drawdown REAL NOT NULL,
    win_rate REAL NOT NULL,
    expectancy REAL NOT NULL,
    profit_factor REAL NOT NULL,
    total_trades INTEGER NOT NULL,
    total_return REAL NOT NULL,
    final_equity REAL NOT NULL,
    avg_leverage REAL NOT NULL,
    max_margin_pct REAL NOT NULL,
    per_symbol TEXT NOT NULL,
    lookahead_check_passed INTEGER NOT NULL,
    shuffle_test_passed INTEGER NOT NULL,
    multi_window_passed INTEGER NOT NULL,
    shuffle_p_value REAL NOT NULL,
    multi_window_avg_sharpe REAL NOT NULL,
    multi_window_std_sharpe REAL NOT NULL,
    multi_window_cv REAL NOT NULL,
    created_at INTEGER NOT NULL
)";

pub const IDX_BACKTEST_RESULTS_STRATEGY: &str =
    "CREATE INDEX IF NOT EXISTS idx_backtest_results_strategy ON backtest_results(strategy_id)";

pub const SCHEMA_SUBACCOUNTS: &str = "CREATE TABLE IF NOT EXISTS subaccounts (
    id INTEGER PRIMARY KEY,
    address TEXT NOT NULL UNIQUE,
    status TEXT NOT NULL,
    strategy_id TEXT,
    allocated_capital REAL NOT NULL,
    current_balance REAL NOT NULL,
    peak_balance REAL NOT NULL,
    open_positions_count INTEGER NOT NULL,
    last_trade_at INTEGER
)";

pub const SCHEMA_TRADES: &str = "CREATE TABLE IF NOT EXISTS trades (
    id TEXT PRIMARY KEY,
    strategy_id TEXT NOT NULL,
    subaccount_id INTEGER,
    symbol TEXT NOT NULL,
    direction TEXT NOT NULL,
    size REAL NOT NULL,
    entry_price REAL NOT NULL,
    exit_price REAL,
    entry_time INTEGER NOT NULL,
    exit_time INTEGER,
    entry_fee REAL NOT NULL,
    exit_fee REAL NOT NULL,
    net_pnl REAL,
    exit_reason TEXT,
    exit_fill_id TEXT UNIQUE,
    leverage REAL NOT NULL,
    margin REAL NOT NULL
)";

pub const IDX_TRADES_OPEN: &str =
    "CREATE INDEX IF NOT EXISTS idx_trades_open ON trades(subaccount_id, symbol, exit_time)";

pub const SCHEMA_STRATEGY_EVENTS: &str = "CREATE TABLE IF NOT EXISTS strategy_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    strategy_id TEXT NOT NULL,
    stage TEXT NOT NULL,
    event_type TEXT NOT NULL,
    status TEXT NOT NULL,
    duration_ms INTEGER,
    payload TEXT,
    timestamp INTEGER NOT NULL
)";

pub const IDX_STRATEGY_EVENTS_TYPE_TS: &str =
    "CREATE INDEX IF NOT EXISTS idx_strategy_events_type_ts ON strategy_events(event_type, timestamp)";

pub const SCHEMA_LEDGER_SEEN: &str = "CREATE TABLE IF NOT EXISTS ledger_seen_hashes (
    tx_hash TEXT PRIMARY KEY,
    applied_at INTEGER NOT NULL
)";

pub const SCHEMA_PIPELINE_METRICS_SNAPSHOTS: &str = "CREATE TABLE IF NOT EXISTS pipeline_metrics_snapshots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp INTEGER NOT NULL,
    queue_depths TEXT NOT NULL,
    throughput TEXT NOT NULL,
    success_rate REAL NOT NULL,
    failure_rate REAL NOT NULL,
    utilisation REAL NOT NULL,
    avg_active_sharpe REAL NOT NULL,
    provenance_breakdown TEXT NOT NULL,
    status_tag TEXT NOT NULL
)";

pub const SCHEMA_COINS: &str = "CREATE TABLE IF NOT EXISTS coins (
    symbol TEXT PRIMARY KEY,
    max_leverage INTEGER NOT NULL,
    volume_24h REAL NOT NULL,
    price REAL NOT NULL,
    is_active INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
)";

pub const IDX_COINS_ACTIVE: &str =
    "CREATE INDEX IF NOT EXISTS idx_coins_active ON coins(is_active)";

/// Applied in order; `schema_version` bumps with each addition so a future
/// migration step can diff against it (spec §6 migration-order note).
pub const ALL_STATEMENTS: &[&str] = &[
    SCHEMA_METADATA,
    SCHEMA_STRATEGIES,
    IDX_STRATEGIES_STATUS,
    IDX_STRATEGIES_CLAIM,
    SCHEMA_BACKTEST_RESULTS,
    IDX_BACKTEST_RESULTS_STRATEGY,
    SCHEMA_SUBACCOUNTS,
    SCHEMA_TRADES,
    IDX_TRADES_OPEN,
    SCHEMA_STRATEGY_EVENTS,
    IDX_STRATEGY_EVENTS_TYPE_TS,
    SCHEMA_LEDGER_SEEN,
    SCHEMA_PIPELINE_METRICS_SNAPSHOTS,
    SCHEMA_COINS,
    IDX_COINS_ACTIVE,
];

pub const SCHEMA_VERSION: i64 = 1;
