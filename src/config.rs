//! Pipeline configuration.
//!
//! Follows the teacher's `Config::from_env` shape (dotenv + env vars) for
//! tunables, but required keys are Fast-Fail per the original system's
//! `src/config/loader.py`: a missing required value aborts startup rather
//! than silently defaulting. An optional `pipeline.toml` document supplies
//! the nested sections; env vars override individual leaves.

use crate::error::ConfigError;
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct QueueLimits {
    pub generated: usize,
    pub validated: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActivePoolConfig {
    pub max_size: usize,
    pub min_score: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SelectionConfig {
    pub max_per_type: usize,
    pub max_per_timeframe: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RotatorConfig {
    pub check_interval_minutes: u64,
    pub max_live_strategies: usize,
    #[serde(default)]
    pub min_pool_size: usize,
    pub selection: SelectionConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Thresholds {
    pub min_sharpe: f64,
    pub min_win_rate: f64,
    pub max_drawdown: f64,
    pub min_total_trades: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MultiWindowConfig {
    #[serde(default)]
    pub enabled: bool,
    pub windows: usize,
    pub min_avg_sharpe: f64,
    pub max_cv: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BacktestingConfig {
    pub initial_capital: f64,
    pub is_days: u32,
    pub oos_days: u32,
    pub max_coins: usize,
    pub thresholds: Thresholds,
    pub multi_window: MultiWindowConfig,
    pub parallel_workers: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BalanceReconciliationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub catchup_lookback_days: u32,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeConfig {
    pub fee_rate: f64,
    pub slippage: f64,
    pub subaccounts_count: usize,
    pub balance_reconciliation: BalanceReconciliationConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineQueueConfig {
    pub queue_limits: QueueLimits,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TradingConfig {
    pub total_capital: f64,
}

/// Raw document shape loaded from an optional TOML file; every field is
/// optional here so env vars can fill gaps, but `Config::load` rejects a
/// result missing any Fast-Fail-required section.
#[derive(Debug, Clone, Deserialize, Default)]
struct RawDocument {
    pipeline: Option<PipelineQueueConfig>,
    active_pool: Option<ActivePoolConfig>,
    rotator: Option<RotatorConfig>,
    backtesting: Option<BacktestingConfig>,
    hyperliquid: Option<ExchangeConfig>,
    timeframes: Option<Vec<String>>,
    metrics_collection_interval: Option<u64>,
    trading: Option<TradingConfig>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub pipeline: PipelineQueueConfig,
    pub active_pool: ActivePoolConfig,
    pub rotator: RotatorConfig,
    pub backtesting: BacktestingConfig,
    pub hyperliquid: ExchangeConfig,
    pub timeframes: Vec<String>,
    pub metrics_collection_interval_secs: u64,
    pub trading: TradingConfig,
    pub max_claim_age_secs: u64,
    pub metrics_snapshot_interval_secs: u64,
}

impl Config {
    /// Load configuration the Fast-Fail way: required sections missing from
    /// both the TOML document and the environment abort the process.
    pub fn load() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();

        let doc_path = std::env::var("PIPELINE_CONFIG_PATH")
            .unwrap_or_else(|_| "pipeline.toml".to_string());
        let raw = Self::load_raw_document(&doc_path)?;

        let database_path = std::env::var("DATABASE_PATH")
            .map_err(|_| ConfigError::Missing("DATABASE_PATH".to_string()))?;

        let pipeline = raw
            .pipeline
            .ok_or_else(|| ConfigError::Missing("pipeline.queue_limits".to_string()))?;
        let active_pool = raw
            .active_pool
            .ok_or_else(|| ConfigError::Missing("active_pool".to_string()))?;
        let rotator = raw
            .rotator
            .ok_or_else(|| ConfigError::Missing("rotator".to_string()))?;
        let backtesting = raw
            .backtesting
            .ok_or_else(|| ConfigError::Missing("backtesting".to_string()))?;
        let hyperliquid = raw
            .hyperliquid
            .ok_or_else(|| ConfigError::Missing("hyperliquid".to_string()))?;
        let timeframes = raw
            .timeframes
            .ok_or_else(|| ConfigError::Missing("timeframes".to_string()))?;
        let trading = raw
            .trading
            .ok_or_else(|| ConfigError::Missing("trading.total_capital".to_string()))?;

        // Tunables: env override with a sane default, teacher's from_env style.
        let metrics_collection_interval_secs = env_or(
            "METRICS_COLLECTION_INTERVAL_SECS",
            raw.metrics_collection_interval.unwrap_or(300),
        );
        let max_claim_age_secs = env_or("MAX_CLAIM_AGE_SECS", 600);
        let metrics_snapshot_interval_secs =
            env_or("METRICS_SNAPSHOT_INTERVAL_SECS", metrics_collection_interval_secs);

        Ok(Self {
            database_path,
            pipeline,
            active_pool,
            rotator,
            backtesting,
            hyperliquid,
            timeframes,
            metrics_collection_interval_secs,
            trading,
            max_claim_age_secs,
            metrics_snapshot_interval_secs,
        })
    }

    fn load_raw_document(path: &str) -> Result<RawDocument, ConfigError> {
        if !Path::new(path).exists() {
            return Ok(RawDocument::default());
        }
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Malformed {
            key: path.to_string(),
            reason: e.to_string(),
        })?;
        toml::from_str(&text).map_err(|e| ConfigError::Malformed {
            key: path.to_string(),
            reason: e.to_string(),
        })
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_database_path_is_fast_fail() {
        std::env::remove_var("DATABASE_PATH");
        let err = Config::load().unwrap_err();
        assert!(matches!(err, ConfigError::Missing(k) if k == "DATABASE_PATH"));
    }
}
