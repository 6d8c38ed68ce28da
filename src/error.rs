//! Typed error taxonomy for the pipeline (spec kinds, not a 1:1 exception mirror).
//!
//! Call sites that need to branch on *kind* (retry vs. fail-the-strategy vs.
//! abort-the-process) match on these variants. Glue code and binaries use
//! `anyhow::Result` and let `?` convert through `#[from]`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required config key: {0}")]
    Missing(String),
    #[error("malformed config value for {key}: {reason}")]
    Malformed { key: String, reason: String },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("transient store error: {0}")]
    Transient(String),
    #[error("integrity violation: {0}")]
    Integrity(String),
    #[error("stale claim on strategy {strategy_id}: expected status {expected}, found {found}")]
    StaleClaim {
        strategy_id: String,
        expected: String,
        found: String,
    },
}

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("transient exchange error: {0}")]
    Transient(String),
    #[error("fatal exchange error: {0}")]
    Fatal(String),
}

#[derive(Debug, Error)]
pub enum StrategyError {
    #[error("strategy execution error: {0}")]
    Execution(String),
}

#[derive(Debug, Error)]
pub enum ValidationFail {
    #[error("static AST check failed: {0}")]
    Static(String),
    #[error("empirical shuffle test failed: p={p_value:.4}, signals={signal_count}")]
    Shuffle { p_value: f64, signal_count: usize },
}

#[derive(Debug, Error)]
pub enum DataError {
    #[error("missing OHLCV artefact for {symbol}/{interval}")]
    Missing { symbol: String, interval: String },
    #[error("corrupted OHLCV artefact for {symbol}/{interval}: {reason}")]
    Corrupted {
        symbol: String,
        interval: String,
        reason: String,
    },
    #[error("redownload failed for {0}/{1}: {2}")]
    RedownloadFailed(String, String, String),
    /// `CoinRegistry::max_leverage` on a symbol the registry has never seen
    /// (spec §4.3: no default, fail instead).
    #[error("unknown symbol: {0}")]
    UnknownSymbol(String),
}

/// Top-level error enum a worker loop catches to decide isolate-vs-retry-vs-abort.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Exchange(#[from] ExchangeError),
    #[error(transparent)]
    Strategy(#[from] StrategyError),
    #[error(transparent)]
    Validation(#[from] ValidationFail),
    #[error(transparent)]
    Data(#[from] DataError),
}

impl PipelineError {
    /// Whether the fault should be isolated to the single strategy that raised it
    /// (transitioned to FAILED) rather than bubbled up to the worker loop.
    pub fn is_strategy_isolated(&self) -> bool {
        matches!(
            self,
            PipelineError::Strategy(_)
                | PipelineError::Validation(_)
                | PipelineError::Store(StoreError::Integrity(_))
        )
    }

    /// Whether the caller should simply retry on the next cadence tick.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PipelineError::Store(StoreError::Transient(_))
                | PipelineError::Exchange(ExchangeError::Transient(_))
        )
    }
}
