use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StrategyStatus {
    Generated,
    Validated,
    Active,
    Live,
    Retired,
    Failed,
}

impl StrategyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyStatus::Generated => "GENERATED",
            StrategyStatus::Validated => "VALIDATED",
            StrategyStatus::Active => "ACTIVE",
            StrategyStatus::Live => "LIVE",
            StrategyStatus::Retired => "RETIRED",
            StrategyStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "GENERATED" => Some(Self::Generated),
            "VALIDATED" => Some(Self::Validated),
            "ACTIVE" => Some(Self::Active),
            "LIVE" => Some(Self::Live),
            "RETIRED" => Some(Self::Retired),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Invariant 3: the DAG of legal transitions. No back-edges.
    pub fn can_transition_to(&self, to: StrategyStatus) -> bool {
        use StrategyStatus::*;
        matches!(
            (self, to),
            (Generated, Validated)
                | (Generated, Failed)
                | (Validated, Active)
                | (Validated, Failed)
                | (Active, Live)
                | (Active, Retired)
                | (Live, Retired)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Long,
    Short,
    Bidi,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Long => "long",
            Direction::Short => "short",
            Direction::Bidi => "bidi",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "long" => Some(Self::Long),
            "short" => Some(Self::Short),
            "bidi" => Some(Self::Bidi),
            _ => None,
        }
    }
}

/// One of the enumerated timeframes in spec §3. Kept as a thin wrapper over
/// a validated string rather than a closed enum so new exchange-supported
/// intervals don't require a code change — `parse` is still the single
/// admission gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeframe(String);

const VALID_TIMEFRAMES: &[&str] = &[
    "1m", "3m", "5m", "15m", "30m", "1h", "2h", "4h", "8h", "12h", "1d",
];

impl Timeframe {
    pub fn parse(s: &str) -> Option<Self> {
        if VALID_TIMEFRAMES.contains(&s) {
            Some(Self(s.to_string()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A candidate trading rule (spec §3 "Strategy").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Strategy {
    pub id: String,
    pub name: String,
    pub kind: String,
    pub timeframe: Timeframe,
    pub direction: Direction,
    /// Serialized closed expression over OHLCV; see `backtest::signal::Expr`.
    pub code: String,
    pub base_code_hash: String,
    pub parameters: HashMap<String, serde_json::Value>,
    pub trading_coins: Vec<String>,
    pub status: StrategyStatus,
    pub score_backtest: Option<f64>,
    pub claim_worker_id: Option<String>,
    pub claim_started_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub validated_at: Option<DateTime<Utc>>,
    pub tested_at: Option<DateTime<Utc>>,
    pub live_since: Option<DateTime<Utc>>,
    pub retired_at: Option<DateTime<Utc>>,
    /// Provenance tag (e.g. "unger", "manual") — see
    /// `examples/original_source/src/generator/unger/genetic_generator.py`.
    /// Opaque to the pipeline; generation itself is out of scope.
    pub generation_mode: String,
}

impl Strategy {
    pub fn is_claimed(&self) -> bool {
        self.claim_worker_id.is_some()
    }

    pub fn claim_is_stale(&self, now: DateTime<Utc>, max_age: chrono::Duration) -> bool {
        match self.claim_started_at {
            Some(started) => now - started > max_age,
            None => false,
        }
    }
}
