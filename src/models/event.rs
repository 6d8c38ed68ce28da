use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Closed vocabulary of event kinds. Grounded on
/// `examples/original_source/src/metrics/collector.py` and
/// `src/rotator/deployer.py`'s emitted event strings — a fixed enum instead
/// of free text, matching the teacher's `vault_activity.kind` convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ValidationPassed,
    ValidationFailed,
    BacktestCompleted,
    BacktestFailed,
    DeploymentSucceeded,
    DeploymentFailed,
    UndeploymentSucceeded,
    BalanceReconciliation,
    TradeSynced,
    ClaimStale,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::ValidationPassed => "validation.passed",
            EventType::ValidationFailed => "validation.failed",
            EventType::BacktestCompleted => "backtest.completed",
            EventType::BacktestFailed => "backtest.failed",
            EventType::DeploymentSucceeded => "deployment.succeeded",
            EventType::DeploymentFailed => "deployment.failed",
            EventType::UndeploymentSucceeded => "undeployment.succeeded",
            EventType::BalanceReconciliation => "balance_reconciliation",
            EventType::TradeSynced => "trade.synced",
            EventType::ClaimStale => "claim.stale",
        }
    }
}

/// Append-only history row. Persists even when the owning Strategy is
/// deleted — metrics derive from this log, not from current strategy counts
/// (spec §9 "Event log as metrics source").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyEvent {
    pub id: i64,
    pub strategy_id: String,
    pub stage: String,
    pub event_type: EventType,
    pub status: String,
    pub duration_ms: Option<i64>,
    pub payload: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}
