//! Metrics recorder (spec §4.13), grounded on
//! `examples/original_source/src/metrics/collector.py`'s `MetricsCollector`:
//! a periodic snapshot of queue depths, throughput/success rates pulled from
//! the event log (never from live counts, since events survive strategy
//! deletion), pool utilisation, average ACTIVE-pool Sharpe, a pattern/AI
//! provenance split, and an overall health tag. Persisted via
//! `StrategyStore::insert_metrics_snapshot`.

use std::collections::HashMap;

use anyhow::Result;
use chrono::{Duration, Utc};
use serde_json::json;
use tracing::info;

use crate::config::RotatorConfig;
use crate::models::{EventType, StrategyStatus};
use crate::store::StrategyStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Critical,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub queue_depths: HashMap<String, i64>,
    pub success_rate: f64,
    pub failure_rate: f64,
    pub utilisation: f64,
    pub avg_active_sharpe: f64,
    pub pattern_count: i64,
    pub ai_count: i64,
    pub status: HealthStatus,
}

/// `_get_overall_status`: active_count and live_count both zero is either
/// critical (backtest success rate near zero) or degraded (not enough
/// signal yet to call it critical); a thin ACTIVE pool below 10 is always
/// degraded even with strategies LIVE.
pub fn classify_health(active_count: i64, live_count: i64, backtest_success_rate: Option<f64>) -> HealthStatus {
    if active_count == 0 && live_count == 0 {
        return match backtest_success_rate {
            Some(rate) if rate < 0.01 => HealthStatus::Critical,
            _ => HealthStatus::Degraded,
        };
    }
    if active_count < 10 {
        return HealthStatus::Degraded;
    }
    HealthStatus::Healthy
}

pub struct MetricsRecorder {
    store: StrategyStore,
    max_live_strategies: usize,
    /// Lookback window for throughput/success-rate aggregation over the
    /// event log (Python's `get_funnel_metrics(hours=24)` default).
    rate_window: Duration,
}

impl MetricsRecorder {
    pub fn new(store: StrategyStore, rotator: &RotatorConfig) -> Self {
        Self {
            store,
            max_live_strategies: rotator.max_live_strategies,
            rate_window: Duration::hours(24),
        }
    }

    pub fn with_rate_window(mut self, window: Duration) -> Self {
        self.rate_window = window;
        self
    }

    /// One collection cycle: assemble a snapshot from the current queue
    /// depths and the event log, persist it, and return it for logging.
    pub async fn collect_and_persist(&self) -> Result<MetricsSnapshot> {
        let counts = self.store.count_by_status().await?;
        let queue_depths: HashMap<String, i64> = [
            StrategyStatus::Generated,
            StrategyStatus::Validated,
            StrategyStatus::Active,
            StrategyStatus::Live,
            StrategyStatus::Retired,
            StrategyStatus::Failed,
        ]
        .into_iter()
        .map(|s| (s.as_str().to_string(), *counts.get(s.as_str()).unwrap_or(&0)))
        .collect();

        let active_count = queue_depths.get("ACTIVE").copied().unwrap_or(0);
        let live_count = queue_depths.get("LIVE").copied().unwrap_or(0);

        let since = Utc::now() - self.rate_window;
        let events = self.store.events_since(since).await?;

        let mut passed = 0i64;
        let mut failed = 0i64;
        for event in &events {
            match event.event_type {
                EventType::ValidationPassed | EventType::BacktestCompleted | EventType::DeploymentSucceeded => {
                    passed += 1
                }
                EventType::ValidationFailed | EventType::BacktestFailed | EventType::DeploymentFailed => {
                    failed += 1
                }
                _ => {}
            }
        }
        let total = passed + failed;
        let success_rate = if total > 0 { passed as f64 / total as f64 } else { 1.0 };
        let failure_rate = 1.0 - success_rate;

        let utilisation = if self.max_live_strategies > 0 {
            (live_count as f64 / self.max_live_strategies as f64).clamp(0.0, 1.0)
        } else {
            0.0
        };

        let active_strategies = self.store.list_by_status(StrategyStatus::Active).await?;
        let mut sharpe_sum = 0.0;
        let mut sharpe_n = 0u32;
        let mut pattern_count = 0i64;
        let mut ai_count = 0i64;
        for strategy in &active_strategies {
            if let Some(result) = self.store.latest_backtest_result(&strategy.id).await? {
                sharpe_sum += result.sharpe;
                sharpe_n += 1;
            }
            if strategy.generation_mode == "pattern" {
                pattern_count += 1;
            } else {
                ai_count += 1;
            }
        }
        let avg_active_sharpe = if sharpe_n > 0 { sharpe_sum / sharpe_n as f64 } else { 0.0 };

        let status = classify_health(
            active_count,
            live_count,
            if total > 0 { Some(success_rate) } else { None },
        );

        self.store
            .insert_metrics_snapshot(
                Utc::now(),
                &json!(queue_depths),
                &json!({ "passed": passed, "failed": failed, "window_hours": self.rate_window.num_hours() }),
                success_rate,
                failure_rate,
                utilisation,
                avg_active_sharpe,
                &json!({ "pattern": pattern_count, "ai": ai_count }),
                status.as_str(),
            )
            .await?;

        info!(
            status = status.as_str(),
            generated = queue_depths.get("GENERATED").copied().unwrap_or(0),
            validated = queue_depths.get("VALIDATED").copied().unwrap_or(0),
            active = active_count,
            live = live_count,
            success_rate,
            avg_active_sharpe,
            "recorded pipeline metrics snapshot"
        );

        Ok(MetricsSnapshot {
            queue_depths,
            success_rate,
            failure_rate,
            utilisation,
            avg_active_sharpe,
            pattern_count,
            ai_count,
            status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ActivePoolConfig, RotatorConfig, SelectionConfig};
    use crate::models::{Direction, Strategy, Timeframe};
    use crate::store::NewEvent;
    use std::collections::HashMap as Map;

    fn rotator(max_live: usize) -> RotatorConfig {
        RotatorConfig {
            check_interval_minutes: 15,
            max_live_strategies: max_live,
            min_pool_size: 0,
            selection: SelectionConfig { max_per_type: 2, max_per_timeframe: 2 },
        }
    }

    fn strategy(id: &str, status: StrategyStatus) -> Strategy {
        Strategy {
            id: id.to_string(),
            name: id.to_string(),
            kind: "MOM".to_string(),
            timeframe: Timeframe::parse("1h").unwrap(),
            direction: Direction::Long,
            code: "{}".to_string(),
            base_code_hash: "hash".to_string(),
            parameters: Map::new(),
            trading_coins: vec!["BTC".to_string()],
            status,
            score_backtest: Some(80.0),
            claim_worker_id: None,
            claim_started_at: None,
            created_at: Utc::now(),
            validated_at: None,
            tested_at: None,
            live_since: None,
            retired_at: None,
            generation_mode: "pattern".to_string(),
        }
    }

    #[tokio::test]
    async fn empty_pool_with_no_events_is_degraded_not_critical() {
        let store = StrategyStore::in_memory().unwrap();
        let recorder = MetricsRecorder::new(store, &rotator(10));
        let snapshot = recorder.collect_and_persist().await.unwrap();
        assert_eq!(snapshot.status, HealthStatus::Degraded);
    }

    #[tokio::test]
    async fn thin_active_pool_is_always_degraded() {
        let store = StrategyStore::in_memory().unwrap();
        store.insert_strategy(&strategy("s1", StrategyStatus::Active)).await.unwrap();
        let recorder = MetricsRecorder::new(store, &rotator(10));
        let snapshot = recorder.collect_and_persist().await.unwrap();
        assert_eq!(snapshot.status, HealthStatus::Degraded);
        assert_eq!(snapshot.queue_depths.get("ACTIVE"), Some(&1));
    }

    #[tokio::test]
    async fn success_rate_reflects_event_log_not_live_counts() {
        let store = StrategyStore::in_memory().unwrap();
        store.insert_strategy(&strategy("s1", StrategyStatus::Active)).await.unwrap();
        store
            .append_event(NewEvent {
                strategy_id: "s1".to_string(),
                stage: "backtest".to_string(),
                event_type: EventType::BacktestCompleted,
                status: "passed".to_string(),
                duration_ms: Some(100),
                payload: None,
            })
            .await
            .unwrap();
        store
            .append_event(NewEvent {
                strategy_id: "s1".to_string(),
                stage: "backtest".to_string(),
                event_type: EventType::BacktestFailed,
                status: "failed".to_string(),
                duration_ms: Some(50),
                payload: None,
            })
            .await
            .unwrap();

        let recorder = MetricsRecorder::new(store, &rotator(10));
        let snapshot = recorder.collect_and_persist().await.unwrap();
        assert_eq!(snapshot.success_rate, 0.5);
        assert_eq!(snapshot.failure_rate, 0.5);
    }

    #[test]
    fn classify_health_matches_original_thresholds() {
        assert_eq!(classify_health(0, 0, Some(0.005)), HealthStatus::Critical);
        assert_eq!(classify_health(0, 0, None), HealthStatus::Degraded);
        assert_eq!(classify_health(5, 0, Some(0.5)), HealthStatus::Degraded);
        assert_eq!(classify_health(20, 5, Some(0.9)), HealthStatus::Healthy);
    }
}
