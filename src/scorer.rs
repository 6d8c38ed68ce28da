//! Strategy scorer (spec §4.7).
//!
//! The original system has no single `scorer.py` — `api/routes/pipeline.py`
//! sketches a "rough mapping" (`score = min(sharpe * 50, 100)`) for dashboard
//! buckets, and `rotator/selector.py` simply filters/orders on whatever
//! `Strategy.score_backtest` already holds. This module is the missing
//! piece that actually *writes* that column: hard pass/fail gates from
//! `config::Thresholds`, then a weighted 0-100 composite for everything that
//! clears the gates, in the same spirit as the dashboard's rough mapping but
//! folding in win-rate/drawdown/multi-window stability too.

use crate::config::{MultiWindowConfig, Thresholds};
use crate::models::BacktestResult;

/// Score assigned to a result that fails any hard gate. Strictly below any
/// `min_score` the Selector would use (spec §4.8), so a gate failure can
/// never be select-eligible regardless of how low `min_score` is configured.
pub const GATE_FAILED_SCORE: f64 = -1.0;

/// Sharpe considered "maximal" for normalisation purposes — not a hard cap,
/// just the point past which the composite stops rewarding further Sharpe.
const SHARPE_NORMALIZER: f64 = 3.0;

/// Expectancy (in dollars per trade) considered "maximal" for normalisation.
const EDGE_NORMALIZER: f64 = 50.0;

#[derive(Debug, Clone, Copy)]
pub struct ScoreWeights {
    pub edge: f64,
    pub sharpe: f64,
    pub stability: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self { edge: 0.4, sharpe: 0.4, stability: 0.2 }
    }
}

pub struct Scorer {
    thresholds: Thresholds,
    multi_window: MultiWindowConfig,
    weights: ScoreWeights,
}

impl Scorer {
    pub fn new(thresholds: Thresholds, multi_window: MultiWindowConfig) -> Self {
        Self { thresholds, multi_window, weights: ScoreWeights::default() }
    }

    pub fn with_weights(mut self, weights: ScoreWeights) -> Self {
        self.weights = weights;
        self
    }

    /// Spec §4.7 "Hard gates": any one of these failing makes the strategy
    /// non-selectable no matter how good the rest of the metrics look.
    pub fn passes_gates(&self, result: &BacktestResult) -> bool {
        result.sharpe >= self.thresholds.min_sharpe
            && result.win_rate >= self.thresholds.min_win_rate
            && result.max_drawdown.abs() <= self.thresholds.max_drawdown
            && result.total_trades >= self.thresholds.min_total_trades
            && (!self.multi_window.enabled || result.multi_window_passed)
    }

    /// Composite 0-100 score (spec §4.7 "Weighted composite"). Callers
    /// persist this into `Strategy.score_backtest` via
    /// `StrategyPatch::score_backtest` on the ACTIVE transition.
    pub fn score(&self, result: &BacktestResult) -> f64 {
        if !self.passes_gates(result) {
            return GATE_FAILED_SCORE;
        }

        let edge_norm = (result.expectancy / EDGE_NORMALIZER).clamp(0.0, 1.0);
        let sharpe_norm = (result.sharpe / SHARPE_NORMALIZER).clamp(0.0, 1.0);

        let drawdown_component = (1.0 - result.max_drawdown.abs()).clamp(0.0, 1.0);
        let cv_component = if self.multi_window.enabled {
            (1.0 - result.multi_window_cv).clamp(0.0, 1.0)
        } else {
            1.0
        };
        let stability_norm = (drawdown_component * cv_component).clamp(0.0, 1.0);

        let composite = self.weights.edge * edge_norm
            + self.weights.sharpe * sharpe_norm
            + self.weights.stability * stability_norm;

        (composite * 100.0).clamp(0.0, 100.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PeriodType;

    fn thresholds() -> Thresholds {
        Thresholds { min_sharpe: 1.0, min_win_rate: 0.4, max_drawdown: 0.5, min_total_trades: 10 }
    }

    fn multi_window(enabled: bool) -> MultiWindowConfig {
        MultiWindowConfig { enabled, windows: 4, min_avg_sharpe: 0.5, max_cv: 0.3 }
    }

    fn result(sharpe: f64, win_rate: f64, max_drawdown: f64, total_trades: usize) -> BacktestResult {
        BacktestResult {
            id: "r1".to_string(),
            strategy_id: "s1".to_string(),
            period_type: PeriodType::Full,
            sharpe,
            sortino: sharpe,
            max_drawdown,
            win_rate,
            expectancy: 10.0,
            profit_factor: 1.5,
            total_trades,
            total_return: 0.2,
            final_equity: 12_000.0,
            avg_leverage: 2.0,
            max_margin_pct: 0.2,
            per_symbol: Vec::new(),
            lookahead_check_passed: true,
            shuffle_test_passed: true,
            multi_window_passed: true,
            shuffle_p_value: 0.01,
            multi_window_avg_sharpe: sharpe,
            multi_window_std_sharpe: 0.1,
            multi_window_cv: 0.1,
            created_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn failing_any_gate_is_non_selectable() {
        let scorer = Scorer::new(thresholds(), multi_window(false));
        assert_eq!(scorer.score(&result(0.5, 0.6, 0.1, 50)), GATE_FAILED_SCORE);
        assert_eq!(scorer.score(&result(2.0, 0.2, 0.1, 50)), GATE_FAILED_SCORE);
        assert_eq!(scorer.score(&result(2.0, 0.6, 0.9, 50)), GATE_FAILED_SCORE);
        assert_eq!(scorer.score(&result(2.0, 0.6, 0.1, 3)), GATE_FAILED_SCORE);
    }

    #[test]
    fn passing_result_scores_within_bounds() {
        let scorer = Scorer::new(thresholds(), multi_window(false));
        let score = scorer.score(&result(2.0, 0.6, 0.1, 50));
        assert!(score > 0.0 && score <= 100.0);
    }

    #[test]
    fn multi_window_enabled_rejects_unvalidated_results() {
        let scorer = Scorer::new(thresholds(), multi_window(true));
        let mut r = result(2.0, 0.6, 0.1, 50);
        r.multi_window_passed = false;
        assert_eq!(scorer.score(&r), GATE_FAILED_SCORE);
    }

    #[test]
    fn higher_drawdown_lowers_score_when_gates_still_pass() {
        let scorer = Scorer::new(thresholds(), multi_window(false));
        let low_dd = scorer.score(&result(2.0, 0.6, 0.05, 50));
        let high_dd = scorer.score(&result(2.0, 0.6, 0.45, 50));
        assert!(low_dd > high_dd);
    }
}
