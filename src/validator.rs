//! Lookahead-bias validation (spec §4.5), grounded on
//! `original_source/src/backtester/validator.py`'s `LookaheadValidator` and
//! `multi_window_validator.py`'s `MultiWindowValidator`.
//!
//! The Python `LookaheadValidator` parses arbitrary Python source with
//! `ast.parse` and walks the tree looking for forbidden call patterns. This
//! codebase's strategy code is already the closed `Expr` tree from
//! `backtest::signal` rather than source text, so the static check here
//! walks that tree directly via `Expr::walk` — same intent (centered
//! windows / negative shifts are forbidden), no parser needed.

use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::backtest::{Expr, Signal, StrategyRule};
use crate::error::ValidationFail;
use crate::exchange::Candle;
use crate::models::Direction;

#[derive(Debug, Clone)]
pub struct StaticCheckResult {
    pub passed: bool,
    pub violations: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ShuffleTestResult {
    pub passed: bool,
    pub p_value: f64,
    pub real_edge: f64,
    pub signal_count: usize,
}

#[derive(Debug, Clone)]
pub struct LookaheadValidation {
    pub static_check: StaticCheckResult,
    pub shuffle_test: ShuffleTestResult,
    pub passed: bool,
}

/// Static AST-equivalent check plus the empirical shuffle test
/// (`LookaheadValidator.validate`). Holds no state; callers own the RNG seed
/// so strategy validation stays reproducible across retries.
pub struct LookaheadValidator {
    shuffle_iterations: usize,
}

impl LookaheadValidator {
    pub fn new(shuffle_iterations: usize) -> Self {
        Self { shuffle_iterations }
    }

    pub fn validate(&self, rule: &StrategyRule, candles: &[Candle], rng_seed: u64) -> LookaheadValidation {
        let static_check = Self::static_check(rule);
        if !static_check.passed {
            return LookaheadValidation {
                shuffle_test: ShuffleTestResult { passed: false, p_value: 1.0, real_edge: 0.0, signal_count: 0 },
                passed: false,
                static_check,
            };
        }

        let shuffle_test = self.shuffle_test(rule, candles, rng_seed);
        let passed = shuffle_test.passed;
        LookaheadValidation { static_check, shuffle_test, passed }
    }

    /// `_ast_check`: forbidden patterns are centered rolling/expanding
    /// windows and shifts by a non-positive constant. Walks every `Expr` the
    /// rule references (both entries and the exit).
    pub fn static_check(rule: &StrategyRule) -> StaticCheckResult {
        let mut violations = Vec::new();
        let mut visit = |expr: &Expr| match expr {
            Expr::Rolling { center: true, .. } => {
                violations.push("rolling(center=true) detected - uses future data".to_string());
            }
            Expr::Expanding { center: true, .. } => {
                violations.push("expanding(center=true) detected - uses future data".to_string());
            }
            Expr::Shift(_, by) if *by <= 0 => {
                violations.push(format!("shift({by}) detected - uses future data"));
            }
            _ => {}
        };

        for expr in [&rule.entry_long, &rule.entry_short, &rule.exit].into_iter().flatten() {
            expr.walk(&mut visit);
        }

        let passed = violations.is_empty();
        StaticCheckResult { passed, violations }
    }

    /// `_shuffle_test`: generate real signals bar-by-bar, compute the
    /// 10-bar-forward-return edge, then rebuild the null distribution by
    /// permuting signal *directions* while holding their bar indices fixed
    /// (the Python source re-derives the bar index by matching `close`
    /// price, which is fragile against repeated prices — this keeps the
    /// index pairing explicit instead).
    fn shuffle_test(&self, rule: &StrategyRule, candles: &[Candle], rng_seed: u64) -> ShuffleTestResult {
        let mut signal_indices = Vec::new();
        let mut signal_directions: Vec<i8> = Vec::new();

        for i in 0..candles.len() {
            let prefix = &candles[..=i];
            match rule.generate_signal(prefix) {
                Some(Signal::Entry { direction: Direction::Long, .. }) => {
                    signal_indices.push(i);
                    signal_directions.push(1);
                }
                Some(Signal::Entry { direction: Direction::Short, .. }) => {
                    signal_indices.push(i);
                    signal_directions.push(-1);
                }
                _ => {}
            }
        }

        if signal_indices.len() < 10 {
            return ShuffleTestResult {
                passed: false,
                p_value: 1.0,
                real_edge: 0.0,
                signal_count: signal_indices.len(),
            };
        }

        let real_edge = Self::simple_edge(&signal_indices, &signal_directions, candles);

        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(rng_seed);
        let mut shuffled_edges = Vec::with_capacity(self.shuffle_iterations);
        for _ in 0..self.shuffle_iterations {
            let mut shuffled = signal_directions.clone();
            shuffled.shuffle(&mut rng);
            shuffled_edges.push(Self::simple_edge(&signal_indices, &shuffled, candles));
        }

        let mean_shuffled = mean(&shuffled_edges);
        let std_shuffled = std_dev(&shuffled_edges);

        if std_shuffled == 0.0 {
            return ShuffleTestResult {
                passed: false,
                p_value: 1.0,
                real_edge,
                signal_count: signal_indices.len(),
            };
        }

        let z_score = (real_edge - mean_shuffled) / std_shuffled;
        let p_value = 1.0 - standard_normal_cdf(z_score);
        let passed = p_value < 0.05;

        ShuffleTestResult { passed, p_value, real_edge, signal_count: signal_indices.len() }
    }

    /// `_calculate_simple_edge`: average 10-bar-forward return, sign-flipped
    /// for shorts, clamped to the end of the series.
    fn simple_edge(indices: &[usize], directions: &[i8], candles: &[Candle]) -> f64 {
        if indices.is_empty() {
            return 0.0;
        }
        let returns: Vec<f64> = indices
            .iter()
            .zip(directions.iter())
            .map(|(&entry_idx, &direction)| {
                let entry_price = candles[entry_idx].close;
                let exit_idx = (entry_idx + 10).min(candles.len() - 1);
                let exit_price = candles[exit_idx].close;
                if direction > 0 {
                    (exit_price - entry_price) / entry_price
                } else {
                    (entry_price - exit_price) / entry_price
                }
            })
            .collect();
        mean(&returns)
    }

    /// Convert a validation result into the typed failure the pipeline's
    /// error taxonomy expects (spec §7).
    pub fn into_result(validation: LookaheadValidation) -> Result<LookaheadValidation, ValidationFail> {
        if !validation.static_check.passed {
            return Err(ValidationFail::Static(validation.static_check.violations.join("; ")));
        }
        if !validation.shuffle_test.passed {
            return Err(ValidationFail::Shuffle {
                p_value: validation.shuffle_test.p_value,
                signal_count: validation.shuffle_test.signal_count,
            });
        }
        Ok(validation)
    }
}

/// Window-by-window Sharpe consistency check (spec §4.6), grounded on
/// `multi_window_validator.py`'s `MultiWindowValidator`. Operates on disjoint
/// equal-length windows the caller has already sliced from a candle series,
/// since window *dating* (days-ago offsets against wall-clock "now") belongs
/// to the data-loading layer, not this pass/fail check.
#[derive(Debug, Clone)]
pub struct MultiWindowResult {
    pub passed: bool,
    pub reason: String,
    pub avg_sharpe: f64,
    pub std_sharpe: f64,
    pub cv: f64,
    pub windows_with_trades: usize,
}

pub struct MultiWindowValidator {
    min_avg_sharpe: f64,
    max_cv: f64,
}

impl MultiWindowValidator {
    pub fn new(min_avg_sharpe: f64, max_cv: f64) -> Self {
        Self { min_avg_sharpe, max_cv }
    }

    /// `window_sharpes_with_trades` is `(sharpe, total_trades)` per window,
    /// already run through `BacktestEngine`. Windows with zero trades are
    /// excluded before the statistics, matching the Python source's
    /// `result.get('total_trades', 0) > 0` filter.
    pub fn validate(&self, window_sharpes_with_trades: &[(f64, usize)]) -> MultiWindowResult {
        let with_trades: Vec<f64> =
            window_sharpes_with_trades.iter().filter(|(_, trades)| *trades > 0).map(|(s, _)| *s).collect();

        if with_trades.len() < 2 {
            return MultiWindowResult {
                passed: true,
                reason: format!("only_{}_windows_with_trades", with_trades.len()),
                avg_sharpe: 0.0,
                std_sharpe: 0.0,
                cv: 0.0,
                windows_with_trades: with_trades.len(),
            };
        }

        let avg_sharpe = mean(&with_trades);
        let std_sharpe = sample_std_dev(&with_trades);
        let cv = if avg_sharpe > 0.0 {
            std_sharpe / avg_sharpe
        } else if std_sharpe > 0.0 {
            f64::INFINITY
        } else {
            0.0
        };

        let mut reason_parts = Vec::new();
        let mut passed = true;
        if avg_sharpe < self.min_avg_sharpe {
            passed = false;
            reason_parts.push(format!("avg_sharpe={avg_sharpe:.2}<{}", self.min_avg_sharpe));
        }
        if cv > self.max_cv {
            passed = false;
            reason_parts.push(format!("cv={cv:.2}>{}", self.max_cv));
        }

        let reason = if passed {
            format!("passed:avg={avg_sharpe:.2},cv={cv:.2}")
        } else {
            reason_parts.join(";")
        };

        MultiWindowResult { passed, reason, avg_sharpe, std_sharpe, cv, windows_with_trades: with_trades.len() }
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn std_dev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let m = mean(values);
    (values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64).sqrt()
}

/// Sample standard deviation (`ddof=1` in the Python source).
fn sample_std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    (values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64).sqrt()
}

/// `scipy.stats.norm.cdf` via the Abramowitz-Stegun erf approximation
/// (statrs carries a normal distribution but this keeps the dependency
/// surface to the already-imported `statrs::function::erf`).
fn standard_normal_cdf(z: f64) -> f64 {
    0.5 * (1.0 + statrs::function::erf::erf(z / std::f64::consts::SQRT_2))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backtest::{CmpOp, Field, RollOp, StopType};

    fn candle(ts_ms: i64, close: f64) -> Candle {
        Candle { timestamp_ms: ts_ms, open: close, high: close, low: close, close, volume: 1.0 }
    }

    #[test]
    fn centered_rolling_is_a_static_violation() {
        let rule = StrategyRule {
            entry_long: Some(Expr::Cmp(
                CmpOp::Gt,
                Box::new(Expr::Rolling {
                    inner: Box::new(Expr::Field(Field::Close)),
                    window: 5,
                    op: RollOp::Mean,
                    center: true,
                }),
                Box::new(Expr::Const(0.0)),
            )),
            entry_short: None,
            exit: None,
            leverage: None,
            atr_stop_multiplier: None,
            atr_take_multiplier: None,
            sl_type: StopType::Fixed,
            tp_type: StopType::Fixed,
        };

        let result = LookaheadValidator::static_check(&rule);
        assert!(!result.passed);
        assert_eq!(result.violations.len(), 1);
    }

    #[test]
    fn negative_shift_is_a_static_violation() {
        let rule = StrategyRule {
            entry_long: Some(Expr::Cmp(
                CmpOp::Gt,
                Box::new(Expr::Shift(Box::new(Expr::Field(Field::Close)), -1)),
                Box::new(Expr::Const(0.0)),
            )),
            entry_short: None,
            exit: None,
            leverage: None,
            atr_stop_multiplier: None,
            atr_take_multiplier: None,
            sl_type: StopType::Fixed,
            tp_type: StopType::Fixed,
        };

        let result = LookaheadValidator::static_check(&rule);
        assert!(!result.passed);
    }

    #[test]
    fn clean_rule_passes_static_check() {
        let rule = StrategyRule {
            entry_long: Some(Expr::Cmp(
                CmpOp::Gt,
                Box::new(Expr::Field(Field::Close)),
                Box::new(Expr::Const(100.0)),
            )),
            entry_short: None,
            exit: None,
            leverage: None,
            atr_stop_multiplier: None,
            atr_take_multiplier: None,
            sl_type: StopType::Fixed,
            tp_type: StopType::Fixed,
        };
        assert!(LookaheadValidator::static_check(&rule).passed);
    }

    #[test]
    fn fewer_than_ten_signals_auto_fails_shuffle_test() {
        let rule = StrategyRule {
            entry_long: Some(Expr::Cmp(
                CmpOp::Gt,
                Box::new(Expr::Field(Field::Close)),
                Box::new(Expr::Const(1_000_000.0)),
            )),
            entry_short: None,
            exit: None,
            leverage: None,
            atr_stop_multiplier: None,
            atr_take_multiplier: None,
            sl_type: StopType::Fixed,
            tp_type: StopType::Fixed,
        };
        let candles: Vec<Candle> = (0..30).map(|i| candle(i, 100.0 + i as f64)).collect();
        let validator = LookaheadValidator::new(50);
        let result = validator.shuffle_test(&rule, &candles, 42);
        assert!(!result.passed);
        assert_eq!(result.signal_count, 0);
    }

    #[test]
    fn multi_window_passes_by_insufficiency_with_one_window() {
        let validator = MultiWindowValidator::new(1.0, 0.3);
        let result = validator.validate(&[(2.0, 5)]);
        assert!(result.passed);
        assert_eq!(result.reason, "only_1_windows_with_trades");
    }

    #[test]
    fn multi_window_fails_on_high_coefficient_of_variation() {
        let validator = MultiWindowValidator::new(0.0, 0.1);
        let result = validator.validate(&[(1.0, 5), (5.0, 5), (0.2, 5)]);
        assert!(!result.passed);
        assert!(result.reason.contains("cv="));
    }
}
