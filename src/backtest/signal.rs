//! The strategy-code IR (spec §3 `Strategy.code`, §4.4 "Signal protocol").
//!
//! `Strategy.code` is "a closed expression over OHLCV producing Signals" —
//! no `original_source/src/strategies/base.py` exists in this pack to copy
//! the Python `StrategyCore`/`Signal` contract from, so this IR is grounded
//! directly on the protocol described in spec §4.4/§4.5 and on the
//! entry/exit shape `leveraged_engine.py`'s `_generate_trades_with_leverage`
//! consumes (`signal.direction`, `signal.leverage`). `Expr` is evaluated
//! against a candle *prefix* only — the evaluator has no way to reach past
//! the last element of the slice it is given, which is what lets the
//! Validator's static check (spec §4.5) and this IR agree on what
//! "look-ahead" means: a `Shift` by a negative constant, or a centred
//! rolling/expanding window.

use serde::{Deserialize, Serialize};

use crate::exchange::Candle;
use crate::models::Direction;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Open,
    High,
    Low,
    Close,
    Volume,
}

impl Field {
    fn value(self, c: &Candle) -> f64 {
        match self {
            Field::Open => c.open,
            Field::High => c.high,
            Field::Low => c.low,
            Field::Close => c.close,
            Field::Volume => c.volume,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollOp {
    Mean,
    Std,
    Min,
    Max,
    Sum,
}

fn apply_roll_op(op: RollOp, values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(match op {
        RollOp::Sum => values.iter().sum(),
        RollOp::Mean => values.iter().sum::<f64>() / values.len() as f64,
        RollOp::Min => values.iter().cloned().fold(f64::INFINITY, f64::min),
        RollOp::Max => values.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
        RollOp::Std => {
            let mean = values.iter().sum::<f64>() / values.len() as f64;
            let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
            var.sqrt()
        }
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CmpOp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
}

/// A closed expression over an OHLCV prefix. Every variant that could in
/// principle reach beyond the prefix's last element (`Shift` with a
/// negative constant, a centred `Rolling`/`Expanding`) is representable —
/// the Validator's job (spec §4.5) is to reject those before the engine
/// ever evaluates them. At evaluation time a negative shift simply yields
/// `None` (treated as "no signal this bar") rather than panicking, since
/// malformed code that slipped past validation must not crash the engine
/// (spec §7 `StrategyError`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Expr {
    Const(f64),
    Field(Field),
    /// Shift the evaluation window back `by` bars (`by < 0` is a
    /// look-ahead and is the AST-forbidden pattern in spec §4.5).
    Shift(Box<Expr>, i64),
    Rolling {
        inner: Box<Expr>,
        window: usize,
        op: RollOp,
        center: bool,
    },
    Expanding {
        inner: Box<Expr>,
        op: RollOp,
        center: bool,
    },
    BinOp(BinOp, Box<Expr>, Box<Expr>),
    Cmp(CmpOp, Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
}

impl Expr {
    /// Evaluate against `prefix`, where `prefix.last()` is "now". Returns
    /// `None` when there isn't enough history yet (e.g. a 20-bar rolling
    /// window on the 5th bar) or the expression reaches past the prefix.
    pub fn eval(&self, prefix: &[Candle]) -> Option<f64> {
        match self {
            Expr::Const(v) => Some(*v),
            Expr::Field(f) => prefix.last().map(|c| f.value(c)),
            Expr::Shift(inner, by) => {
                if *by < 0 {
                    return None;
                }
                let by = *by as usize;
                if by >= prefix.len() {
                    return None;
                }
                inner.eval(&prefix[..prefix.len() - by])
            }
            Expr::Rolling { inner, window, op, center } => {
                if *center || *window == 0 || prefix.len() < *window {
                    return None;
                }
                let slice = &prefix[prefix.len() - window..];
                let samples: Vec<f64> = (0..slice.len())
                    .filter_map(|i| inner.eval(&slice[..=i]))
                    .collect();
                apply_roll_op(*op, &samples)
            }
            Expr::Expanding { inner, op, center } => {
                if *center || prefix.is_empty() {
                    return None;
                }
                let samples: Vec<f64> = (0..prefix.len())
                    .filter_map(|i| inner.eval(&prefix[..=i]))
                    .collect();
                apply_roll_op(*op, &samples)
            }
            Expr::BinOp(op, lhs, rhs) => {
                let (l, r) = (lhs.eval(prefix)?, rhs.eval(prefix)?);
                Some(match op {
                    BinOp::Add => l + r,
                    BinOp::Sub => l - r,
                    BinOp::Mul => l * r,
                    BinOp::Div => {
                        if r == 0.0 {
                            return None;
                        }
                        l / r
                    }
                })
            }
            Expr::Cmp(op, lhs, rhs) => {
                let (l, r) = (lhs.eval(prefix)?, rhs.eval(prefix)?);
                let truth = match op {
                    CmpOp::Lt => l < r,
                    CmpOp::Le => l <= r,
                    CmpOp::Gt => l > r,
                    CmpOp::Ge => l >= r,
                    CmpOp::Eq => (l - r).abs() < f64::EPSILON,
                };
                Some(if truth { 1.0 } else { 0.0 })
            }
            Expr::And(lhs, rhs) => {
                let (l, r) = (lhs.eval(prefix)?, rhs.eval(prefix)?);
                Some(if l != 0.0 && r != 0.0 { 1.0 } else { 0.0 })
            }
            Expr::Or(lhs, rhs) => {
                let (l, r) = (lhs.eval(prefix)?, rhs.eval(prefix)?);
                Some(if l != 0.0 || r != 0.0 { 1.0 } else { 0.0 })
            }
            Expr::Not(inner) => inner.eval(prefix).map(|v| if v == 0.0 { 1.0 } else { 0.0 }),
        }
    }

    /// Walk the whole tree, invoking `visit` on every node — the Validator's
    /// static check (spec §4.5) is built entirely on top of this.
    pub fn walk(&self, visit: &mut dyn FnMut(&Expr)) {
        visit(self);
        match self {
            Expr::Const(_) | Expr::Field(_) => {}
            Expr::Shift(inner, _) | Expr::Not(inner) => inner.walk(visit),
            Expr::Rolling { inner, .. } | Expr::Expanding { inner, .. } => inner.walk(visit),
            Expr::BinOp(_, l, r)
            | Expr::Cmp(_, l, r)
            | Expr::And(l, r)
            | Expr::Or(l, r) => {
                l.walk(visit);
                r.walk(visit);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopType {
    Fixed,
    Atr,
    Trailing,
}

/// One emission of a strategy's rule, per bar (spec §4.4 "Signal protocol").
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Signal {
    Entry {
        direction: Direction,
        leverage: Option<u32>,
        atr_stop_multiplier: Option<f64>,
        atr_take_multiplier: Option<f64>,
        sl_type: StopType,
        tp_type: StopType,
    },
    Close,
}

/// The deserialized form of `Strategy.code`: independent entry/exit
/// conditions plus the advisory sizing parameters the engine consults
/// (spec §4.4). `entry_long`/`entry_short` are mutually exclusive in
/// practice but not enforced here — the engine only acts on the first one
/// that fires (exit takes priority, matching a flat position having
/// nothing left to close).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyRule {
    pub entry_long: Option<Expr>,
    pub entry_short: Option<Expr>,
    pub exit: Option<Expr>,
    pub leverage: Option<u32>,
    #[serde(default)]
    pub atr_stop_multiplier: Option<f64>,
    #[serde(default)]
    pub atr_take_multiplier: Option<f64>,
    #[serde(default = "default_stop_type")]
    pub sl_type: StopType,
    #[serde(default = "default_stop_type")]
    pub tp_type: StopType,
}

fn default_stop_type() -> StopType {
    StopType::Fixed
}

impl StrategyRule {
    pub fn from_code(code: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(code)
    }

    pub fn to_code(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Evaluate the rule against a candle prefix (`prefix.last()` is "now").
    /// At most one Signal is returned — exit wins over entry, matching the
    /// caller treating a flat position's "close" as a no-op.
    pub fn generate_signal(&self, prefix: &[Candle]) -> Option<Signal> {
        if let Some(exit) = &self.exit {
            if exit.eval(prefix).map(|v| v != 0.0).unwrap_or(false) {
                return Some(Signal::Close);
            }
        }
        if let Some(entry_long) = &self.entry_long {
            if entry_long.eval(prefix).map(|v| v != 0.0).unwrap_or(false) {
                return Some(Signal::Entry {
                    direction: Direction::Long,
                    leverage: self.leverage,
                    atr_stop_multiplier: self.atr_stop_multiplier,
                    atr_take_multiplier: self.atr_take_multiplier,
                    sl_type: self.sl_type,
                    tp_type: self.tp_type,
                });
            }
        }
        if let Some(entry_short) = &self.entry_short {
            if entry_short.eval(prefix).map(|v| v != 0.0).unwrap_or(false) {
                return Some(Signal::Entry {
                    direction: Direction::Short,
                    leverage: self.leverage,
                    atr_stop_multiplier: self.atr_stop_multiplier,
                    atr_take_multiplier: self.atr_take_multiplier,
                    sl_type: self.sl_type,
                    tp_type: self.tp_type,
                });
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(close: f64) -> Candle {
        Candle {
            timestamp_ms: 0,
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
        }
    }

    #[test]
    fn shift_by_negative_constant_yields_no_value() {
        let expr = Expr::Shift(Box::new(Expr::Field(Field::Close)), -1);
        let prefix = vec![candle(1.0), candle(2.0)];
        assert_eq!(expr.eval(&prefix), None);
    }

    #[test]
    fn rolling_mean_needs_full_window() {
        let expr = Expr::Rolling {
            inner: Box::new(Expr::Field(Field::Close)),
            window: 3,
            op: RollOp::Mean,
            center: false,
        };
        let prefix = vec![candle(1.0), candle(2.0)];
        assert_eq!(expr.eval(&prefix), None);

        let prefix = vec![candle(1.0), candle(2.0), candle(3.0)];
        assert_eq!(expr.eval(&prefix), Some(2.0));
    }

    #[test]
    fn centered_rolling_never_evaluates() {
        let expr = Expr::Rolling {
            inner: Box::new(Expr::Field(Field::Close)),
            window: 2,
            op: RollOp::Mean,
            center: true,
        };
        let prefix = vec![candle(1.0), candle(2.0)];
        assert_eq!(expr.eval(&prefix), None);
    }

    #[test]
    fn rule_round_trips_through_json() {
        let rule = StrategyRule {
            entry_long: Some(Expr::Cmp(
                CmpOp::Gt,
                Box::new(Expr::Field(Field::Close)),
                Box::new(Expr::Const(100.0)),
            )),
            entry_short: None,
            exit: Some(Expr::Cmp(
                CmpOp::Lt,
                Box::new(Expr::Field(Field::Close)),
                Box::new(Expr::Const(90.0)),
            )),
            leverage: Some(3),
            atr_stop_multiplier: None,
            atr_take_multiplier: None,
            sl_type: StopType::Fixed,
            tp_type: StopType::Fixed,
        };
        let code = rule.to_code().unwrap();
        let parsed = StrategyRule::from_code(&code).unwrap();
        assert_eq!(parsed.leverage, Some(3));
    }

    #[test]
    fn generate_signal_prefers_exit_over_entry() {
        let rule = StrategyRule {
            entry_long: Some(Expr::Const(1.0)),
            entry_short: None,
            exit: Some(Expr::Const(1.0)),
            leverage: None,
            atr_stop_multiplier: None,
            atr_take_multiplier: None,
            sl_type: StopType::Fixed,
            tp_type: StopType::Fixed,
        };
        let prefix = vec![candle(100.0)];
        assert_eq!(rule.generate_signal(&prefix), Some(Signal::Close));
    }
}
