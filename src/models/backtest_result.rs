use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeriodType {
    Is,
    Oos,
    Full,
    /// `window_k` — one of the MultiWindowValidator's disjoint windows.
    Window(u32),
}

impl PeriodType {
    pub fn as_str(&self) -> String {
        match self {
            PeriodType::Is => "is".to_string(),
            PeriodType::Oos => "oos".to_string(),
            PeriodType::Full => "full".to_string(),
            PeriodType::Window(k) => format!("window_{k}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolBreakdown {
    pub symbol: String,
    pub sharpe: f64,
    pub sortino: f64,
    pub max_drawdown: f64,
    pub win_rate: f64,
    pub expectancy: f64,
    pub profit_factor: f64,
    pub total_trades: usize,
    pub total_return: f64,
}

/// One per (strategy, evaluation window). Immutable once written (invariant 9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestResult {
    pub id: String,
    pub strategy_id: String,
    pub period_type: PeriodType,
    pub sharpe: f64,
    pub sortino: f64,
    pub max_drawdown: f64,
    pub win_rate: f64,
    pub expectancy: f64,
    pub profit_factor: f64,
    pub total_trades: usize,
    pub total_return: f64,
    pub final_equity: f64,
    pub avg_leverage: f64,
    pub max_margin_pct: f64,
    pub per_symbol: Vec<SymbolBreakdown>,
    pub lookahead_check_passed: bool,
    pub shuffle_test_passed: bool,
    pub multi_window_passed: bool,
    pub shuffle_p_value: f64,
    pub multi_window_avg_sharpe: f64,
    pub multi_window_std_sharpe: f64,
    pub multi_window_cv: f64,
    pub created_at: chrono::DateTime<chrono::Utc>,
}
