use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::EngineError;

/// Free-form diagnostic payload attached to signals, cycles and outcomes.
pub type Diagnostics = BTreeMap<String, Value>;

/// Named numeric parameters for one strategy.
pub type StrategyParams = std::collections::HashMap<String, f64>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Bar {
    pub fn new(date: NaiveDate, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self {
            date,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    /// max(high - low, |high - prev_close|, |low - prev_close|)
    pub fn true_range(&self, prev_close: f64) -> f64 {
        (self.high - self.low)
            .max((self.high - prev_close).abs())
            .max((self.low - prev_close).abs())
    }
}

/// Per-bar signal tag.
///
/// `Success` and `Fail` never come out of a strategy; the trade simulator
/// appends them to a cycle once it is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalState {
    Empty,
    Flag,
    Pre,
    Mid,
    Post,
    Success,
    Fail,
}

impl SignalState {
    /// Ranking used for same-bar tie-breaks and monotonic cycle transitions.
    pub fn severity(self) -> u8 {
        match self {
            SignalState::Empty => 0,
            SignalState::Flag => 1,
            SignalState::Pre => 2,
            SignalState::Mid => 3,
            SignalState::Post => 4,
            SignalState::Success | SignalState::Fail => 5,
        }
    }

    pub fn is_empty(self) -> bool {
        matches!(self, SignalState::Empty)
    }

    /// A terminal tag closes a cycle to further forward transitions.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SignalState::Flag | SignalState::Post | SignalState::Success | SignalState::Fail
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SignalState::Empty => "empty",
            SignalState::Flag => "flag",
            SignalState::Pre => "pre",
            SignalState::Mid => "mid",
            SignalState::Post => "post",
            SignalState::Success => "success",
            SignalState::Fail => "fail",
        }
    }
}

impl fmt::Display for SignalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignalState {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "empty" => Ok(SignalState::Empty),
            "flag" => Ok(SignalState::Flag),
            "pre" => Ok(SignalState::Pre),
            "mid" => Ok(SignalState::Mid),
            "post" => Ok(SignalState::Post),
            "success" => Ok(SignalState::Success),
            "fail" => Ok(SignalState::Fail),
            other => Err(EngineError::InvalidConfig {
                key: "signal_state".to_string(),
                reason: format!("unknown signal state '{}'", other),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEvent {
    pub bar_index: usize,
    pub state: SignalState,
    pub strategy_id: String,
    #[serde(default)]
    pub payload: Diagnostics,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryMethod {
    /// Lowest low over a short window after an anticipatory signal.
    ForwardLow,
    /// Close of the signal bar.
    SignalClose,
    /// Low of the signal bar.
    SignalLow,
    /// Lowest low over a bounded window ending at a post-confirmation signal.
    RetraceLow,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalCycle {
    pub strategy_id: String,
    pub start_index: usize,
    /// Last bar index (inclusive) that still belongs to this cycle's window.
    pub window_end: usize,
    pub entry_index: Option<usize>,
    pub entry_price: Option<f64>,
    pub entry_method: Option<EntryMethod>,
    pub state_sequence: Vec<(usize, SignalState)>,
    pub duplicates_absorbed: usize,
}

impl SignalCycle {
    pub fn opening_state(&self) -> SignalState {
        self.state_sequence
            .first()
            .map(|(_, state)| *state)
            .unwrap_or(SignalState::Empty)
    }

    pub fn last_state(&self) -> SignalState {
        self.state_sequence
            .last()
            .map(|(_, state)| *state)
            .unwrap_or(SignalState::Empty)
    }

    pub fn is_closed(&self) -> bool {
        self.last_state().is_terminal()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    ProfitTarget,
    StopLoss,
    HorizonExhausted,
    /// The series ended before the trade resolved or the horizon elapsed.
    Incomplete,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::ProfitTarget => "profit_target",
            ExitReason::StopLoss => "stop_loss",
            ExitReason::HorizonExhausted => "horizon_exhausted",
            ExitReason::Incomplete => "incomplete",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleRef {
    pub strategy_id: String,
    pub start_index: usize,
    pub opening_state: SignalState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeOutcome {
    pub cycle_ref: CycleRef,
    pub entry_index: usize,
    pub entry_date: NaiveDate,
    pub entry_price: f64,
    pub entry_method: EntryMethod,
    pub success: bool,
    pub max_favorable_excursion_pct: f64,
    pub max_adverse_excursion_pct: f64,
    pub days_to_peak: usize,
    /// Percent return at the exit: the target or stop level when one was
    /// hit, otherwise the last examined close.
    pub exit_return_pct: f64,
    /// Bars from entry to the resolving bar, if it resolved.
    pub days_to_exit: Option<usize>,
    pub exit_reason: ExitReason,
}

impl TradeOutcome {
    pub fn is_complete(&self) -> bool {
        self.exit_reason != ExitReason::Incomplete
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoefficientCandidate {
    pub value: f64,
    /// Share of successful scenarios, in percent (0-100).
    pub success_rate: f64,
    pub avg_return_pct: f64,
    pub composite_score: f64,
    pub scenario_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub excluded: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub instrument_id: String,
    pub shares: f64,
    pub entry_price: f64,
    pub entry_date: NaiveDate,
    pub sellable: bool,
}

impl Position {
    pub fn cost_basis(&self) -> f64 {
        self.shares * self.entry_price
    }

    pub fn unrealized_pct(&self, price: f64) -> f64 {
        if self.entry_price <= 0.0 {
            return 0.0;
        }
        (price - self.entry_price) / self.entry_price * 100.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestSummary {
    /// Fraction of completed trades that succeeded (0-1).
    pub win_rate: f64,
    pub avg_return: f64,
    pub trades: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScreeningResult {
    pub instrument_id: String,
    pub strategy_id: String,
    pub signal_date: NaiveDate,
    pub signal_price: f64,
    pub signal_state: SignalState,
    pub backtest_summary: Option<BacktestSummary>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_orders_stages() {
        assert!(SignalState::Pre.severity() < SignalState::Mid.severity());
        assert!(SignalState::Mid.severity() < SignalState::Post.severity());
        assert!(SignalState::Empty.severity() < SignalState::Flag.severity());
    }

    #[test]
    fn parse_signal_state_is_case_insensitive() {
        assert_eq!("MID".parse::<SignalState>().unwrap(), SignalState::Mid);
        assert_eq!(" post ".parse::<SignalState>().unwrap(), SignalState::Post);
        assert!("maybe".parse::<SignalState>().is_err());
    }

    #[test]
    fn position_unrealized_pct() {
        let position = Position {
            instrument_id: "AAA".to_string(),
            shares: 100.0,
            entry_price: 10.0,
            entry_date: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            sellable: false,
        };
        assert!((position.unrealized_pct(11.0) - 10.0).abs() < 1e-9);
        assert!((position.cost_basis() - 1000.0).abs() < 1e-9);
    }
}
