use crate::error::EngineError;
use crate::models::{EntryMethod, StrategyParams};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

pub const DEFAULT_MAX_LOOKAHEAD_DAYS: usize = 30;
pub const DEFAULT_PROFIT_TARGET_FOR_SUCCESS: f64 = 5.0;
/// Longest forward scan for an anticipatory entry.
pub const MAX_ANTICIPATORY_WINDOW: usize = 3;

/// Periods used by the indicator calculator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndicatorConfig {
    pub sma_periods: Vec<usize>,
    pub ema_period: usize,
    pub macd_fast: usize,
    pub macd_slow: usize,
    pub macd_signal: usize,
    pub rsi_period: usize,
    pub bollinger_period: usize,
    pub bollinger_std_dev: f64,
    pub atr_period: usize,
    pub roc_period: usize,
    pub volume_period: usize,
    pub extremum_window: usize,
}

impl Default for IndicatorConfig {
    fn default() -> Self {
        Self {
            sma_periods: vec![5, 10, 20, 60],
            ema_period: 20,
            macd_fast: 12,
            macd_slow: 26,
            macd_signal: 9,
            rsi_period: 14,
            bollinger_period: 20,
            bollinger_std_dev: 2.0,
            atr_period: 14,
            roc_period: 10,
            volume_period: 20,
            extremum_window: 20,
        }
    }
}

/// Which bar price a confirmed (mid / flag) signal enters at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmedEntryPrice {
    Close,
    Low,
}

impl ConfirmedEntryPrice {
    pub fn entry_method(self) -> EntryMethod {
        match self {
            ConfirmedEntryPrice::Close => EntryMethod::SignalClose,
            ConfirmedEntryPrice::Low => EntryMethod::SignalLow,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub max_lookahead_days: usize,
    /// Percent gain that classifies a trade as successful.
    pub profit_target_pct: f64,
    /// Percent loss that fails a trade; `None` disables the stop.
    pub stop_loss_pct: Option<f64>,
    pub anticipatory_window: usize,
    pub retrace_window: usize,
    pub confirmed_entry_price: ConfirmedEntryPrice,
    /// Bars a cycle stays open for transitions. Defaults to the lookahead horizon.
    pub cycle_window_bars: Option<usize>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            max_lookahead_days: DEFAULT_MAX_LOOKAHEAD_DAYS,
            profit_target_pct: DEFAULT_PROFIT_TARGET_FOR_SUCCESS,
            stop_loss_pct: None,
            anticipatory_window: 3,
            retrace_window: 5,
            confirmed_entry_price: ConfirmedEntryPrice::Close,
            cycle_window_bars: None,
        }
    }
}

impl SimulationConfig {
    pub fn cycle_window(&self) -> usize {
        self.cycle_window_bars
            .unwrap_or(self.max_lookahead_days)
            .max(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetRule {
    /// target = support x coefficient, used as a buy limit.
    SupportEntry,
    /// target = resistance x coefficient, used as a take-profit from the close.
    ResistanceExit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub grid: Vec<f64>,
    pub warmup_bars: usize,
    pub lookahead_days: usize,
    pub extremum_window: usize,
    pub success_weight: f64,
    pub return_weight: f64,
    pub target_rule: TargetRule,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            grid: vec![0.95, 0.96, 0.97, 0.98, 0.99, 1.00, 1.01, 1.02],
            warmup_bars: 100,
            lookahead_days: DEFAULT_MAX_LOOKAHEAD_DAYS,
            extremum_window: 20,
            success_weight: 0.6,
            return_weight: 0.4,
            target_rule: TargetRule::SupportEntry,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecisionConfig {
    pub buy_technical_min: f64,
    pub buy_momentum_min: f64,
    pub buy_risk_max: f64,
    pub sell_risk_min: f64,
    pub sell_weak_score: f64,
    pub take_profit_pct: f64,
    pub stop_loss_pct: f64,
    /// Capital fraction a full-confidence, zero-risk signal would take.
    pub base_position_fraction: f64,
    pub max_position_fraction: f64,
    pub max_portfolio_fraction: f64,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            buy_technical_min: 70.0,
            buy_momentum_min: 60.0,
            buy_risk_max: 60.0,
            sell_risk_min: 80.0,
            sell_weak_score: 40.0,
            take_profit_pct: 10.0,
            stop_loss_pct: 5.0,
            base_position_fraction: 0.2,
            max_position_fraction: 0.2,
            max_portfolio_fraction: 0.8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScreeningConfig {
    /// Upper bound on worker threads; 0 means one per spare core.
    pub max_workers: usize,
    pub signal_recency_bars: usize,
    pub attach_backtest: bool,
    pub soft_timeout_ms: u64,
    pub hard_timeout_ms: u64,
    pub show_progress: bool,
}

impl Default for ScreeningConfig {
    fn default() -> Self {
        Self {
            max_workers: 0,
            signal_recency_bars: 3,
            attach_backtest: true,
            soft_timeout_ms: 5_000,
            hard_timeout_ms: 600_000,
            show_progress: false,
        }
    }
}

impl ScreeningConfig {
    pub fn soft_timeout(&self) -> Duration {
        Duration::from_millis(self.soft_timeout_ms)
    }

    pub fn hard_timeout(&self) -> Duration {
        Duration::from_millis(self.hard_timeout_ms)
    }
}

/// Main engine configuration struct that groups all parameters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub indicators: IndicatorConfig,
    pub simulation: SimulationConfig,
    pub optimizer: OptimizerConfig,
    pub decision: DecisionConfig,
    pub screening: ScreeningConfig,
    /// Parameter overrides keyed by strategy id.
    pub strategies: HashMap<String, StrategyParams>,
}

impl EngineConfig {
    pub fn strategy_overrides(&self, strategy_id: &str) -> Option<&StrategyParams> {
        self.strategies.get(strategy_id)
    }

    /// Build a config from flat settings, falling back to defaults for absent keys.
    pub fn from_settings_map(settings: &HashMap<String, String>) -> Result<Self, EngineError> {
        let mut config = EngineConfig::default();

        let simulation = &mut config.simulation;
        if let Some(days) = optional_setting_usize(settings, "MAX_LOOKAHEAD_DAYS", 1)? {
            simulation.max_lookahead_days = days;
        }
        if let Some(pct) =
            optional_setting_f64(settings, "PROFIT_TARGET_FOR_SUCCESS", Some(0.0), None)?
        {
            simulation.profit_target_pct = pct;
        }
        if let Some(pct) = optional_setting_f64(settings, "STOP_LOSS_PCT", Some(0.0), Some(100.0))? {
            simulation.stop_loss_pct = if pct > 0.0 { Some(pct) } else { None };
        }
        if let Some(bars) = optional_setting_usize(settings, "ANTICIPATORY_WINDOW", 1)? {
            if bars > MAX_ANTICIPATORY_WINDOW {
                return Err(invalid(
                    "ANTICIPATORY_WINDOW",
                    format!("must be <= {} (value: {})", MAX_ANTICIPATORY_WINDOW, bars),
                ));
            }
            simulation.anticipatory_window = bars;
        }
        if let Some(bars) = optional_setting_usize(settings, "RETRACE_WINDOW", 0)? {
            simulation.retrace_window = bars;
        }
        if let Some(bars) = optional_setting_usize(settings, "CYCLE_WINDOW_BARS", 1)? {
            simulation.cycle_window_bars = Some(bars);
        }
        if let Some(raw) = optional_setting(settings, "CONFIRMED_ENTRY_PRICE") {
            simulation.confirmed_entry_price = match raw.to_ascii_lowercase().as_str() {
                "close" => ConfirmedEntryPrice::Close,
                "low" => ConfirmedEntryPrice::Low,
                other => {
                    return Err(invalid(
                        "CONFIRMED_ENTRY_PRICE",
                        format!("must be CLOSE or LOW (value: {})", other),
                    ))
                }
            };
        }

        let optimizer = &mut config.optimizer;
        if let Some(grid) = optional_setting_f64_list(settings, "COEFFICIENT_GRID")? {
            if grid.iter().any(|value| *value <= 0.0) {
                return Err(invalid("COEFFICIENT_GRID", "values must be positive".into()));
            }
            optimizer.grid = grid;
        }
        if let Some(weights) = optional_setting_f64_list(settings, "SCORE_WEIGHTS")? {
            if weights.len() != 2 {
                return Err(invalid(
                    "SCORE_WEIGHTS",
                    format!("expected two weights, got {}", weights.len()),
                ));
            }
            optimizer.success_weight = weights[0];
            optimizer.return_weight = weights[1];
        }
        if let Some(bars) = optional_setting_usize(settings, "OPTIMIZER_WARMUP_BARS", 1)? {
            optimizer.warmup_bars = bars;
        }
        if let Some(days) = optional_setting_usize(settings, "OPTIMIZER_LOOKAHEAD_DAYS", 1)? {
            optimizer.lookahead_days = days;
        }
        if let Some(raw) = optional_setting(settings, "OPTIMIZER_TARGET_RULE") {
            optimizer.target_rule = match raw.to_ascii_lowercase().as_str() {
                "support" | "support_entry" => TargetRule::SupportEntry,
                "resistance" | "resistance_exit" => TargetRule::ResistanceExit,
                other => {
                    return Err(invalid(
                        "OPTIMIZER_TARGET_RULE",
                        format!("must be SUPPORT or RESISTANCE (value: {})", other),
                    ))
                }
            };
        }

        let decision = &mut config.decision;
        if let Some(pct) = optional_setting_f64(settings, "TAKE_PROFIT_PCT", Some(0.0), None)? {
            decision.take_profit_pct = pct;
        }
        if let Some(pct) =
            optional_setting_f64(settings, "POSITION_STOP_LOSS_PCT", Some(0.0), Some(100.0))?
        {
            decision.stop_loss_pct = pct;
        }
        if let Some(ratio) =
            optional_setting_f64(settings, "MAX_POSITION_FRACTION", Some(0.0), Some(1.0))?
        {
            decision.max_position_fraction = ratio;
        }
        if let Some(ratio) =
            optional_setting_f64(settings, "MAX_PORTFOLIO_FRACTION", Some(0.0), Some(1.0))?
        {
            decision.max_portfolio_fraction = ratio;
        }
        if decision.max_position_fraction > decision.max_portfolio_fraction {
            return Err(invalid(
                "MAX_POSITION_FRACTION",
                format!(
                    "must be <= MAX_PORTFOLIO_FRACTION ({} > {})",
                    decision.max_position_fraction, decision.max_portfolio_fraction
                ),
            ));
        }

        let screening = &mut config.screening;
        if let Some(workers) = optional_setting_usize(settings, "SCREENING_WORKERS", 0)? {
            screening.max_workers = workers;
        }
        if let Some(bars) = optional_setting_usize(settings, "SIGNAL_RECENCY_BARS", 1)? {
            screening.signal_recency_bars = bars;
        }
        if let Some(ms) = optional_setting_usize(settings, "SOFT_TIMEOUT_MS", 1)? {
            screening.soft_timeout_ms = ms as u64;
        }
        if let Some(ms) = optional_setting_usize(settings, "HARD_TIMEOUT_MS", 1)? {
            screening.hard_timeout_ms = ms as u64;
        }

        Ok(config)
    }
}

fn invalid(key: &str, reason: String) -> EngineError {
    EngineError::InvalidConfig {
        key: key.to_string(),
        reason,
    }
}

fn optional_setting<'a>(settings: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    settings
        .get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
}

fn optional_setting_f64(
    settings: &HashMap<String, String>,
    key: &str,
    min: Option<f64>,
    max: Option<f64>,
) -> Result<Option<f64>, EngineError> {
    let Some(raw) = optional_setting(settings, key) else {
        return Ok(None);
    };
    let value = raw
        .parse::<f64>()
        .map_err(|_| invalid(key, format!("must be a number (value: {})", raw)))?;
    if !value.is_finite() {
        return Err(invalid(key, format!("must be finite (value: {})", raw)));
    }
    if let Some(min_value) = min {
        if value < min_value {
            return Err(invalid(
                key,
                format!("must be >= {} (value: {})", min_value, raw),
            ));
        }
    }
    if let Some(max_value) = max {
        if value > max_value {
            return Err(invalid(
                key,
                format!("must be <= {} (value: {})", max_value, raw),
            ));
        }
    }
    Ok(Some(value))
}

fn optional_setting_usize(
    settings: &HashMap<String, String>,
    key: &str,
    min: usize,
) -> Result<Option<usize>, EngineError> {
    let Some(value) = optional_setting_f64(settings, key, None, None)? else {
        return Ok(None);
    };
    if value.fract() != 0.0 {
        return Err(invalid(key, format!("must be an integer (value: {})", value)));
    }
    if value < min as f64 {
        return Err(invalid(key, format!("must be >= {} (value: {})", min, value)));
    }
    Ok(Some(value as usize))
}

fn optional_setting_f64_list(
    settings: &HashMap<String, String>,
    key: &str,
) -> Result<Option<Vec<f64>>, EngineError> {
    let Some(raw) = optional_setting(settings, key) else {
        return Ok(None);
    };
    let trimmed = raw.trim_matches(|c| c == '[' || c == ']');
    let mut values = Vec::new();

    for part in trimmed.split(|c: char| c == ',' || c.is_whitespace()) {
        let entry = part.trim();
        if entry.is_empty() {
            continue;
        }
        let value = entry
            .parse::<f64>()
            .map_err(|_| invalid(key, format!("must be a list of numbers (value: {})", raw)))?;
        if !value.is_finite() {
            return Err(invalid(
                key,
                format!("must contain only finite numbers (value: {})", raw),
            ));
        }
        values.push(value);
    }

    if values.is_empty() {
        return Err(invalid(
            key,
            format!("must contain at least one number (value: {})", raw),
        ));
    }

    Ok(Some(values))
}
