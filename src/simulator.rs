use crate::config::{SimulationConfig, MAX_ANTICIPATORY_WINDOW};
use crate::cycles::group_cycles;
use crate::error::EngineError;
use crate::models::*;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use std::collections::BTreeMap;

/// Label used when a raw signal series arrives without a strategy id.
pub const UNNAMED_STRATEGY: &str = "signals";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Entry {
    pub index: usize,
    pub price: f64,
    pub method: EntryMethod,
}

fn lowest_low(bars: &[Bar], from: usize, to: usize) -> Option<(usize, f64)> {
    (from..=to)
        .filter_map(|idx| bars.get(idx).map(|bar| (idx, bar.low)))
        .fold(None, |best, (idx, low)| match best {
            Some((_, best_low)) if best_low <= low => best,
            _ => Some((idx, low)),
        })
}

fn cycle_error(cycle: &SignalCycle, reason: String) -> EngineError {
    EngineError::Series(format!(
        "{} cycle at bar {}: {}",
        cycle.strategy_id, cycle.start_index, reason
    ))
}

/// Pick the entry bar and price for a cycle from its opening state.
pub fn resolve_entry(
    bars: &[Bar],
    cycle: &SignalCycle,
    config: &SimulationConfig,
) -> Result<Entry, EngineError> {
    let start = cycle.start_index;
    let signal_bar = bars
        .get(start)
        .ok_or_else(|| cycle_error(cycle, format!("start beyond {} bars", bars.len())))?;

    let entry = match cycle.opening_state() {
        SignalState::Pre => {
            if start + 1 >= bars.len() {
                return Err(EngineError::InsufficientData {
                    required: start + 2,
                    available: bars.len(),
                });
            }
            let last = (start + config.anticipatory_window.clamp(1, MAX_ANTICIPATORY_WINDOW)).min(bars.len() - 1);
            let (index, price) = lowest_low(bars, start + 1, last)
                .ok_or_else(|| cycle_error(cycle, "empty forward window".to_string()))?;
            Entry {
                index,
                price,
                method: EntryMethod::ForwardLow,
            }
        }
        SignalState::Mid | SignalState::Flag => {
            let method = config.confirmed_entry_price.entry_method();
            let price = match method {
                EntryMethod::SignalLow => signal_bar.low,
                _ => signal_bar.close,
            };
            Entry {
                index: start,
                price,
                method,
            }
        }
        SignalState::Post => {
            let from = start.saturating_sub(config.retrace_window);
            let (_, price) = lowest_low(bars, from, start)
                .ok_or_else(|| cycle_error(cycle, "empty retrace window".to_string()))?;
            // The retracement is in the past; the position still opens on the signal bar.
            Entry {
                index: start,
                price,
                method: EntryMethod::RetraceLow,
            }
        }
        other => {
            return Err(cycle_error(
                cycle,
                format!("cannot open a trade from state {}", other),
            ))
        }
    };

    if !(entry.price.is_finite() && entry.price > 0.0) {
        return Err(cycle_error(
            cycle,
            format!("non-positive entry price {}", entry.price),
        ));
    }
    Ok(entry)
}

/// Simulate one cycle forward from its entry and record the outcome on it.
///
/// Stop-loss is checked before the profit target on every bar, so a bar
/// that touches both fails the trade. Excursions are measured up to and
/// including the resolving bar.
pub fn simulate_cycle(
    bars: &[Bar],
    cycle: &mut SignalCycle,
    config: &SimulationConfig,
) -> Result<TradeOutcome, EngineError> {
    let entry = resolve_entry(bars, cycle, config)?;
    cycle.entry_index = Some(entry.index);
    cycle.entry_price = Some(entry.price);
    cycle.entry_method = Some(entry.method);

    let horizon = config.max_lookahead_days.max(1);
    let stop = config.stop_loss_pct.filter(|pct| *pct > 0.0);
    let pct = |price: f64| (price - entry.price) / entry.price * 100.0;

    let mut max_favorable = 0.0f64;
    let mut max_adverse = 0.0f64;
    let mut days_to_peak = 0usize;
    let mut last_close_return = 0.0f64;
    let mut examined = 0usize;
    let mut resolution: Option<(usize, ExitReason, f64)> = None;

    for day in 1..=horizon {
        let Some(bar) = bars.get(entry.index + day) else {
            break;
        };
        examined = day;
        let up = pct(bar.high);
        let down = pct(bar.low);
        if up > max_favorable {
            max_favorable = up;
            days_to_peak = day;
        }
        max_adverse = max_adverse.min(down);
        last_close_return = pct(bar.close);

        if let Some(stop) = stop {
            if down <= -stop {
                resolution = Some((day, ExitReason::StopLoss, -stop));
                break;
            }
        }
        if up >= config.profit_target_pct {
            resolution = Some((day, ExitReason::ProfitTarget, config.profit_target_pct));
            break;
        }
    }

    let (success, exit_reason, days_to_exit, exit_return_pct) = match resolution {
        Some((day, ExitReason::ProfitTarget, ret)) => (true, ExitReason::ProfitTarget, Some(day), ret),
        Some((day, reason, ret)) => (false, reason, Some(day), ret),
        None if examined < horizon => (false, ExitReason::Incomplete, None, last_close_return),
        None => (false, ExitReason::HorizonExhausted, Some(horizon), last_close_return),
    };

    cycle
        .state_sequence
        .retain(|(_, state)| !matches!(state, SignalState::Success | SignalState::Fail));
    if let Some(day) = days_to_exit {
        let tag = if success {
            SignalState::Success
        } else {
            SignalState::Fail
        };
        cycle.state_sequence.push((entry.index + day, tag));
    }

    debug!(
        "{} cycle at {}: {} after {} bars (mfe {:.2}%, mae {:.2}%)",
        cycle.strategy_id,
        cycle.start_index,
        exit_reason.as_str(),
        examined,
        max_favorable,
        max_adverse
    );

    Ok(TradeOutcome {
        cycle_ref: CycleRef {
            strategy_id: cycle.strategy_id.clone(),
            start_index: cycle.start_index,
            opening_state: cycle.opening_state(),
        },
        entry_index: entry.index,
        entry_date: bars[entry.index].date,
        entry_price: entry.price,
        entry_method: entry.method,
        success,
        max_favorable_excursion_pct: max_favorable,
        max_adverse_excursion_pct: max_adverse,
        days_to_peak,
        exit_return_pct,
        days_to_exit,
        exit_reason,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExcludedCycle {
    pub strategy_id: String,
    pub start_index: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateStats {
    pub count: usize,
    pub wins: usize,
    pub win_rate: f64,
    pub avg_max_profit: f64,
    pub avg_max_drawdown: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BacktestReport {
    /// Every simulated trade, incomplete ones included.
    pub trades: Vec<TradeOutcome>,
    pub cycles: Vec<SignalCycle>,
    /// Trades that resolved or exhausted their horizon.
    pub completed: usize,
    pub wins: usize,
    /// Fraction of completed trades that succeeded (0-1).
    pub win_rate: f64,
    pub avg_return: f64,
    pub avg_max_profit: f64,
    pub avg_max_drawdown: f64,
    pub avg_days_to_peak: f64,
    pub max_profit_std_dev: f64,
    /// Keyed by the opening state of each cycle.
    pub per_state: BTreeMap<String, StateStats>,
    pub incomplete_count: usize,
    pub excluded: Vec<ExcludedCycle>,
}

fn mean_or_zero(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().mean()
    }
}

fn std_dev_or_zero(values: &[f64]) -> f64 {
    if values.len() < 2 {
        0.0
    } else {
        values.iter().std_dev()
    }
}

impl BacktestReport {
    fn aggregate(
        trades: Vec<TradeOutcome>,
        cycles: Vec<SignalCycle>,
        excluded: Vec<ExcludedCycle>,
    ) -> Self {
        let completed: Vec<&TradeOutcome> = trades.iter().filter(|t| t.is_complete()).collect();
        let wins = completed.iter().filter(|t| t.success).count();
        let profits: Vec<f64> = completed.iter().map(|t| t.max_favorable_excursion_pct).collect();
        let drawdowns: Vec<f64> = completed.iter().map(|t| t.max_adverse_excursion_pct).collect();
        let returns: Vec<f64> = completed.iter().map(|t| t.exit_return_pct).collect();
        let peaks: Vec<f64> = completed.iter().map(|t| t.days_to_peak as f64).collect();

        let mut grouped: BTreeMap<String, Vec<&TradeOutcome>> = BTreeMap::new();
        for trade in &completed {
            grouped
                .entry(trade.cycle_ref.opening_state.as_str().to_string())
                .or_default()
                .push(trade);
        }
        let per_state = grouped
            .into_iter()
            .map(|(state, group)| {
                let state_wins = group.iter().filter(|t| t.success).count();
                let profits: Vec<f64> = group.iter().map(|t| t.max_favorable_excursion_pct).collect();
                let drawdowns: Vec<f64> = group.iter().map(|t| t.max_adverse_excursion_pct).collect();
                let stats = StateStats {
                    count: group.len(),
                    wins: state_wins,
                    win_rate: state_wins as f64 / group.len() as f64,
                    avg_max_profit: mean_or_zero(&profits),
                    avg_max_drawdown: mean_or_zero(&drawdowns),
                };
                (state, stats)
            })
            .collect();

        let completed_count = completed.len();
        let incomplete_count = trades.len() - completed_count;
        Self {
            completed: completed_count,
            wins,
            win_rate: if completed_count > 0 {
                wins as f64 / completed_count as f64
            } else {
                0.0
            },
            avg_return: mean_or_zero(&returns),
            avg_max_profit: mean_or_zero(&profits),
            avg_max_drawdown: mean_or_zero(&drawdowns),
            avg_days_to_peak: mean_or_zero(&peaks),
            max_profit_std_dev: std_dev_or_zero(&profits),
            per_state,
            incomplete_count,
            excluded,
            trades,
            cycles,
        }
    }

    pub fn summary(&self) -> BacktestSummary {
        BacktestSummary {
            win_rate: self.win_rate,
            avg_return: self.avg_return,
            trades: self.completed,
        }
    }
}

/// Simulate every cycle; a cycle that cannot be simulated is excluded with its reason.
pub fn backtest_cycles(
    bars: &[Bar],
    cycles: Vec<SignalCycle>,
    config: &SimulationConfig,
) -> BacktestReport {
    let mut trades = Vec::with_capacity(cycles.len());
    let mut simulated = Vec::with_capacity(cycles.len());
    let mut excluded = Vec::new();

    for mut cycle in cycles {
        match simulate_cycle(bars, &mut cycle, config) {
            Ok(outcome) => trades.push(outcome),
            Err(e) => {
                warn!(
                    "Excluding {} cycle at bar {}: {}",
                    cycle.strategy_id, cycle.start_index, e
                );
                excluded.push(ExcludedCycle {
                    strategy_id: cycle.strategy_id.clone(),
                    start_index: cycle.start_index,
                    reason: e.to_string(),
                });
            }
        }
        simulated.push(cycle);
    }

    let report = BacktestReport::aggregate(trades, simulated, excluded);
    if report.incomplete_count > 0 {
        info!(
            "{} of {} trades ran past the end of the series and were left out of the statistics",
            report.incomplete_count,
            report.trades.len()
        );
    }
    report
}

/// Group a strategy's signal series into cycles and backtest them.
pub fn run_backtest_for(
    strategy_id: &str,
    bars: &[Bar],
    signals: &[SignalState],
    config: &SimulationConfig,
) -> Result<BacktestReport, EngineError> {
    if signals.len() != bars.len() {
        return Err(EngineError::Series(format!(
            "{} signal series length {} does not match {} bars",
            strategy_id,
            signals.len(),
            bars.len()
        )));
    }
    let cycles = group_cycles(strategy_id, signals, config.cycle_window());
    Ok(backtest_cycles(bars, cycles, config))
}

pub fn run_backtest(
    bars: &[Bar],
    signals: &[SignalState],
    config: &SimulationConfig,
) -> Result<BacktestReport, EngineError> {
    run_backtest_for(UNNAMED_STRATEGY, bars, signals, config)
}
