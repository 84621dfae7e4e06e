use crate::cache::CacheKey;
use crate::config::TargetRule;
use crate::indicators::{compute_indicators, support_resistance, IndicatorSeries};
use crate::models::{Bar, BacktestSummary};
use crate::optimizer::optimize_coefficient;
use crate::positions::{Action, PositionBook, PositionState};
use crate::provider::validate_bars;
use crate::scoring::DecisionScores;
use crate::screening::ScreeningCoordinator;
use anyhow::{Context, Result};
use chrono::NaiveDate;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Cache slot for the per-instrument coefficient search.
const COEFFICIENT_CACHE_ID: &str = "coefficient";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradingAdvice {
    pub scores: DecisionScores,
    pub action: Action,
    pub reason: String,
    pub position_state: PositionState,
    pub position_fraction: f64,
    pub coefficient: Option<f64>,
    pub target_rule: TargetRule,
    /// Support x coefficient, when the coefficient is used as a buy limit.
    pub suggested_entry_price: Option<f64>,
    /// Resistance x coefficient, when the coefficient is used as a take-profit.
    pub suggested_exit_price: Option<f64>,
    pub support: Option<f64>,
    pub resistance: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisBacktest {
    /// Pooled over every strategy that produced completed trades.
    pub overall: BacktestSummary,
    pub per_strategy: BTreeMap<String, BacktestSummary>,
}

/// Payload for external callers. Serializes either as the report fields or as `{"error": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DeepAnalysis {
    Report {
        instrument_id: String,
        as_of: NaiveDate,
        current_price: f64,
        backtest_summary: AnalysisBacktest,
        trading_advice: TradingAdvice,
    },
    Error {
        error: String,
    },
}

impl DeepAnalysis {
    pub fn is_error(&self) -> bool {
        matches!(self, DeepAnalysis::Error { .. })
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            DeepAnalysis::Error { error } => Some(error),
            DeepAnalysis::Report { .. } => None,
        }
    }
}

/// Full recommendation for one instrument, assuming no open position.
///
/// `bars` overrides the provider. Never fails: problems come back as
/// [`DeepAnalysis::Error`].
pub fn get_deep_analysis(
    coordinator: &ScreeningCoordinator,
    instrument_id: &str,
    bars: Option<Vec<Bar>>,
) -> DeepAnalysis {
    let mut book = PositionBook::new(1.0, coordinator.config().decision.clone());
    get_deep_analysis_with_book(coordinator, instrument_id, bars, &mut book)
}

/// Like [`get_deep_analysis`], but advice respects the positions in `book`,
/// which is advanced to the last bar date first.
pub fn get_deep_analysis_with_book(
    coordinator: &ScreeningCoordinator,
    instrument_id: &str,
    bars: Option<Vec<Bar>>,
    book: &mut PositionBook,
) -> DeepAnalysis {
    match analyze(coordinator, instrument_id, bars, book) {
        Ok(report) => report,
        Err(e) => {
            warn!("Deep analysis of {} failed: {:#}", instrument_id, e);
            DeepAnalysis::Error {
                error: format!("{:#}", e),
            }
        }
    }
}

fn load(
    coordinator: &ScreeningCoordinator,
    instrument_id: &str,
    bars: Option<Vec<Bar>>,
) -> Result<(Vec<Bar>, IndicatorSeries)> {
    let config = coordinator.config();
    match bars {
        Some(bars) => {
            validate_bars(instrument_id, &bars)
                .with_context(|| format!("validating supplied bars for {}", instrument_id))?;
            let indicators = compute_indicators(&bars, &config.indicators)
                .with_context(|| format!("computing indicators for {}", instrument_id))?;
            Ok((bars, indicators))
        }
        None => coordinator.prepare(instrument_id, config),
    }
}

fn pooled(per_strategy: &BTreeMap<String, BacktestSummary>) -> BacktestSummary {
    let trades: usize = per_strategy.values().map(|s| s.trades).sum();
    if trades == 0 {
        return BacktestSummary {
            win_rate: 0.0,
            avg_return: 0.0,
            trades: 0,
        };
    }
    let weighted = |f: fn(&BacktestSummary) -> f64| {
        per_strategy
            .values()
            .map(|s| f(s) * s.trades as f64)
            .sum::<f64>()
            / trades as f64
    };
    BacktestSummary {
        win_rate: weighted(|s| s.win_rate),
        avg_return: weighted(|s| s.avg_return),
        trades,
    }
}

fn analyze(
    coordinator: &ScreeningCoordinator,
    instrument_id: &str,
    bars: Option<Vec<Bar>>,
    book: &mut PositionBook,
) -> Result<DeepAnalysis> {
    coordinator.purge_expired();
    let config = coordinator.config();
    let (bars, indicators) = load(coordinator, instrument_id, bars)?;
    let last = bars
        .last()
        .with_context(|| format!("no bars for {}", instrument_id))?;
    let as_of = last.date;
    let current_price = last.close;

    let registry = coordinator.registry();
    let mut per_strategy = BTreeMap::new();
    for strategy_id in registry.ids() {
        let evaluation = registry.get(&strategy_id).and_then(|strategy| {
            let params = registry.resolve_params(&strategy_id, config)?;
            strategy.evaluate(&bars, &indicators, &params)
        });
        let evaluation = match evaluation {
            Ok(evaluation) => evaluation,
            Err(e) => {
                warn!("{}: {} skipped in deep analysis: {}", instrument_id, strategy_id, e);
                continue;
            }
        };
        let entry = coordinator
            .cached_backtest(instrument_id, &strategy_id, &bars, &evaluation.signals, config)
            .with_context(|| format!("backtesting {} on {}", strategy_id, instrument_id))?;
        per_strategy.insert(strategy_id, entry.value.summary());
    }
    let overall = pooled(&per_strategy);

    let optimizer_config = &config.optimizer;
    let key = CacheKey::new(instrument_id, COEFFICIENT_CACHE_ID, as_of);
    let coefficient = match coordinator
        .optimization_cache()
        .get_or_try_insert_with(key, coordinator.today(), || {
            optimize_coefficient(&bars, optimizer_config)
        }) {
        Ok(entry) => entry.value.best_coefficient(),
        Err(e) if e.is_data_error() => {
            debug!("{}: no coefficient ({})", instrument_id, e);
            None
        }
        Err(e) => return Err(e).context("optimizing entry coefficient"),
    };

    let levels = support_resistance(&bars, bars.len() - 1, optimizer_config.extremum_window);
    let target_rule = optimizer_config.target_rule;
    let (suggested_entry_price, suggested_exit_price) = match (coefficient, levels) {
        (Some(c), Some(levels)) => match target_rule {
            TargetRule::SupportEntry => (Some(levels.support * c), None),
            TargetRule::ResistanceExit => (None, Some(levels.resistance * c)),
        },
        _ => (None, None),
    };

    let scores = DecisionScores::latest(&bars, &indicators);
    book.advance_to(as_of);
    let decision = book.decide(instrument_id, current_price, &scores);

    info!(
        "{} as of {}: {:?} ({}), {} backtested trades",
        instrument_id, as_of, decision.action, decision.reason, overall.trades
    );

    Ok(DeepAnalysis::Report {
        instrument_id: instrument_id.to_string(),
        as_of,
        current_price,
        backtest_summary: AnalysisBacktest {
            overall,
            per_strategy,
        },
        trading_advice: TradingAdvice {
            scores,
            action: decision.action,
            reason: decision.reason,
            position_state: decision.state,
            position_fraction: decision.position_fraction,
            coefficient,
            target_rule,
            suggested_entry_price,
            suggested_exit_price,
            support: levels.map(|l| l.support),
            resistance: levels.map(|l| l.resistance),
        },
    })
}
