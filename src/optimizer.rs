use crate::config::{OptimizerConfig, TargetRule};
use crate::error::EngineError;
use crate::indicators::support_resistance;
use crate::models::{Bar, CoefficientCandidate};
use log::{debug, info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// One historical bar with a full lookahead window and a usable reference level.
#[derive(Debug, Clone, Copy, PartialEq)]
struct ReferencePoint {
    index: usize,
    close: f64,
    level: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    pub index: usize,
    pub target: f64,
    pub success: bool,
    pub return_pct: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationReport {
    pub target_rule: TargetRule,
    pub reference_points: usize,
    pub skipped_points: usize,
    pub best: Option<CoefficientCandidate>,
    /// One row per grid entry, in grid order.
    pub candidates: Vec<CoefficientCandidate>,
}

impl OptimizationReport {
    pub fn best_coefficient(&self) -> Option<f64> {
        self.best.as_ref().map(|candidate| candidate.value)
    }
}

fn pct(from: f64, to: f64) -> f64 {
    (to - from) / from * 100.0
}

/// Grid-search the multiplier applied to the nearest support or resistance.
///
/// Every bar from `warmup_bars` onwards that still has `lookahead_days` bars
/// after it contributes one scenario per candidate. The result depends only
/// on the bars and the config.
pub fn optimize_coefficient(
    bars: &[Bar],
    config: &OptimizerConfig,
) -> Result<OptimizationReport, EngineError> {
    if config.grid.is_empty() {
        return Err(EngineError::InvalidConfig {
            key: "COEFFICIENT_GRID".to_string(),
            reason: "grid is empty".to_string(),
        });
    }
    let lookahead = config.lookahead_days.max(1);
    let required = config.warmup_bars + lookahead + 1;
    if bars.len() < required {
        return Err(EngineError::InsufficientData {
            required,
            available: bars.len(),
        });
    }

    let mut skipped_points = 0usize;
    let mut references = Vec::new();
    for index in config.warmup_bars..(bars.len() - lookahead) {
        let level = support_resistance(bars, index, config.extremum_window).map(|levels| {
            match config.target_rule {
                TargetRule::SupportEntry => levels.support,
                TargetRule::ResistanceExit => levels.resistance,
            }
        });
        match level {
            Some(level) if level.is_finite() && level > 0.0 && bars[index].close > 0.0 => {
                references.push(ReferencePoint {
                    index,
                    close: bars[index].close,
                    level,
                })
            }
            _ => skipped_points += 1,
        }
    }
    if skipped_points > 0 {
        debug!("Skipped {} bars without a usable reference level", skipped_points);
    }

    let candidates: Vec<CoefficientCandidate> = config
        .grid
        .par_iter()
        .map(|&coefficient| evaluate_candidate(bars, &references, coefficient, lookahead, config))
        .collect();

    let mut best: Option<&CoefficientCandidate> = None;
    for candidate in candidates.iter().filter(|c| c.excluded.is_none()) {
        match best {
            Some(current) if candidate.composite_score <= current.composite_score => {}
            _ => best = Some(candidate),
        }
    }
    let best = best.cloned();

    match &best {
        Some(candidate) => info!(
            "Best coefficient {:.4}: success {:.1}%, avg return {:.2}%, score {:.3} over {} scenarios",
            candidate.value,
            candidate.success_rate,
            candidate.avg_return_pct,
            candidate.composite_score,
            candidate.scenario_count
        ),
        None => warn!("No coefficient candidate produced a usable scenario"),
    }

    Ok(OptimizationReport {
        target_rule: config.target_rule,
        reference_points: references.len(),
        skipped_points,
        best,
        candidates,
    })
}

fn evaluate_candidate(
    bars: &[Bar],
    references: &[ReferencePoint],
    coefficient: f64,
    lookahead: usize,
    config: &OptimizerConfig,
) -> CoefficientCandidate {
    let excluded = |reason: String| CoefficientCandidate {
        value: coefficient,
        success_rate: 0.0,
        avg_return_pct: 0.0,
        composite_score: 0.0,
        scenario_count: 0,
        excluded: Some(reason),
    };

    if !(coefficient.is_finite() && coefficient > 0.0) {
        return excluded(format!("coefficient {} is not a positive number", coefficient));
    }

    let scenarios: Vec<Scenario> = references
        .iter()
        .map(|point| run_scenario(bars, point, coefficient, lookahead, config.target_rule))
        .collect();
    if scenarios.is_empty() {
        return excluded("no scenario with a full lookahead window".to_string());
    }

    let count = scenarios.len() as f64;
    let success_rate = scenarios.iter().filter(|s| s.success).count() as f64 / count * 100.0;
    let avg_return_pct = scenarios.iter().map(|s| s.return_pct).sum::<f64>() / count;
    let composite_score = config.success_weight * success_rate + config.return_weight * avg_return_pct;
    if !composite_score.is_finite() {
        return excluded(format!("non-finite composite score {}", composite_score));
    }

    CoefficientCandidate {
        value: coefficient,
        success_rate,
        avg_return_pct,
        composite_score,
        scenario_count: scenarios.len(),
        excluded: None,
    }
}

fn run_scenario(
    bars: &[Bar],
    point: &ReferencePoint,
    coefficient: f64,
    lookahead: usize,
    rule: TargetRule,
) -> Scenario {
    let target = point.level * coefficient;
    let window = &bars[point.index + 1..=point.index + lookahead];
    let window_close = window.last().map(|bar| bar.close).unwrap_or(point.close);

    match rule {
        // Buy limit at the target; judged by where the window closes.
        TargetRule::SupportEntry => {
            if window.iter().any(|bar| bar.low <= target) {
                let return_pct = pct(target, window_close);
                Scenario {
                    index: point.index,
                    target,
                    success: return_pct >= 0.0,
                    return_pct,
                }
            } else {
                Scenario {
                    index: point.index,
                    target,
                    success: false,
                    return_pct: 0.0,
                }
            }
        }
        // Take-profit from the reference close.
        TargetRule::ResistanceExit => {
            if window.iter().any(|bar| bar.high >= target) {
                Scenario {
                    index: point.index,
                    target,
                    success: true,
                    return_pct: pct(point.close, target),
                }
            } else {
                Scenario {
                    index: point.index,
                    target,
                    success: false,
                    return_pct: pct(point.close, window_close),
                }
            }
        }
    }
}
