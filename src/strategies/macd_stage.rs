use crate::error::EngineError;
use crate::indicators::{IndicatorSeries, CH_MACD, CH_MACD_HIST};
use crate::models::*;
use crate::param_utils::{get_param_f64, get_param_usize_at_least, params_from};
use crate::strategy::StrategyEvaluation;
use crate::strategy_utils::{crossed_above, note, pair_at};
use serde_json::json;

/// Three-stage MACD confirmation.
///
/// PRE: histogram turns up while both histogram and MACD are below zero.
/// MID: MACD crosses above its signal line.
/// POST: MACD crosses above the zero line.
///
/// Periods come from the shared indicator configuration; `min_bars` must
/// cover its slow + signal warmup.
pub struct MacdStageStrategy;

impl super::Strategy for MacdStageStrategy {
    fn strategy_id(&self) -> &str {
        "macd_stage"
    }

    fn name(&self) -> &str {
        "MACD staged confirmation"
    }

    fn default_params(&self) -> StrategyParams {
        params_from(&[("min_bars", 35.0), ("zero_tolerance", 0.0)])
    }

    fn required_minimum_bars(&self, params: &StrategyParams) -> usize {
        get_param_usize_at_least(params, "min_bars", 35, 3)
    }

    fn generate(
        &self,
        bars: &[Bar],
        indicators: &IndicatorSeries,
        params: &StrategyParams,
    ) -> Result<StrategyEvaluation, EngineError> {
        let tolerance = get_param_f64(params, "zero_tolerance", 0.0).abs();
        let mut evaluation = StrategyEvaluation::empty(bars.len());
        let (Some(macd), Some(hist)) = (
            indicators.channel(CH_MACD),
            indicators.channel(CH_MACD_HIST),
        ) else {
            return Ok(evaluation);
        };

        let mut last_seen: [Option<usize>; 3] = [None; 3];
        for i in 2..bars.len() {
            let Some((prev_macd, cur_macd)) = pair_at(macd, i) else {
                continue;
            };

            let state = if crossed_above(prev_macd, tolerance, cur_macd, tolerance) {
                SignalState::Post
            } else if let Some((prev_hist, cur_hist)) = pair_at(hist, i) {
                let turning_up = pair_at(hist, i - 1)
                    .map(|(before, prev)| prev <= before)
                    .unwrap_or(false);
                if crossed_above(prev_hist, 0.0, cur_hist, 0.0) {
                    SignalState::Mid
                } else if cur_hist < 0.0 && cur_macd < 0.0 && cur_hist > prev_hist && turning_up {
                    SignalState::Pre
                } else {
                    SignalState::Empty
                }
            } else {
                SignalState::Empty
            };

            let slot = match state {
                SignalState::Pre => 0,
                SignalState::Mid => 1,
                SignalState::Post => 2,
                _ => continue,
            };
            last_seen[slot] = Some(i);
            evaluation.signals[i] = state;
            evaluation.notes.insert(
                i,
                note([
                    ("macd", json!(cur_macd)),
                    ("histogram", json!(hist[i])),
                ]),
            );
        }

        let stages_confirmed = match evaluation.latest_signal_since(0) {
            Some((_, SignalState::Pre)) => 1,
            Some((_, SignalState::Mid)) => 2,
            Some((_, SignalState::Post)) => 3,
            _ => 0,
        };
        evaluation.detail = Some(note([
            ("stages_confirmed", json!(stages_confirmed)),
            ("stages_total", json!(3)),
            ("last_pre", json!(last_seen[0])),
            ("last_mid", json!(last_seen[1])),
            ("last_post", json!(last_seen[2])),
        ]));
        Ok(evaluation)
    }
}
