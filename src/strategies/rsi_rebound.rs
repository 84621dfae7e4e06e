use crate::error::EngineError;
use crate::indicators::{IndicatorSeries, CH_RSI};
use crate::models::*;
use crate::param_utils::{get_param_usize_at_least, params_from, require_param};
use crate::strategy::StrategyEvaluation;
use crate::strategy_utils::{crossed_above, crossed_below, note, pair_at};
use serde_json::json;

/// PRE when RSI drops into the oversold zone, MID when it climbs back out.
pub struct RsiReboundStrategy;

impl super::Strategy for RsiReboundStrategy {
    fn strategy_id(&self) -> &str {
        "rsi_rebound"
    }

    fn name(&self) -> &str {
        "RSI oversold rebound"
    }

    fn default_params(&self) -> StrategyParams {
        params_from(&[("oversold", 30.0), ("min_bars", 15.0)])
    }

    fn required_minimum_bars(&self, params: &StrategyParams) -> usize {
        get_param_usize_at_least(params, "min_bars", 15, 2)
    }

    fn generate(
        &self,
        bars: &[Bar],
        indicators: &IndicatorSeries,
        params: &StrategyParams,
    ) -> Result<StrategyEvaluation, EngineError> {
        let oversold = require_param(params, self.strategy_id(), "oversold")?;
        let mut evaluation = StrategyEvaluation::empty(bars.len());
        let Some(rsi) = indicators.channel(CH_RSI) else {
            return Ok(evaluation);
        };

        let mut lowest: Option<f64> = None;
        for i in 1..bars.len() {
            let Some((prev, cur)) = pair_at(rsi, i) else {
                continue;
            };
            if cur < oversold {
                lowest = Some(lowest.map_or(cur, |low: f64| low.min(cur)));
            }

            if crossed_below(prev, oversold, cur, oversold) {
                evaluation.signals[i] = SignalState::Pre;
                evaluation.notes.insert(i, note([("rsi", json!(cur))]));
            } else if crossed_above(prev, oversold, cur, oversold) {
                evaluation.signals[i] = SignalState::Mid;
                evaluation.notes.insert(
                    i,
                    note([("rsi", json!(cur)), ("rsi_low", json!(lowest.take()))]),
                );
            }
        }

        evaluation.detail = Some(note([
            ("oversold", json!(oversold)),
            ("latest_rsi", json!(rsi.last().copied().flatten())),
        ]));
        Ok(evaluation)
    }
}
