use crate::error::EngineError;
use crate::indicators::{calculate_volume_ratio, IndicatorSeries, CH_VOLUME_RATIO};
use crate::models::*;
use crate::param_utils::{get_param_f64, get_param_usize_at_least, params_from};
use crate::strategy::StrategyEvaluation;
use crate::strategy_utils::note;
use serde_json::json;
use std::borrow::Cow;

/// Close above the prior `lookback`-bar high, confirmed by heavy volume.
pub struct VolumeBreakoutStrategy;

impl super::Strategy for VolumeBreakoutStrategy {
    fn strategy_id(&self) -> &str {
        "volume_breakout"
    }

    fn name(&self) -> &str {
        "Volume breakout"
    }

    fn default_params(&self) -> StrategyParams {
        params_from(&[("lookback", 20.0), ("volume_ratio_min", 1.5)])
    }

    fn required_minimum_bars(&self, params: &StrategyParams) -> usize {
        get_param_usize_at_least(params, "lookback", 20, 2) + 1
    }

    fn generate(
        &self,
        bars: &[Bar],
        indicators: &IndicatorSeries,
        params: &StrategyParams,
    ) -> Result<StrategyEvaluation, EngineError> {
        let lookback = get_param_usize_at_least(params, "lookback", 20, 2);
        let ratio_min = get_param_f64(params, "volume_ratio_min", 1.5);
        let ratios: Cow<[Option<f64>]> = match indicators.channel(CH_VOLUME_RATIO) {
            Some(values) => Cow::Borrowed(values),
            None => {
                let volumes: Vec<f64> = bars.iter().map(|b| b.volume).collect();
                Cow::Owned(calculate_volume_ratio(&volumes, lookback))
            }
        };

        let mut evaluation = StrategyEvaluation::empty(bars.len());
        let mut breakouts = 0usize;
        for i in lookback..bars.len() {
            let prior_high = bars[i - lookback..i]
                .iter()
                .map(|b| b.high)
                .fold(f64::NEG_INFINITY, f64::max);
            let Some(ratio) = ratios.get(i).copied().flatten() else {
                continue;
            };
            if bars[i].close > prior_high && ratio >= ratio_min {
                breakouts += 1;
                evaluation.signals[i] = SignalState::Flag;
                evaluation.notes.insert(
                    i,
                    note([
                        ("prior_high", json!(prior_high)),
                        ("volume_ratio", json!(ratio)),
                    ]),
                );
            }
        }

        evaluation.detail = Some(note([
            ("lookback", json!(lookback)),
            ("breakouts", json!(breakouts)),
        ]));
        Ok(evaluation)
    }
}
