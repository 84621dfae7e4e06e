use crate::error::EngineError;
use crate::indicators::IndicatorSeries;
use crate::models::*;
use crate::param_utils::{get_param_usize_at_least, params_from};
use crate::strategy::StrategyEvaluation;
use crate::strategy_utils::{crossed_above, note, pair_at, sma_series};
use serde_json::json;

pub struct MaCrossoverStrategy;

impl MaCrossoverStrategy {
    fn periods(params: &StrategyParams) -> (usize, usize) {
        let fast = get_param_usize_at_least(params, "fast_period", 5, 1);
        let slow = get_param_usize_at_least(params, "slow_period", 20, 2);
        (fast.min(slow - 1), slow)
    }
}

impl super::Strategy for MaCrossoverStrategy {
    fn strategy_id(&self) -> &str {
        "ma_crossover"
    }

    fn name(&self) -> &str {
        "Moving average crossover"
    }

    fn default_params(&self) -> StrategyParams {
        params_from(&[("fast_period", 5.0), ("slow_period", 20.0)])
    }

    fn required_minimum_bars(&self, params: &StrategyParams) -> usize {
        let (_, slow) = Self::periods(params);
        slow + 1
    }

    fn generate(
        &self,
        bars: &[Bar],
        indicators: &IndicatorSeries,
        params: &StrategyParams,
    ) -> Result<StrategyEvaluation, EngineError> {
        let (fast_period, slow_period) = Self::periods(params);
        let fast = sma_series(bars, indicators, fast_period);
        let slow = sma_series(bars, indicators, slow_period);
        let mut evaluation = StrategyEvaluation::empty(bars.len());
        let mut crosses = 0usize;

        for i in 1..bars.len() {
            let (Some((prev_fast, cur_fast)), Some((prev_slow, cur_slow))) =
                (pair_at(&fast, i), pair_at(&slow, i))
            else {
                continue;
            };

            // Golden cross
            if crossed_above(prev_fast, prev_slow, cur_fast, cur_slow) {
                crosses += 1;
                evaluation.signals[i] = SignalState::Flag;
                evaluation.notes.insert(
                    i,
                    note([
                        ("fast", json!(cur_fast)),
                        ("slow", json!(cur_slow)),
                        ("spread_pct", json!((cur_fast - cur_slow) / cur_slow * 100.0)),
                    ]),
                );
            }
        }

        evaluation.detail = Some(note([
            ("fast_period", json!(fast_period)),
            ("slow_period", json!(slow_period)),
            ("crosses", json!(crosses)),
        ]));
        Ok(evaluation)
    }
}
