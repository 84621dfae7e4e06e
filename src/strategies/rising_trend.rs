use crate::error::EngineError;
use crate::indicators::IndicatorSeries;
use crate::models::*;
use crate::param_utils::{get_param_usize_at_least, params_from};
use crate::strategy::StrategyEvaluation;
use crate::strategy_utils::{note, pair_at, sma_series};
use serde_json::json;

/// Flags bars that close above a rising SMA after consecutive higher closes.
pub struct RisingTrendStrategy;

impl RisingTrendStrategy {
    fn periods(params: &StrategyParams) -> (usize, usize) {
        let sma_period = get_param_usize_at_least(params, "sma_period", 5, 1);
        let rising_bars = get_param_usize_at_least(params, "rising_bars", 3, 1);
        (sma_period, rising_bars)
    }
}

impl super::Strategy for RisingTrendStrategy {
    fn strategy_id(&self) -> &str {
        "rising_trend"
    }

    fn name(&self) -> &str {
        "Rising trend"
    }

    fn default_params(&self) -> StrategyParams {
        params_from(&[("sma_period", 5.0), ("rising_bars", 3.0)])
    }

    fn required_minimum_bars(&self, params: &StrategyParams) -> usize {
        let (sma_period, rising_bars) = Self::periods(params);
        sma_period.max(rising_bars) + 1
    }

    fn generate(
        &self,
        bars: &[Bar],
        indicators: &IndicatorSeries,
        params: &StrategyParams,
    ) -> Result<StrategyEvaluation, EngineError> {
        let (sma_period, rising_bars) = Self::periods(params);
        let sma = sma_series(bars, indicators, sma_period);
        let mut evaluation = StrategyEvaluation::empty(bars.len());

        for i in rising_bars..bars.len() {
            let Some((prev_sma, cur_sma)) = pair_at(&sma, i) else {
                continue;
            };
            let close = bars[i].close;
            if cur_sma <= prev_sma || close <= cur_sma {
                continue;
            }
            let consecutive = bars[i - rising_bars..=i]
                .windows(2)
                .all(|pair| pair[1].close > pair[0].close);
            if !consecutive {
                continue;
            }
            evaluation.signals[i] = SignalState::Flag;
            evaluation
                .notes
                .insert(i, note([("close", json!(close)), ("sma", json!(cur_sma))]));
        }

        Ok(evaluation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IndicatorConfig;
    use crate::indicators::compute_indicators;
    use crate::strategy::Strategy;
    use crate::test_support::{flat_bars, rising_bars};

    #[test]
    fn flags_every_bar_of_a_steady_rise() {
        let bars = rising_bars(12, 10.0, 0.01);
        let indicators = compute_indicators(&bars, &IndicatorConfig::default()).unwrap();
        let strategy = RisingTrendStrategy;
        let evaluation = strategy
            .evaluate(&bars, &indicators, &strategy.default_params())
            .unwrap();
        // SMA(5) needs index 4 plus one prior value to compare against.
        assert!(evaluation.signals[..5].iter().all(|s| s.is_empty()));
        assert!(evaluation.signals[5..].iter().all(|s| *s == SignalState::Flag));
    }

    #[test]
    fn flat_series_never_flags() {
        let bars = flat_bars(30, 10.0);
        let indicators = compute_indicators(&bars, &IndicatorConfig::default()).unwrap();
        let strategy = RisingTrendStrategy;
        let evaluation = strategy
            .evaluate(&bars, &indicators, &strategy.default_params())
            .unwrap();
        assert_eq!(evaluation.signal_count(), 0);
    }
}
