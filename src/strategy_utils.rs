use crate::indicators::{calculate_sma, sma_channel, IndicatorSeries};
use crate::models::{Bar, Diagnostics};
use serde_json::Value;
use std::borrow::Cow;

/// True when `a` moves from at-or-below `b` to strictly above it.
pub fn crossed_above(prev_a: f64, prev_b: f64, a: f64, b: f64) -> bool {
    prev_a <= prev_b && a > b
}

pub fn crossed_below(prev_a: f64, prev_b: f64, a: f64, b: f64) -> bool {
    prev_a >= prev_b && a < b
}

/// Both the previous and current value of a channel, if defined.
pub fn pair_at(values: &[Option<f64>], index: usize) -> Option<(f64, f64)> {
    if index == 0 {
        return None;
    }
    match (values.get(index - 1)?, values.get(index)?) {
        (Some(prev), Some(cur)) => Some((*prev, *cur)),
        _ => None,
    }
}

/// Reuse the shared SMA channel when it exists, otherwise compute it from closes.
pub fn sma_series<'a>(
    bars: &[Bar],
    indicators: &'a IndicatorSeries,
    period: usize,
) -> Cow<'a, [Option<f64>]> {
    match indicators.channel(&sma_channel(period)) {
        Some(values) => Cow::Borrowed(values),
        None => {
            let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
            Cow::Owned(calculate_sma(&closes, period))
        }
    }
}

pub fn note<I, K>(pairs: I) -> Diagnostics
where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<String>,
{
    pairs
        .into_iter()
        .map(|(key, value)| (key.into(), value))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crossing_requires_strict_move() {
        assert!(crossed_above(1.0, 1.0, 2.0, 1.0));
        assert!(!crossed_above(1.0, 1.0, 1.0, 1.0));
        assert!(crossed_below(2.0, 1.0, 0.5, 1.0));
    }

    #[test]
    fn pair_at_needs_both_values() {
        let values = vec![None, Some(1.0), Some(2.0)];
        assert_eq!(pair_at(&values, 0), None);
        assert_eq!(pair_at(&values, 1), None);
        assert_eq!(pair_at(&values, 2), Some((1.0, 2.0)));
    }
}
