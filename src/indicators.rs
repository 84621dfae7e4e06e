use crate::config::IndicatorConfig;
use crate::error::EngineError;
use crate::models::Bar;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Shortest series any indicator can say something about (one-step difference).
pub const MIN_INDICATOR_BARS: usize = 2;

pub const CH_EMA: &str = "ema";
pub const CH_MACD: &str = "macd";
pub const CH_MACD_SIGNAL: &str = "macd_signal";
pub const CH_MACD_HIST: &str = "macd_hist";
pub const CH_RSI: &str = "rsi";
pub const CH_BB_UPPER: &str = "bb_upper";
pub const CH_BB_MIDDLE: &str = "bb_middle";
pub const CH_BB_LOWER: &str = "bb_lower";
pub const CH_ATR: &str = "atr";
pub const CH_ROC: &str = "roc";
pub const CH_VOLUME_RATIO: &str = "volume_ratio";
pub const CH_HIGHEST_HIGH: &str = "highest_high";
pub const CH_LOWEST_LOW: &str = "lowest_low";

pub fn sma_channel(period: usize) -> String {
    format!("sma_{}", period)
}

/// Named channels aligned to a bar sequence; `None` marks warmup.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSeries {
    len: usize,
    channels: BTreeMap<String, Vec<Option<f64>>>,
}

impl IndicatorSeries {
    pub fn new(len: usize) -> Self {
        Self {
            len,
            channels: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn insert(&mut self, name: impl Into<String>, values: Vec<Option<f64>>) {
        debug_assert_eq!(values.len(), self.len);
        self.channels.insert(name.into(), values);
    }

    pub fn channel(&self, name: &str) -> Option<&[Option<f64>]> {
        self.channels.get(name).map(|values| values.as_slice())
    }

    pub fn value(&self, name: &str, index: usize) -> Option<f64> {
        self.channels
            .get(name)
            .and_then(|values| values.get(index).copied().flatten())
    }

    pub fn latest(&self, name: &str) -> Option<f64> {
        self.len.checked_sub(1).and_then(|idx| self.value(name, idx))
    }

    pub fn channel_names(&self) -> impl Iterator<Item = &str> {
        self.channels.keys().map(|name| name.as_str())
    }
}

/// Compute every configured channel once for a bar sequence.
pub fn compute_indicators(
    bars: &[Bar],
    config: &IndicatorConfig,
) -> Result<IndicatorSeries, EngineError> {
    if bars.len() < MIN_INDICATOR_BARS {
        return Err(EngineError::InsufficientData {
            required: MIN_INDICATOR_BARS,
            available: bars.len(),
        });
    }

    let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
    let highs: Vec<f64> = bars.iter().map(|b| b.high).collect();
    let lows: Vec<f64> = bars.iter().map(|b| b.low).collect();
    let volumes: Vec<f64> = bars.iter().map(|b| b.volume).collect();

    let mut series = IndicatorSeries::new(bars.len());
    for &period in &config.sma_periods {
        series.insert(sma_channel(period), calculate_sma(&closes, period));
    }
    series.insert(CH_EMA, calculate_ema(&closes, config.ema_period));

    let macd = calculate_macd(
        &closes,
        config.macd_fast,
        config.macd_slow,
        config.macd_signal,
    );
    series.insert(CH_MACD, macd.line);
    series.insert(CH_MACD_SIGNAL, macd.signal);
    series.insert(CH_MACD_HIST, macd.histogram);

    series.insert(CH_RSI, calculate_rsi(&closes, config.rsi_period));

    let bands = calculate_bollinger_bands(&closes, config.bollinger_period, config.bollinger_std_dev);
    series.insert(CH_BB_UPPER, bands.upper);
    series.insert(CH_BB_MIDDLE, bands.middle);
    series.insert(CH_BB_LOWER, bands.lower);

    series.insert(CH_ATR, calculate_atr(bars, config.atr_period));
    series.insert(CH_ROC, calculate_roc(&closes, config.roc_period));
    series.insert(
        CH_VOLUME_RATIO,
        calculate_volume_ratio(&volumes, config.volume_period),
    );
    series.insert(
        CH_HIGHEST_HIGH,
        rolling_max(&highs, config.extremum_window),
    );
    series.insert(CH_LOWEST_LOW, rolling_min(&lows, config.extremum_window));

    Ok(series)
}

pub fn calculate_sma(prices: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut sma_values = vec![None; prices.len()];
    if period == 0 || prices.len() < period {
        return sma_values;
    }

    let mut window_sum: f64 = prices[..period].iter().sum();
    sma_values[period - 1] = Some(window_sum / period as f64);
    for i in period..prices.len() {
        window_sum += prices[i] - prices[i - period];
        sma_values[i] = Some(window_sum / period as f64);
    }

    sma_values
}

/// EMA seeded with the SMA of the first `period` values.
pub fn calculate_ema(prices: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut ema_values = vec![None; prices.len()];
    if period == 0 || prices.len() < period {
        return ema_values;
    }

    let multiplier = 2.0 / (period as f64 + 1.0);
    let mut ema = prices[..period].iter().sum::<f64>() / period as f64;
    ema_values[period - 1] = Some(ema);
    for i in period..prices.len() {
        ema += multiplier * (prices[i] - ema);
        ema_values[i] = Some(ema);
    }

    ema_values
}

/// EMA over a partially-defined series; warmup restarts at the first defined value.
fn calculate_ema_sparse(values: &[Option<f64>], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; values.len()];
    let Some(first) = values.iter().position(|v| v.is_some()) else {
        return out;
    };
    let dense: Vec<f64> = values[first..].iter().map(|v| v.unwrap_or(0.0)).collect();
    for (offset, value) in calculate_ema(&dense, period).into_iter().enumerate() {
        out[first + offset] = value;
    }
    out
}

pub struct MacdOutput {
    pub line: Vec<Option<f64>>,
    pub signal: Vec<Option<f64>>,
    pub histogram: Vec<Option<f64>>,
}

pub fn calculate_macd(
    prices: &[f64],
    fast_period: usize,
    slow_period: usize,
    signal_period: usize,
) -> MacdOutput {
    let fast_ema = calculate_ema(prices, fast_period);
    let slow_ema = calculate_ema(prices, slow_period);

    let line: Vec<Option<f64>> = fast_ema
        .iter()
        .zip(slow_ema.iter())
        .map(|(fast, slow)| match (fast, slow) {
            (Some(f), Some(s)) => Some(f - s),
            _ => None,
        })
        .collect();

    let signal = calculate_ema_sparse(&line, signal_period);

    let histogram = line
        .iter()
        .zip(signal.iter())
        .map(|(m, s)| match (m, s) {
            (Some(m), Some(s)) => Some(m - s),
            _ => None,
        })
        .collect();

    MacdOutput {
        line,
        signal,
        histogram,
    }
}

fn rsi_from_avgs(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 && avg_gain == 0.0 {
        50.0
    } else if avg_loss == 0.0 {
        100.0
    } else if avg_gain == 0.0 {
        0.0
    } else {
        let rs = avg_gain / avg_loss;
        100.0 - 100.0 / (1.0 + rs)
    }
}

/// Wilder RSI; the first defined value sits at index `period`.
pub fn calculate_rsi(prices: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut rsi_values = vec![None; prices.len()];
    if period == 0 || prices.len() < period + 1 {
        return rsi_values;
    }

    let mut sum_gain = 0.0f64;
    let mut sum_loss = 0.0f64;
    for i in 1..=period {
        let delta = prices[i] - prices[i - 1];
        if delta >= 0.0 {
            sum_gain += delta;
        } else {
            sum_loss += -delta;
        }
    }

    let mut avg_gain = sum_gain / period as f64;
    let mut avg_loss = sum_loss / period as f64;
    rsi_values[period] = Some(rsi_from_avgs(avg_gain, avg_loss));

    for i in (period + 1)..prices.len() {
        let delta = prices[i] - prices[i - 1];
        let gain = if delta > 0.0 { delta } else { 0.0 };
        let loss = if delta < 0.0 { -delta } else { 0.0 };
        avg_gain = (avg_gain * (period as f64 - 1.0) + gain) / period as f64;
        avg_loss = (avg_loss * (period as f64 - 1.0) + loss) / period as f64;
        rsi_values[i] = Some(rsi_from_avgs(avg_gain, avg_loss));
    }

    rsi_values
}

pub struct BollingerOutput {
    pub upper: Vec<Option<f64>>,
    pub middle: Vec<Option<f64>>,
    pub lower: Vec<Option<f64>>,
}

pub fn calculate_bollinger_bands(prices: &[f64], period: usize, std_dev: f64) -> BollingerOutput {
    let middle = calculate_sma(prices, period);
    let mut upper = vec![None; prices.len()];
    let mut lower = vec![None; prices.len()];

    for (i, mean) in middle.iter().enumerate() {
        let Some(mean) = *mean else {
            continue;
        };
        let window_start = i + 1 - period;
        let slice = &prices[window_start..=i];
        let variance = slice.iter().map(|&val| (val - mean).powi(2)).sum::<f64>() / period as f64;
        let standard_deviation = variance.sqrt();

        upper[i] = Some(mean + (std_dev * standard_deviation));
        lower[i] = Some(mean - (std_dev * standard_deviation));
    }

    BollingerOutput {
        upper,
        middle,
        lower,
    }
}

/// Wilder ATR aligned to bar indices; first value at index `period`.
pub fn calculate_atr(bars: &[Bar], period: usize) -> Vec<Option<f64>> {
    let n = bars.len();
    let mut atr = vec![None; n];
    if period == 0 || n <= period {
        return atr;
    }

    let mut tr_sum = 0.0f64;
    let mut prev_atr = 0.0f64;
    for i in 1..n {
        let tr = bars[i].true_range(bars[i - 1].close);
        if i <= period {
            tr_sum += tr;
            if i == period {
                prev_atr = tr_sum / period as f64;
                atr[i] = Some(prev_atr);
            }
        } else {
            prev_atr = ((prev_atr * (period as f64 - 1.0)) + tr) / period as f64;
            atr[i] = Some(prev_atr);
        }
    }

    atr
}

/// Percent change over `period` bars.
pub fn calculate_roc(prices: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut roc = vec![None; prices.len()];
    if period == 0 {
        return roc;
    }
    for i in period..prices.len() {
        let base = prices[i - period];
        if base != 0.0 {
            roc[i] = Some((prices[i] - base) / base * 100.0);
        }
    }
    roc
}

/// Volume relative to its own simple moving average.
pub fn calculate_volume_ratio(volumes: &[f64], period: usize) -> Vec<Option<f64>> {
    calculate_sma(volumes, period)
        .into_iter()
        .zip(volumes.iter())
        .map(|(avg, &volume)| match avg {
            Some(avg) if avg > 0.0 => Some(volume / avg),
            _ => None,
        })
        .collect()
}

pub fn rolling_max(values: &[f64], window: usize) -> Vec<Option<f64>> {
    rolling_extremum(values, window, f64::max, f64::NEG_INFINITY)
}

pub fn rolling_min(values: &[f64], window: usize) -> Vec<Option<f64>> {
    rolling_extremum(values, window, f64::min, f64::INFINITY)
}

fn rolling_extremum(
    values: &[f64],
    window: usize,
    pick: fn(f64, f64) -> f64,
    init: f64,
) -> Vec<Option<f64>> {
    let mut out = vec![None; values.len()];
    if window == 0 || values.len() < window {
        return out;
    }
    for i in (window - 1)..values.len() {
        let window_start = i + 1 - window;
        out[i] = Some(values[window_start..=i].iter().copied().fold(init, pick));
    }
    out
}

/// Support and resistance around one bar, derived only from bars at or before it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceLevels {
    pub support: f64,
    pub resistance: f64,
}

/// Half-width of the pivot confirmation window.
const PIVOT_HALF_WIDTH: usize = 3;

/// Rolling extremum detector.
///
/// A pivot low at `j` is a bar whose low is the minimum of `j - k ..= j + k`
/// with `j + k <= index`, so no future bar is consulted. Support is the
/// highest pivot low at or below the close of `index` within `window` bars;
/// without one it falls back to the lowest low of the window. Resistance
/// mirrors this with pivot highs.
pub fn support_resistance(bars: &[Bar], index: usize, window: usize) -> Option<PriceLevels> {
    if bars.is_empty() || index >= bars.len() || window == 0 {
        return None;
    }
    let start = (index + 1).saturating_sub(window);
    let close = bars[index].close;
    let k = PIVOT_HALF_WIDTH;

    let mut support: Option<f64> = None;
    let mut resistance: Option<f64> = None;
    for j in start..=index {
        if j < k || j + k > index {
            continue;
        }
        let neighbourhood = &bars[j - k..=j + k];
        let low = bars[j].low;
        let high = bars[j].high;
        if neighbourhood.iter().all(|b| b.low >= low) && low <= close {
            support = Some(support.map_or(low, |s: f64| s.max(low)));
        }
        if neighbourhood.iter().all(|b| b.high <= high) && high >= close {
            resistance = Some(resistance.map_or(high, |r: f64| r.min(high)));
        }
    }

    let window_bars = &bars[start..=index];
    let support = support.unwrap_or_else(|| {
        window_bars
            .iter()
            .map(|b| b.low)
            .fold(f64::INFINITY, f64::min)
    });
    let resistance = resistance.unwrap_or_else(|| {
        window_bars
            .iter()
            .map(|b| b.high)
            .fold(f64::NEG_INFINITY, f64::max)
    });

    Some(PriceLevels {
        support,
        resistance,
    })
}
