use crate::indicators::*;
use crate::models::Bar;
use serde::{Deserialize, Serialize};

/// Scores feeding the position state machine, each in 0-100; `confidence` is 0-1.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DecisionScores {
    pub technical: f64,
    pub momentum: f64,
    pub risk: f64,
    pub confidence: f64,
}

impl DecisionScores {
    pub fn new(technical: f64, momentum: f64, risk: f64) -> Self {
        let technical = technical.clamp(0.0, 100.0);
        let momentum = momentum.clamp(0.0, 100.0);
        let risk = risk.clamp(0.0, 100.0);
        let confidence = ((technical + momentum) / 200.0 * (1.0 - risk / 200.0)).clamp(0.0, 1.0);
        Self {
            technical,
            momentum,
            risk,
            confidence,
        }
    }

    /// Derive scores from the indicator values at `index`.
    ///
    /// Undefined (warmup) channels contribute nothing, so a short history
    /// lands near the neutral 50/50 mark.
    pub fn from_indicators(bars: &[Bar], indicators: &IndicatorSeries, index: usize) -> Self {
        let Some(bar) = bars.get(index) else {
            return Self::new(50.0, 50.0, 50.0);
        };
        let close = bar.close;
        let at = |channel: &str| indicators.value(channel, index);

        let mut technical = 50.0;
        let sma_fast = at(&sma_channel(5));
        let sma_mid = at(&sma_channel(20));
        let sma_slow = at(&sma_channel(60));
        if let Some(mid) = sma_mid {
            if close > mid {
                technical += 10.0;
            } else if close < mid {
                technical -= 10.0;
            }
            if let Some(fast) = sma_fast {
                if fast > mid {
                    technical += 10.0;
                } else if fast < mid {
                    technical -= 10.0;
                }
            }
            if let Some(slow) = sma_slow {
                if mid > slow {
                    technical += 10.0;
                } else if mid < slow {
                    technical -= 10.0;
                }
            }
        }
        if let (Some(macd), Some(signal)) = (at(CH_MACD), at(CH_MACD_SIGNAL)) {
            if macd > signal {
                technical += 10.0;
            } else if macd < signal {
                technical -= 10.0;
            }
            if macd > 0.0 {
                technical += 5.0;
            }
        }
        if let (Some(upper), Some(middle), Some(lower)) =
            (at(CH_BB_UPPER), at(CH_BB_MIDDLE), at(CH_BB_LOWER))
        {
            if close > middle && close <= upper {
                technical += 5.0;
            } else if close < lower {
                technical -= 10.0;
            }
        }

        let mut momentum = 50.0;
        let roc = at(CH_ROC);
        if let Some(roc) = roc {
            momentum += (roc * 3.0).clamp(-25.0, 25.0);
        }
        let rsi = at(CH_RSI);
        if let Some(rsi) = rsi {
            momentum += match rsi {
                r if r > 70.0 => 5.0,
                r if r > 55.0 => 15.0,
                r if r >= 45.0 => 0.0,
                r if r >= 30.0 => -5.0,
                _ => -15.0,
            };
        }
        if let (Some(ratio), Some(roc)) = (at(CH_VOLUME_RATIO), roc) {
            if ratio > 1.5 && roc > 0.0 {
                momentum += 10.0;
            }
        }

        let mut risk = 20.0;
        if let Some(atr) = at(CH_ATR) {
            if close > 0.0 {
                risk += (atr / close * 1000.0).clamp(0.0, 50.0);
            }
        }
        if let Some(rsi) = rsi {
            if rsi > 80.0 {
                risk += 15.0;
            } else if rsi < 20.0 {
                risk += 10.0;
            }
        }
        if let (Some(upper), Some(lower)) = (at(CH_BB_UPPER), at(CH_BB_LOWER)) {
            if close > upper {
                risk += 15.0;
            } else if close < lower {
                risk += 10.0;
            }
        }

        Self::new(technical, momentum, risk)
    }

    pub fn latest(bars: &[Bar], indicators: &IndicatorSeries) -> Self {
        Self::from_indicators(bars, indicators, bars.len().saturating_sub(1))
    }
}
