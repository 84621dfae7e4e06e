use crate::error::EngineError;
use crate::models::Bar;
use std::collections::BTreeMap;

/// Source of date-ascending bar sequences, one per instrument.
pub trait PriceSeriesProvider: Send + Sync {
    fn load_bars(&self, instrument_id: &str) -> Result<Vec<Bar>, EngineError>;

    fn instruments(&self) -> Vec<String> {
        Vec::new()
    }
}

impl<F> PriceSeriesProvider for F
where
    F: Fn(&str) -> Result<Vec<Bar>, EngineError> + Send + Sync,
{
    fn load_bars(&self, instrument_id: &str) -> Result<Vec<Bar>, EngineError> {
        self(instrument_id)
    }
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryProvider {
    series: BTreeMap<String, Vec<Bar>>,
}

impl InMemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_series(mut self, instrument_id: &str, bars: Vec<Bar>) -> Self {
        self.insert(instrument_id, bars);
        self
    }

    pub fn insert(&mut self, instrument_id: &str, bars: Vec<Bar>) {
        self.series.insert(instrument_id.to_string(), bars);
    }
}

impl PriceSeriesProvider for InMemoryProvider {
    fn load_bars(&self, instrument_id: &str) -> Result<Vec<Bar>, EngineError> {
        let bars = self
            .series
            .get(instrument_id)
            .cloned()
            .ok_or_else(|| EngineError::Data {
                instrument_id: instrument_id.to_string(),
                reason: "no price series".to_string(),
            })?;
        validate_bars(instrument_id, &bars)?;
        Ok(bars)
    }

    fn instruments(&self) -> Vec<String> {
        self.series.keys().cloned().collect()
    }
}

/// Ascending unique dates, finite positive prices, non-negative volume.
pub fn validate_bars(instrument_id: &str, bars: &[Bar]) -> Result<(), EngineError> {
    let bad = |reason: String| EngineError::Data {
        instrument_id: instrument_id.to_string(),
        reason,
    };

    for (idx, bar) in bars.iter().enumerate() {
        let prices = [bar.open, bar.high, bar.low, bar.close];
        if prices.iter().any(|p| !p.is_finite() || *p <= 0.0) {
            return Err(bad(format!("bar {} ({}) has a non-positive price", idx, bar.date)));
        }
        if bar.high < bar.low {
            return Err(bad(format!("bar {} ({}) has high below low", idx, bar.date)));
        }
        if !bar.volume.is_finite() || bar.volume < 0.0 {
            return Err(bad(format!("bar {} ({}) has invalid volume", idx, bar.date)));
        }
        if idx > 0 && bar.date <= bars[idx - 1].date {
            return Err(bad(format!(
                "bar {} ({}) is not after {}",
                idx,
                bar.date,
                bars[idx - 1].date
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::flat_bars;

    #[test]
    fn in_memory_provider_serves_valid_series() {
        let provider = InMemoryProvider::new().with_series("AAA", flat_bars(5, 10.0));
        assert_eq!(provider.load_bars("AAA").unwrap().len(), 5);
        assert_eq!(provider.instruments(), vec!["AAA"]);
        assert!(provider.load_bars("ZZZ").unwrap_err().is_data_error());
    }

    #[test]
    fn duplicate_dates_are_rejected() {
        let mut bars = flat_bars(3, 10.0);
        bars[2].date = bars[1].date;
        let err = validate_bars("AAA", &bars).unwrap_err();
        assert!(err.to_string().contains("is not after"));
    }

    #[test]
    fn non_positive_prices_are_rejected() {
        let mut bars = flat_bars(3, 10.0);
        bars[1].low = 0.0;
        assert!(validate_bars("AAA", &bars).is_err());
    }

    #[test]
    fn closures_act_as_providers() {
        let provider = |id: &str| -> Result<Vec<Bar>, EngineError> {
            if id == "AAA" {
                Ok(flat_bars(2, 1.0))
            } else {
                Err(EngineError::Data {
                    instrument_id: id.to_string(),
                    reason: "offline".to_string(),
                })
            }
        };
        assert_eq!(provider.load_bars("AAA").unwrap().len(), 2);
        assert!(provider.load_bars("BBB").is_err());
    }
}
