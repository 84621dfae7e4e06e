use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::indicators::IndicatorSeries;
use crate::models::*;
use crate::param_utils::merge_params;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Output of one strategy over one bar sequence.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StrategyEvaluation {
    pub signals: Vec<SignalState>,
    pub detail: Option<Diagnostics>,
    /// Per-bar payloads keyed by bar index.
    #[serde(default)]
    pub notes: BTreeMap<usize, Diagnostics>,
}

impl StrategyEvaluation {
    /// "No opinion": every bar empty, no detail.
    pub fn empty(len: usize) -> Self {
        Self {
            signals: vec![SignalState::Empty; len],
            detail: None,
            notes: BTreeMap::new(),
        }
    }

    pub fn signal_count(&self) -> usize {
        self.signals.iter().filter(|s| !s.is_empty()).count()
    }

    pub fn events(&self, strategy_id: &str) -> Vec<SignalEvent> {
        self.signals
            .iter()
            .enumerate()
            .filter(|(_, state)| !state.is_empty())
            .map(|(bar_index, state)| SignalEvent {
                bar_index,
                state: *state,
                strategy_id: strategy_id.to_string(),
                payload: self.notes.get(&bar_index).cloned().unwrap_or_default(),
            })
            .collect()
    }

    /// Most recent non-empty signal at or after `from_index`.
    pub fn latest_signal_since(&self, from_index: usize) -> Option<(usize, SignalState)> {
        self.signals
            .iter()
            .enumerate()
            .skip(from_index)
            .rev()
            .find(|(_, state)| !state.is_empty())
            .map(|(idx, state)| (idx, *state))
    }
}

pub trait Strategy: Send + Sync {
    fn strategy_id(&self) -> &str;
    fn name(&self) -> &str;
    fn version(&self) -> &str {
        "1"
    }
    fn default_params(&self) -> StrategyParams;
    fn required_minimum_bars(&self, params: &StrategyParams) -> usize;

    /// Implementation hook; only called once the bar count is sufficient.
    fn generate(
        &self,
        bars: &[Bar],
        indicators: &IndicatorSeries,
        params: &StrategyParams,
    ) -> Result<StrategyEvaluation, EngineError>;

    /// Pure evaluation. Short inputs yield an all-empty series, never an error.
    fn evaluate(
        &self,
        bars: &[Bar],
        indicators: &IndicatorSeries,
        params: &StrategyParams,
    ) -> Result<StrategyEvaluation, EngineError> {
        if bars.len() < self.required_minimum_bars(params) {
            return Ok(StrategyEvaluation::empty(bars.len()));
        }
        if indicators.len() != bars.len() {
            return Err(EngineError::Series(format!(
                "{} got {} indicator rows for {} bars",
                self.strategy_id(),
                indicators.len(),
                bars.len()
            )));
        }
        let mut evaluation = self.generate(bars, indicators, params)?;
        evaluation.signals.resize(bars.len(), SignalState::Empty);
        Ok(evaluation)
    }
}

#[path = "strategies/rising_trend.rs"]
pub mod rising_trend;

pub use rising_trend::RisingTrendStrategy;

#[path = "strategies/ma_crossover.rs"]
pub mod ma_crossover;

pub use ma_crossover::MaCrossoverStrategy;

#[path = "strategies/macd_stage.rs"]
pub mod macd_stage;

pub use macd_stage::MacdStageStrategy;

#[path = "strategies/rsi_rebound.rs"]
pub mod rsi_rebound;

pub use rsi_rebound::RsiReboundStrategy;

#[path = "strategies/volume_breakout.rs"]
pub mod volume_breakout;

pub use volume_breakout::VolumeBreakoutStrategy;

pub type SharedStrategy = Arc<dyn Strategy>;

/// Explicit strategy registry, built once and handed to whoever needs it.
#[derive(Clone, Default)]
pub struct StrategyRegistry {
    strategies: BTreeMap<String, SharedStrategy>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(RisingTrendStrategy));
        registry.register(Arc::new(MaCrossoverStrategy));
        registry.register(Arc::new(MacdStageStrategy));
        registry.register(Arc::new(RsiReboundStrategy));
        registry.register(Arc::new(VolumeBreakoutStrategy));
        registry
    }

    pub fn register(&mut self, strategy: SharedStrategy) {
        let id = strategy.strategy_id().to_string();
        if self.strategies.insert(id.clone(), strategy).is_some() {
            log::warn!("Strategy {} registered twice; keeping the latest", id);
        }
    }

    pub fn get(&self, strategy_id: &str) -> Result<SharedStrategy, EngineError> {
        self.strategies
            .get(strategy_id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownStrategy(strategy_id.to_string()))
    }

    pub fn ids(&self) -> Vec<String> {
        self.strategies.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    /// Strategy defaults overlaid with the configured overrides.
    pub fn resolve_params(
        &self,
        strategy_id: &str,
        config: &EngineConfig,
    ) -> Result<StrategyParams, EngineError> {
        let strategy = self.get(strategy_id)?;
        Ok(merge_params(
            &strategy.default_params(),
            config.strategy_overrides(strategy_id),
        ))
    }
}
