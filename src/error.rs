use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    #[error("insufficient data: have {available} bars, need {required}")]
    InsufficientData { required: usize, available: usize },

    #[error("bad data for {instrument_id}: {reason}")]
    Data {
        instrument_id: String,
        reason: String,
    },

    /// Malformed input series that is not tied to a named instrument.
    #[error("invalid series: {0}")]
    Series(String),

    #[error("strategy {strategy_id} is missing required parameter `{key}`")]
    StrategyConfig { strategy_id: String, key: String },

    #[error("invalid setting {key}: {reason}")]
    InvalidConfig { key: String, reason: String },

    #[error("unknown strategy: {0}")]
    UnknownStrategy(String),

    #[error("rule violation for {instrument_id}: {reason}")]
    RuleViolation {
        instrument_id: String,
        reason: String,
    },
}

impl EngineError {
    /// Errors that only disqualify the current instrument, never the batch.
    pub fn is_data_error(&self) -> bool {
        matches!(
            self,
            EngineError::InsufficientData { .. }
                | EngineError::Data { .. }
                | EngineError::Series(_)
        )
    }

    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            EngineError::StrategyConfig { .. }
                | EngineError::InvalidConfig { .. }
                | EngineError::UnknownStrategy(_)
        )
    }
}
