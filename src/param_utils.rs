use crate::error::EngineError;
use crate::models::StrategyParams;

/// Extract a parameter as usize with a default value
pub fn get_param_usize(params: &StrategyParams, key: &str, default: usize) -> usize {
    params
        .get(key)
        .copied()
        .filter(|v| v.is_finite() && *v >= 0.0)
        .map(|v| v.round() as usize)
        .unwrap_or(default)
}

/// Extract a parameter as f64 with a default value
pub fn get_param_f64(params: &StrategyParams, key: &str, default: f64) -> f64 {
    params
        .get(key)
        .copied()
        .filter(|v| v.is_finite())
        .unwrap_or(default)
}

/// Extract a parameter as usize with a minimum value
pub fn get_param_usize_at_least(
    params: &StrategyParams,
    key: &str,
    default: usize,
    min: usize,
) -> usize {
    get_param_usize(params, key, default).max(min)
}

/// Extract a parameter as f64, clamped to a range with finite checks
pub fn get_param_f64_clamped(
    params: &StrategyParams,
    key: &str,
    default: f64,
    min: f64,
    max: f64,
) -> f64 {
    get_param_f64(params, key, default).clamp(min, max)
}

/// Fetch a parameter that has no fallback.
pub fn require_param(params: &StrategyParams, strategy_id: &str, key: &str) -> Result<f64, EngineError> {
    params
        .get(key)
        .copied()
        .filter(|v| v.is_finite())
        .ok_or_else(|| EngineError::StrategyConfig {
            strategy_id: strategy_id.to_string(),
            key: key.to_string(),
        })
}

/// Same as [`require_param`], rounded to a period length of at least `min`.
pub fn require_period(
    params: &StrategyParams,
    strategy_id: &str,
    key: &str,
    min: usize,
) -> Result<usize, EngineError> {
    let value = require_param(params, strategy_id, key)?;
    Ok((value.max(0.0).round() as usize).max(min))
}

/// Overlay `overrides` on top of `defaults`.
pub fn merge_params(defaults: &StrategyParams, overrides: Option<&StrategyParams>) -> StrategyParams {
    let mut merged = defaults.clone();
    if let Some(overrides) = overrides {
        for (key, value) in overrides {
            if value.is_finite() {
                merged.insert(key.clone(), *value);
            } else {
                log::warn!("Skipping parameter `{}` due to non-finite value {}", key, value);
            }
        }
    }
    merged
}

pub fn params_from(pairs: &[(&str, f64)]) -> StrategyParams {
    pairs
        .iter()
        .map(|(key, value)| (key.to_string(), *value))
        .collect()
}
