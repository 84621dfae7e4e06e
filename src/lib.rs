pub mod analysis;
pub mod cache;
pub mod config;
pub mod cycles;
pub mod error;
pub mod indicators;
pub mod models;
pub mod optimizer;
pub mod param_utils;
pub mod positions;
pub mod provider;
pub mod scoring;
pub mod screening;
pub mod simulator;
pub mod strategy;
pub mod strategy_utils;

pub use analysis::{get_deep_analysis, DeepAnalysis};
pub use config::EngineConfig;
pub use error::EngineError;
pub use screening::{evaluate_universe, ScreeningCoordinator, StopHandle};
pub use simulator::{run_backtest, BacktestReport};
pub use strategy::{Strategy, StrategyRegistry};

/// Install the env_logger backend once; later calls are no-ops.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init();
}
