mod common;

use common::*;
use tradecycle::config::{DecisionConfig, IndicatorConfig, OptimizerConfig, SimulationConfig, TargetRule};
use tradecycle::indicators::compute_indicators;
use tradecycle::models::{ExitReason, SignalState};
use tradecycle::optimizer::optimize_coefficient;
use tradecycle::positions::{Action, PositionBook, PositionState, T1_RESTRICTION};
use tradecycle::scoring::DecisionScores;
use tradecycle::simulator::run_backtest_for;
use tradecycle::{EngineConfig, StrategyRegistry};

fn signals_for(strategy_id: &str, bars: &[Bar]) -> Vec<SignalState> {
    let registry = StrategyRegistry::with_builtin();
    let strategy = registry.get(strategy_id).unwrap();
    let params = registry
        .resolve_params(strategy_id, &EngineConfig::default())
        .unwrap();
    let indicators = compute_indicators(bars, &IndicatorConfig::default()).unwrap();
    strategy.evaluate(bars, &indicators, &params).unwrap().signals
}

#[test]
fn rising_series_first_cycle_succeeds_quickly() {
    init_test_logging();
    let bars = exact_bars(&rising_closes(40, 100.0, 1.0));
    let signals = signals_for("rising_trend", &bars);
    assert!(signals.iter().any(|s| *s == SignalState::Flag));

    let config = SimulationConfig::default();
    assert_eq!(config.profit_target_pct, 5.0);
    assert_eq!(config.max_lookahead_days, 30);

    let report = run_backtest_for("rising_trend", &bars, &signals, &config).unwrap();
    let first = &report.trades[0];
    assert!(first.success);
    assert_eq!(first.exit_reason, ExitReason::ProfitTarget);
    assert!(first.days_to_peak < 30);
    assert_eq!(report.cycles[0].last_state(), SignalState::Success);
    assert!(report.win_rate > 0.0);
}

#[test]
fn flat_series_emits_no_signals() {
    init_test_logging();
    let bars = exact_bars(&vec![25.0; 50]);
    let registry = StrategyRegistry::with_builtin();
    for id in registry.ids() {
        let signals = signals_for(&id, &bars);
        assert!(
            signals.iter().all(|s| s.is_empty()),
            "{} signalled on a flat series",
            id
        );
    }
}

#[test]
fn sell_is_held_on_entry_day_and_allowed_next_day() {
    init_test_logging();
    let mut book = PositionBook::new(50_000.0, DecisionConfig::default());
    book.advance_to(day(0));
    let buy = book.decide("AAA", 20.0, &DecisionScores::new(85.0, 75.0, 20.0));
    assert_eq!(buy.action, Action::Buy);
    book.execute(&buy, 20.0).unwrap();
    assert_eq!(book.state("AAA"), PositionState::HeldUnsellable);

    // Price below the stop: sell conditions hold on both days.
    let weak = DecisionScores::new(30.0, 30.0, 40.0);
    let same_day = book.request_sell("AAA", 18.5, &weak).unwrap();
    assert_eq!(same_day.action, Action::Hold);
    assert_eq!(same_day.reason, T1_RESTRICTION);
    assert_eq!(book.state("AAA"), PositionState::HeldUnsellable);

    book.advance_to(day(1));
    let next_day = book.request_sell("AAA", 18.5, &weak).unwrap();
    assert_eq!(next_day.action, Action::Sell);
    assert_eq!(book.state("AAA"), PositionState::NoPosition);
}

#[test]
fn optimizer_prefers_highest_return_when_success_ties() {
    init_test_logging();
    let mut closes = vec![100.0; 21];
    closes.extend([95.0, 97.0, 98.0, 99.0, 100.0]);
    let bars = exact_bars(&closes);
    let config = OptimizerConfig {
        grid: vec![0.96, 0.98, 1.00],
        warmup_bars: 20,
        lookahead_days: 5,
        extremum_window: 10,
        target_rule: TargetRule::SupportEntry,
        ..OptimizerConfig::default()
    };

    let report = optimize_coefficient(&bars, &config).unwrap();
    assert!(report.candidates.iter().all(|c| c.scenario_count == 1));
    assert!(report.candidates.iter().all(|c| c.success_rate == 100.0));
    assert_eq!(report.best_coefficient(), Some(0.96));

    let again = optimize_coefficient(&bars, &config).unwrap();
    assert_eq!(report, again);
}
