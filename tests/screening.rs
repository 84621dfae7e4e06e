mod common;

use common::*;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tradecycle::provider::{InMemoryProvider, PriceSeriesProvider};
use tradecycle::{evaluate_universe, EngineConfig, EngineError, ScreeningCoordinator, StrategyRegistry};

fn ids(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

fn uptrend() -> Vec<Bar> {
    ranged_bars(&rising_closes(60, 20.0, 0.4))
}

fn coordinator(provider: Arc<dyn PriceSeriesProvider>, config: EngineConfig) -> ScreeningCoordinator {
    ScreeningCoordinator::new(Arc::new(StrategyRegistry::with_builtin()), provider, config)
        .with_today(day(200))
}

#[test]
fn bad_instruments_are_skipped_and_the_rest_reported() {
    init_test_logging();
    let mut broken = uptrend();
    broken[10].date = broken[9].date;
    let provider = InMemoryProvider::new()
        .with_series("UP", uptrend())
        .with_series("FLAT", exact_bars(&vec![10.0; 60]))
        .with_series("BROKEN", broken);
    let coordinator = coordinator(Arc::new(provider), EngineConfig::default());

    let report = coordinator.evaluate_universe(
        &ids(&["UP", "BROKEN", "MISSING", "FLAT"]),
        &ids(&["rising_trend", "ma_crossover", "no_such_strategy"]),
    );

    assert_eq!(report.unknown_strategies, ids(&["no_such_strategy"]));
    let skipped: Vec<&str> = report.skipped.iter().map(|s| s.instrument_id.as_str()).collect();
    assert_eq!(skipped.len(), 2);
    assert!(skipped.contains(&"BROKEN"));
    assert!(skipped.contains(&"MISSING"));
    assert!(report.results.iter().all(|r| r.instrument_id == "UP"));
    assert!(report
        .results
        .iter()
        .any(|r| r.strategy_id == "rising_trend" && r.backtest_summary.is_some()));
    assert!(report.unfinished.is_empty());
    assert!(!report.cancelled && !report.hard_timed_out);
}

#[test]
fn panicking_provider_does_not_take_down_the_batch() {
    init_test_logging();
    let bars = uptrend();
    let provider: Arc<dyn PriceSeriesProvider> = Arc::new(move |id: &str| -> Result<Vec<Bar>, EngineError> {
        if id == "BOOM" {
            panic!("provider exploded");
        }
        Ok(bars.clone())
    });
    let config = EngineConfig {
        screening: tradecycle::config::ScreeningConfig {
            max_workers: 1,
            ..Default::default()
        },
        ..EngineConfig::default()
    };
    let report = coordinator(provider, config)
        .evaluate_universe(&ids(&["A", "BOOM", "B"]), &ids(&["rising_trend"]));

    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].instrument_id, "BOOM");
    let instruments: Vec<&str> = report.results.iter().map(|r| r.instrument_id.as_str()).collect();
    assert_eq!(instruments, vec!["A", "B"]);
}

#[test]
fn stop_handle_cancels_the_batch() {
    init_test_logging();
    let provider = InMemoryProvider::new().with_series("UP", uptrend());
    let coordinator = coordinator(Arc::new(provider), EngineConfig::default());
    coordinator.stop_handle().stop();

    let report = coordinator.evaluate_universe(&ids(&["UP"]), &ids(&["rising_trend"]));
    assert!(report.cancelled);
    assert!(report.results.is_empty());
    assert_eq!(report.unfinished, ids(&["UP"]));
}

#[test]
fn hard_timeout_returns_partial_results() {
    init_test_logging();
    let bars = uptrend();
    let provider: Arc<dyn PriceSeriesProvider> = Arc::new(move |id: &str| -> Result<Vec<Bar>, EngineError> {
        if id == "SLOW" {
            thread::sleep(Duration::from_millis(3_000));
        }
        Ok(bars.clone())
    });
    let config = EngineConfig {
        screening: tradecycle::config::ScreeningConfig {
            max_workers: 2,
            hard_timeout_ms: 500,
            ..Default::default()
        },
        ..EngineConfig::default()
    };
    let report = coordinator(provider, config)
        .evaluate_universe(&ids(&["SLOW", "FAST"]), &ids(&["rising_trend"]));

    assert!(report.hard_timed_out);
    assert_eq!(report.unfinished, ids(&["SLOW"]));
    assert!(report.results.iter().all(|r| r.instrument_id == "FAST"));
}

#[test]
fn each_instrument_is_loaded_once_for_all_strategies() {
    init_test_logging();
    let loads = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&loads);
    let mut series = HashMap::new();
    series.insert("UP".to_string(), uptrend());
    series.insert("DOWN".to_string(), ranged_bars(&rising_closes(60, 60.0, -0.5)));
    let provider: Arc<dyn PriceSeriesProvider> = Arc::new(move |id: &str| -> Result<Vec<Bar>, EngineError> {
        counter.fetch_add(1, Ordering::SeqCst);
        series.get(id).cloned().ok_or_else(|| EngineError::Data {
            instrument_id: id.to_string(),
            reason: "unknown".to_string(),
        })
    });

    let registry = StrategyRegistry::with_builtin();
    let results = evaluate_universe(
        &ids(&["UP", "DOWN"]),
        &registry.ids(),
        &EngineConfig::default(),
        provider,
    );
    assert_eq!(loads.load(Ordering::SeqCst), 2);
    let mut sorted = results.clone();
    sorted.sort_by(|a, b| {
        (a.instrument_id.as_str(), a.strategy_id.as_str())
            .cmp(&(b.instrument_id.as_str(), b.strategy_id.as_str()))
    });
    assert_eq!(results, sorted);
}

#[test]
fn slow_load_trips_the_soft_timeout_without_failing_the_batch() {
    init_test_logging();
    let bars = uptrend();
    let provider: Arc<dyn PriceSeriesProvider> = Arc::new(move |id: &str| -> Result<Vec<Bar>, EngineError> {
        if id == "SLUGGISH" {
            thread::sleep(Duration::from_millis(200));
        }
        Ok(bars.clone())
    });
    let config = EngineConfig {
        screening: tradecycle::config::ScreeningConfig {
            max_workers: 2,
            soft_timeout_ms: 100,
            ..Default::default()
        },
        ..EngineConfig::default()
    };
    let report = coordinator(provider, config).evaluate_universe(
        &ids(&["SLUGGISH", "QUICK"]),
        &ids(&["rising_trend", "ma_crossover", "macd_stage"]),
    );

    assert_eq!(report.soft_timeouts, ids(&["SLUGGISH"]));
    assert!(report.unfinished.is_empty());
    assert!(!report.hard_timed_out && !report.cancelled);
    assert!(report.results.iter().all(|r| r.instrument_id == "QUICK"));
    assert!(report.results.iter().any(|r| r.strategy_id == "rising_trend"));
}
