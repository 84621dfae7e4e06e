use crate::cache::{CacheEntry, CacheKey, ResultCache};
use crate::config::EngineConfig;
use crate::indicators::{compute_indicators, IndicatorSeries};
use crate::models::{Bar, ScreeningResult, SignalState};
use crate::optimizer::OptimizationReport;
use crate::provider::{validate_bars, PriceSeriesProvider};
use crate::simulator::{run_backtest_for, BacktestReport};
use crate::strategy::StrategyRegistry;
use anyhow::{Context, Result};
use chrono::NaiveDate;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const RESULT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Cooperative cancellation flag shared between the caller and the workers.
///
/// A stop applies to the batch running when it is raised, or to the next one
/// if none is running. The coordinator clears it once that batch has been
/// cancelled.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Unit of work handed to a worker. Everything a worker needs travels by value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreeningTask {
    pub instrument_id: String,
    pub strategy_ids: Vec<String>,
    pub config: EngineConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyFailure {
    pub instrument_id: String,
    pub strategy_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedInstrument {
    pub instrument_id: String,
    pub reason: String,
}

/// What one worker returns for one instrument.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstrumentReport {
    pub instrument_id: String,
    pub results: Vec<ScreeningResult>,
    pub skipped: Option<String>,
    pub strategy_errors: Vec<StrategyFailure>,
    pub soft_timed_out: bool,
}

impl InstrumentReport {
    fn skipped(instrument_id: &str, reason: String) -> Self {
        Self {
            instrument_id: instrument_id.to_string(),
            skipped: Some(reason),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScreeningReport {
    pub results: Vec<ScreeningResult>,
    pub skipped: Vec<SkippedInstrument>,
    pub strategy_errors: Vec<StrategyFailure>,
    pub unknown_strategies: Vec<String>,
    /// Instruments cut short by the per-instrument soft timeout.
    pub soft_timeouts: Vec<String>,
    /// Instruments never reported because the batch was stopped or timed out.
    pub unfinished: Vec<String>,
    pub cancelled: bool,
    pub hard_timed_out: bool,
}

/// Fans strategy evaluation out over a universe of instruments.
#[derive(Clone)]
pub struct ScreeningCoordinator {
    registry: Arc<StrategyRegistry>,
    provider: Arc<dyn PriceSeriesProvider>,
    config: Arc<EngineConfig>,
    backtests: ResultCache<BacktestReport>,
    optimizations: ResultCache<OptimizationReport>,
    stop: StopHandle,
    /// Trading day for cache invalidation; `None` follows the local clock.
    pinned_today: Option<NaiveDate>,
}

impl ScreeningCoordinator {
    pub fn new(
        registry: Arc<StrategyRegistry>,
        provider: Arc<dyn PriceSeriesProvider>,
        config: EngineConfig,
    ) -> Self {
        Self {
            registry,
            provider,
            config: Arc::new(config),
            backtests: ResultCache::new(),
            optimizations: ResultCache::new(),
            stop: StopHandle::new(),
            pinned_today: None,
        }
    }

    /// Pin the trading day used for cache invalidation.
    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.pinned_today = Some(today);
        self
    }

    pub fn today(&self) -> NaiveDate {
        self.pinned_today
            .unwrap_or_else(|| chrono::Local::now().date_naive())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &StrategyRegistry {
        &self.registry
    }

    pub fn provider(&self) -> &dyn PriceSeriesProvider {
        self.provider.as_ref()
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn backtest_cache(&self) -> &ResultCache<BacktestReport> {
        &self.backtests
    }

    pub fn optimization_cache(&self) -> &ResultCache<OptimizationReport> {
        &self.optimizations
    }

    /// Drop cache entries stored before today from both caches.
    pub fn purge_expired(&self) -> usize {
        let today = self.today();
        let purged = self.backtests.purge_stale(today) + self.optimizations.purge_stale(today);
        if purged > 0 {
            debug!("Purged {} cache entries older than {}", purged, today);
        }
        purged
    }

    fn worker_count(&self, universe: usize) -> usize {
        let cores = std::cmp::max(1, num_cpus::get());
        let bound = match self.config.screening.max_workers {
            0 => cores,
            configured => configured,
        };
        std::cmp::min(universe, bound).max(1)
    }

    /// Load, validate and compute indicators once for an instrument.
    pub fn prepare(&self, instrument_id: &str, config: &EngineConfig) -> Result<(Vec<Bar>, IndicatorSeries)> {
        let bars = self
            .provider
            .load_bars(instrument_id)
            .with_context(|| format!("loading price series for {}", instrument_id))?;
        validate_bars(instrument_id, &bars)
            .with_context(|| format!("validating price series for {}", instrument_id))?;
        let indicators = compute_indicators(&bars, &config.indicators)
            .with_context(|| format!("computing indicators for {}", instrument_id))?;
        Ok((bars, indicators))
    }

    /// Backtest one strategy's signals on one instrument, cached per trading day.
    pub fn cached_backtest(
        &self,
        instrument_id: &str,
        strategy_id: &str,
        bars: &[Bar],
        signals: &[SignalState],
        config: &EngineConfig,
    ) -> Result<Arc<CacheEntry<BacktestReport>>> {
        let as_of = bars
            .last()
            .map(|bar| bar.date)
            .context("cannot backtest an empty series")?;
        let key = CacheKey::new(instrument_id, strategy_id, as_of);
        let entry = self.backtests.get_or_try_insert_with(key, self.today(), || {
            run_backtest_for(strategy_id, bars, signals, &config.simulation)
        })?;
        Ok(entry)
    }

    /// Evaluate every requested strategy on one instrument. Never panics on bad
    /// data: failures become a skip reason or per-strategy errors.
    pub fn screen_instrument(&self, task: &ScreeningTask, batch_stop: &StopHandle) -> InstrumentReport {
        let started = Instant::now();
        let config = &task.config;
        let instrument_id = task.instrument_id.as_str();

        let (bars, indicators) = match self.prepare(instrument_id, config) {
            Ok(prepared) => prepared,
            Err(e) => {
                warn!("Skipping {}: {:#}", instrument_id, e);
                return InstrumentReport::skipped(instrument_id, format!("{:#}", e));
            }
        };

        let mut report = InstrumentReport {
            instrument_id: instrument_id.to_string(),
            ..InstrumentReport::default()
        };
        let soft_timeout = config.screening.soft_timeout();
        let recency = config.screening.signal_recency_bars.max(1);

        if started.elapsed() > soft_timeout {
            warn!(
                "{}: soft timeout of {:?} exceeded while loading, no strategies evaluated",
                instrument_id, soft_timeout
            );
            report.soft_timed_out = true;
            return report;
        }

        let mut evaluated_count = 0usize;
        for strategy_id in &task.strategy_ids {
            if self.stop.is_stopped() || batch_stop.is_stopped() {
                debug!("{}: stop requested, abandoning remaining strategies", instrument_id);
                break;
            }
            if started.elapsed() > soft_timeout {
                warn!(
                    "{}: soft timeout of {:?} exceeded, {} of {} strategies evaluated",
                    instrument_id,
                    soft_timeout,
                    evaluated_count,
                    task.strategy_ids.len()
                );
                report.soft_timed_out = true;
                break;
            }

            let evaluated = self.registry.get(strategy_id).and_then(|strategy| {
                let params = self.registry.resolve_params(strategy_id, config)?;
                strategy.evaluate(&bars, &indicators, &params)
            });
            evaluated_count += 1;
            let evaluation = match evaluated {
                Ok(evaluation) => evaluation,
                Err(e) => {
                    warn!("{} on {} failed: {}", strategy_id, instrument_id, e);
                    report.strategy_errors.push(StrategyFailure {
                        instrument_id: instrument_id.to_string(),
                        strategy_id: strategy_id.clone(),
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            let from = bars.len().saturating_sub(recency);
            let Some((signal_index, signal_state)) = evaluation.latest_signal_since(from) else {
                continue;
            };

            let backtest_summary = if config.screening.attach_backtest {
                match self.cached_backtest(
                    instrument_id,
                    strategy_id,
                    &bars,
                    &evaluation.signals,
                    config,
                ) {
                    Ok(entry) => Some(entry.value.summary()),
                    Err(e) => {
                        warn!("Backtest of {} on {} failed: {:#}", strategy_id, instrument_id, e);
                        None
                    }
                }
            } else {
                None
            };

            let bar = &bars[signal_index];
            report.results.push(ScreeningResult {
                instrument_id: instrument_id.to_string(),
                strategy_id: strategy_id.clone(),
                signal_date: bar.date,
                signal_price: bar.close,
                signal_state,
                backtest_summary,
            });
        }

        report
    }

    /// Screen the universe in parallel. Result order is by instrument then strategy.
    pub fn evaluate_universe(&self, instrument_ids: &[String], strategy_ids: &[String]) -> ScreeningReport {
        let mut report = ScreeningReport::default();
        self.purge_expired();

        let mut known = Vec::with_capacity(strategy_ids.len());
        for strategy_id in strategy_ids {
            match self.registry.get(strategy_id) {
                Ok(_) => known.push(strategy_id.clone()),
                Err(e) => {
                    warn!("Ignoring strategy: {}", e);
                    report.unknown_strategies.push(strategy_id.clone());
                }
            }
        }
        if instrument_ids.is_empty() || known.is_empty() {
            info!("Nothing to screen");
            return report;
        }

        let universe = instrument_ids.len();
        let num_workers = self.worker_count(universe);
        info!(
            "Screening {} instruments with {} strategies on {} worker threads",
            universe,
            known.len(),
            num_workers
        );

        let (tx, rx): (Sender<ScreeningTask>, Receiver<ScreeningTask>) = bounded(universe);
        let (result_tx, result_rx): (Sender<InstrumentReport>, Receiver<InstrumentReport>) =
            bounded(universe);
        let batch_stop = StopHandle::new();

        let mut handles = Vec::with_capacity(num_workers);
        for worker_id in 0..num_workers {
            let rx = rx.clone();
            let result_tx = result_tx.clone();
            let coordinator = self.clone();
            let batch_stop = batch_stop.clone();

            let handle = thread::spawn(move || {
                while let Ok(task) = rx.recv() {
                    if coordinator.stop.is_stopped() || batch_stop.is_stopped() {
                        break;
                    }
                    let instrument_id = task.instrument_id.clone();
                    let outcome = catch_unwind(AssertUnwindSafe(|| {
                        coordinator.screen_instrument(&task, &batch_stop)
                    }));
                    let instrument_report = outcome.unwrap_or_else(|_| {
                        warn!("Worker {} panicked on {}", worker_id, instrument_id);
                        InstrumentReport::skipped(&instrument_id, "worker panicked".to_string())
                    });
                    if result_tx.send(instrument_report).is_err() {
                        break;
                    }
                }
            });
            handles.push(handle);
        }
        drop(result_tx);

        for instrument_id in instrument_ids {
            let task = ScreeningTask {
                instrument_id: instrument_id.clone(),
                strategy_ids: known.clone(),
                config: self.config.as_ref().clone(),
            };
            if tx.send(task).is_err() {
                warn!("All workers exited before dispatch finished");
                break;
            }
        }
        drop(tx);

        let pb = if self.config.screening.show_progress {
            ProgressBar::new(universe as u64)
        } else {
            ProgressBar::hidden()
        };
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
        {
            pb.set_style(style.progress_chars("#>-"));
        }

        let deadline = Instant::now() + self.config.screening.hard_timeout();
        let mut reported = HashSet::with_capacity(universe);
        let mut received = 0usize;
        while received < universe {
            if self.stop.is_stopped() {
                warn!("Screening stopped with {} of {} instruments done", received, universe);
                report.cancelled = true;
                break;
            }
            if Instant::now() >= deadline {
                warn!(
                    "Screening hit the hard timeout with {} of {} instruments done",
                    received,
                    universe
                );
                report.hard_timed_out = true;
                break;
            }
            match result_rx.recv_timeout(RESULT_POLL_INTERVAL) {
                Ok(instrument_report) => {
                    received += 1;
                    reported.insert(instrument_report.instrument_id.clone());
                    pb.set_position(received as u64);
                    Self::merge(&mut report, instrument_report);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    warn!("Result channel closed unexpectedly. Some results may be lost.");
                    break;
                }
            }
        }

        if report.cancelled || report.hard_timed_out {
            batch_stop.stop();
            pb.abandon_with_message("Screening interrupted");
            // In-flight workers are abandoned; they exit once their current instrument ends.
            drop(handles);
        } else {
            pb.finish_with_message("Screening completed");
            for handle in handles {
                if handle.join().is_err() {
                    warn!("A screening worker thread terminated abnormally");
                }
            }
        }
        if report.cancelled {
            // The stop was consumed by this batch; abandoned workers still see `batch_stop`.
            self.stop.reset();
        }

        report.unfinished = instrument_ids
            .iter()
            .filter(|id| !reported.contains(*id))
            .cloned()
            .collect();
        report.results.sort_by(|a, b| {
            (a.instrument_id.as_str(), a.strategy_id.as_str())
                .cmp(&(b.instrument_id.as_str(), b.strategy_id.as_str()))
        });

        info!(
            "Screening finished: {} signals, {} skipped, {} strategy errors, {} unfinished",
            report.results.len(),
            report.skipped.len(),
            report.strategy_errors.len(),
            report.unfinished.len()
        );
        report
    }

    fn merge(report: &mut ScreeningReport, instrument_report: InstrumentReport) {
        let InstrumentReport {
            instrument_id,
            results,
            skipped,
            strategy_errors,
            soft_timed_out,
        } = instrument_report;
        if let Some(reason) = skipped {
            report.skipped.push(SkippedInstrument {
                instrument_id: instrument_id.clone(),
                reason,
            });
        }
        if soft_timed_out {
            report.soft_timeouts.push(instrument_id);
        }
        report.results.extend(results);
        report.strategy_errors.extend(strategy_errors);
    }
}

/// Screen `instrument_ids` with the built-in strategies and return the signals found.
pub fn evaluate_universe(
    instrument_ids: &[String],
    strategy_ids: &[String],
    config: &EngineConfig,
    provider: Arc<dyn PriceSeriesProvider>,
) -> Vec<ScreeningResult> {
    let coordinator = ScreeningCoordinator::new(
        Arc::new(StrategyRegistry::with_builtin()),
        provider,
        config.clone(),
    );
    coordinator.evaluate_universe(instrument_ids, strategy_ids).results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::indicators::IndicatorSeries;
    use crate::models::StrategyParams;
    use crate::provider::InMemoryProvider;
    use crate::strategy::{Strategy, StrategyEvaluation};
    use crate::test_support::{flat_bars, rising_bars, start_date};

    /// Flags the last bar after sleeping for `delay`.
    struct SlowStrategy {
        id: &'static str,
        delay: Duration,
    }

    impl Strategy for SlowStrategy {
        fn strategy_id(&self) -> &str {
            self.id
        }

        fn name(&self) -> &str {
            "Slow"
        }

        fn default_params(&self) -> StrategyParams {
            StrategyParams::new()
        }

        fn required_minimum_bars(&self, _params: &StrategyParams) -> usize {
            1
        }

        fn generate(
            &self,
            bars: &[Bar],
            _indicators: &IndicatorSeries,
            _params: &StrategyParams,
        ) -> Result<StrategyEvaluation, EngineError> {
            thread::sleep(self.delay);
            let mut evaluation = StrategyEvaluation::empty(bars.len());
            if let Some(last) = evaluation.signals.last_mut() {
                *last = SignalState::Flag;
            }
            Ok(evaluation)
        }
    }

    fn coordinator(provider: InMemoryProvider) -> ScreeningCoordinator {
        ScreeningCoordinator::new(
            Arc::new(StrategyRegistry::with_builtin()),
            Arc::new(provider),
            EngineConfig::default(),
        )
        .with_today(NaiveDate::from_ymd_opt(2024, 6, 1).unwrap())
    }

    fn task(instrument_id: &str, strategies: &[&str]) -> ScreeningTask {
        ScreeningTask {
            instrument_id: instrument_id.to_string(),
            strategy_ids: strategies.iter().map(|s| s.to_string()).collect(),
            config: EngineConfig::default(),
        }
    }

    #[test]
    fn screen_instrument_reports_recent_signal_with_backtest() {
        let provider = InMemoryProvider::new().with_series("UP", rising_bars(60, 10.0, 0.01));
        let coordinator = coordinator(provider);
        let report = coordinator.screen_instrument(&task("UP", &["rising_trend"]), &StopHandle::new());
        assert_eq!(report.results.len(), 1);
        let result = &report.results[0];
        assert_eq!(result.signal_state, SignalState::Flag);
        assert_eq!(result.strategy_id, "rising_trend");
        let summary = result.backtest_summary.as_ref().unwrap();
        assert!(summary.trades >= 1);
        assert_eq!(summary.win_rate, 1.0);
        assert_eq!(coordinator.backtest_cache().len(), 1);
    }

    #[test]
    fn missing_series_is_skipped_not_fatal() {
        let coordinator = coordinator(InMemoryProvider::new());
        let report = coordinator.screen_instrument(&task("NOPE", &["rising_trend"]), &StopHandle::new());
        assert!(report.results.is_empty());
        assert!(report.skipped.unwrap().contains("NOPE"));
    }

    #[test]
    fn quiet_instrument_produces_no_results() {
        let provider = InMemoryProvider::new().with_series("FLAT", flat_bars(50, 10.0));
        let coordinator = coordinator(provider);
        let report = coordinator.screen_instrument(
            &task("FLAT", &["ma_crossover", "rising_trend"]),
            &StopHandle::new(),
        );
        assert!(report.results.is_empty());
        assert!(report.strategy_errors.is_empty());
    }

    #[test]
    fn stopped_handle_skips_strategies() {
        let provider = InMemoryProvider::new().with_series("UP", rising_bars(60, 10.0, 0.01));
        let coordinator = coordinator(provider);
        let stop = StopHandle::new();
        stop.stop();
        let report = coordinator.screen_instrument(&task("UP", &["rising_trend"]), &stop);
        assert!(report.results.is_empty());
    }

    #[test]
    fn soft_timeout_stops_between_strategies() {
        let mut registry = StrategyRegistry::new();
        for id in ["slow_a", "slow_b", "slow_c"] {
            registry.register(Arc::new(SlowStrategy {
                id,
                delay: Duration::from_millis(150),
            }));
        }
        let mut config = EngineConfig::default();
        config.screening.soft_timeout_ms = 50;
        let provider = InMemoryProvider::new().with_series("UP", rising_bars(30, 10.0, 0.01));
        let coordinator = ScreeningCoordinator::new(Arc::new(registry), Arc::new(provider), config.clone())
            .with_today(start_date());

        let report = coordinator.screen_instrument(
            &ScreeningTask {
                instrument_id: "UP".to_string(),
                strategy_ids: vec!["slow_a".into(), "slow_b".into(), "slow_c".into()],
                config,
            },
            &StopHandle::new(),
        );
        assert!(report.soft_timed_out);
        assert_eq!(report.results.len(), 1);
        assert_eq!(report.results[0].strategy_id, "slow_a");
    }

    #[test]
    fn expired_cache_days_are_reclaimed() {
        let base = coordinator(InMemoryProvider::new());
        let config = EngineConfig::default();
        for d in 0..20 {
            let today = start_date() + chrono::Duration::days(d);
            let day_coordinator = base.clone().with_today(today);
            day_coordinator.purge_expired();
            let bars = flat_bars(10 + d as usize, 10.0);
            let signals = vec![SignalState::Empty; bars.len()];
            day_coordinator
                .cached_backtest("AAA", "rising_trend", &bars, &signals, &config)
                .unwrap();
            assert_eq!(base.backtest_cache().len(), 1, "day {}", d);
        }
    }

    #[test]
    fn new_batch_purges_entries_from_earlier_days() {
        let yesterday = coordinator(InMemoryProvider::new()).with_today(start_date());
        let bars = flat_bars(10, 10.0);
        let signals = vec![SignalState::Empty; 10];
        yesterday
            .cached_backtest("AAA", "rising_trend", &bars, &signals, &EngineConfig::default())
            .unwrap();
        assert_eq!(yesterday.backtest_cache().len(), 1);

        let today = yesterday.clone().with_today(start_date() + chrono::Duration::days(1));
        today.evaluate_universe(&[], &[]);
        assert!(today.backtest_cache().is_empty());
    }

    #[test]
    fn unpinned_coordinator_follows_the_clock() {
        let coordinator = ScreeningCoordinator::new(
            Arc::new(StrategyRegistry::with_builtin()),
            Arc::new(InMemoryProvider::new()),
            EngineConfig::default(),
        );
        let before = chrono::Local::now().date_naive();
        let today = coordinator.today();
        assert!(today >= before && today <= chrono::Local::now().date_naive());
    }

    #[test]
    fn a_stop_cancels_one_batch_only() {
        let provider = InMemoryProvider::new().with_series("UP", rising_bars(60, 10.0, 0.01));
        let coordinator = coordinator(provider);
        let universe = vec!["UP".to_string()];
        let strategies = vec!["rising_trend".to_string()];

        coordinator.stop_handle().stop();
        let cancelled = coordinator.evaluate_universe(&universe, &strategies);
        assert!(cancelled.cancelled);
        assert!(!coordinator.stop_handle().is_stopped());

        let rerun = coordinator.evaluate_universe(&universe, &strategies);
        assert!(!rerun.cancelled);
        assert_eq!(rerun.results.len(), 1);
    }
}
