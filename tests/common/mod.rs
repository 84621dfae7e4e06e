#![allow(dead_code)]

use chrono::{Duration, NaiveDate};
use std::sync::Once;
pub use tradecycle::models::Bar;

pub fn init_test_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

pub fn day(n: usize) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, 1).unwrap() + Duration::days(n as i64)
}

/// Bars whose open, high, low and close all equal the given close.
pub fn exact_bars(closes: &[f64]) -> Vec<Bar> {
    closes
        .iter()
        .enumerate()
        .map(|(i, &close)| Bar::new(day(i), close, close, close, close, 10_000.0))
        .collect()
}

/// Bars with a one-percent range either side of the close.
pub fn ranged_bars(closes: &[f64]) -> Vec<Bar> {
    closes
        .iter()
        .enumerate()
        .map(|(i, &close)| Bar::new(day(i), close, close * 1.01, close * 0.99, close, 10_000.0))
        .collect()
}

pub fn rising_closes(n: usize, start: f64, step: f64) -> Vec<f64> {
    (0..n).map(|i| start + step * i as f64).collect()
}

/// Seeded random walk that stays positive.
pub fn random_walk(seed: u64, n: usize, start: f64) -> Vec<Bar> {
    let mut rng = fastrand::Rng::with_seed(seed);
    let mut close = start;
    let mut closes = Vec::with_capacity(n);
    for _ in 0..n {
        let change = (rng.f64() - 0.5) * 0.06;
        close = (close * (1.0 + change)).max(1.0);
        closes.push(close);
    }
    ranged_bars(&closes)
}
