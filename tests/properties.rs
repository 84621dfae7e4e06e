//! Property tests for engine invariants.
//!
//! 1. Settlement: no SELL executes while a position is unsellable
//! 2. Indicators are deterministic for identical input
//! 3. Simulated trades never peak past the lookahead horizon
//! 4. Short inputs produce an all-empty signal series

mod common;

use common::*;
use proptest::prelude::*;
use tradecycle::config::{DecisionConfig, IndicatorConfig, SimulationConfig};
use tradecycle::indicators::{compute_indicators, IndicatorSeries};
use tradecycle::models::SignalState;
use tradecycle::positions::{Action, Decision, PositionBook, PositionState};
use tradecycle::scoring::DecisionScores;
use tradecycle::simulator::run_backtest;
use tradecycle::{EngineConfig, StrategyRegistry};

#[derive(Debug, Clone)]
enum BookOp {
    Buy(f64),
    Advance(usize),
    SellRequest(f64),
    ForcedSell(f64),
}

fn arb_op() -> impl Strategy<Value = BookOp> {
    prop_oneof![
        (5.0..50.0_f64).prop_map(BookOp::Buy),
        (0usize..3).prop_map(BookOp::Advance),
        (1.0..60.0_f64).prop_map(BookOp::SellRequest),
        (1.0..60.0_f64).prop_map(BookOp::ForcedSell),
    ]
}

fn arb_state() -> impl Strategy<Value = SignalState> {
    prop_oneof![
        6 => Just(SignalState::Empty),
        1 => Just(SignalState::Flag),
        1 => Just(SignalState::Pre),
        1 => Just(SignalState::Mid),
        1 => Just(SignalState::Post),
    ]
}

// ── 1. Settlement ────────────────────────────────────────────────────

proptest! {
    #[test]
    fn no_sell_while_unsellable(ops in prop::collection::vec(arb_op(), 1..60)) {
        let mut book = PositionBook::new(100_000.0, DecisionConfig::default());
        let mut today = 0usize;
        book.advance_to(day(today));
        let strong = DecisionScores::new(90.0, 90.0, 10.0);
        let weak = DecisionScores::new(10.0, 10.0, 90.0);

        for op in ops {
            let before = book.state("AAA");
            match op {
                BookOp::Buy(price) => {
                    let decision = book.decide("AAA", price, &strong);
                    if decision.action == Action::Buy {
                        book.execute(&decision, price).unwrap();
                        prop_assert_eq!(book.state("AAA"), PositionState::HeldUnsellable);
                    }
                }
                BookOp::Advance(days) => {
                    today += days;
                    book.advance_to(day(today));
                }
                BookOp::SellRequest(price) => {
                    let decision = book.request_sell("AAA", price, &weak).unwrap();
                    if before == PositionState::HeldUnsellable {
                        prop_assert_ne!(decision.action, Action::Sell);
                        prop_assert_eq!(book.state("AAA"), PositionState::HeldUnsellable);
                    }
                }
                BookOp::ForcedSell(price) => {
                    let forced = Decision {
                        instrument_id: "AAA".to_string(),
                        date: book.current_date(),
                        action: Action::Sell,
                        reason: "forced".to_string(),
                        position_fraction: 0.0,
                        state: before,
                    };
                    let result = book.execute(&forced, price);
                    if before == PositionState::HeldUnsellable {
                        prop_assert!(result.is_err());
                        prop_assert!(book.position("AAA").is_some());
                    }
                }
            }
            if let Some(position) = book.position("AAA") {
                if position.sellable {
                    prop_assert!(Some(position.entry_date) < book.current_date());
                }
            }
        }
    }
}

// ── 2. Determinism ───────────────────────────────────────────────────

proptest! {
    #[test]
    fn indicators_are_deterministic(seed in any::<u64>(), n in 2usize..120) {
        let bars = random_walk(seed, n, 50.0);
        let config = IndicatorConfig::default();
        let first = compute_indicators(&bars, &config).unwrap();
        let second = compute_indicators(&bars, &config).unwrap();
        prop_assert_eq!(first.len(), n);
        for name in first.channel_names() {
            let a = first.channel(name).unwrap();
            let b = second.channel(name).unwrap();
            let a_bits: Vec<Option<u64>> = a.iter().map(|v| v.map(f64::to_bits)).collect();
            let b_bits: Vec<Option<u64>> = b.iter().map(|v| v.map(f64::to_bits)).collect();
            prop_assert_eq!(a_bits, b_bits, "channel {}", name);
        }
    }
}

// ── 3. Horizon bound ─────────────────────────────────────────────────

proptest! {
    #[test]
    fn days_to_peak_within_horizon(
        seed in any::<u64>(),
        states in prop::collection::vec(arb_state(), 20..120),
        horizon in 1usize..40,
        target in 0.5..15.0_f64,
    ) {
        let bars = random_walk(seed, states.len(), 30.0);
        let config = SimulationConfig {
            max_lookahead_days: horizon,
            profit_target_pct: target,
            ..SimulationConfig::default()
        };
        let report = run_backtest(&bars, &states, &config).unwrap();
        for trade in &report.trades {
            prop_assert!(trade.days_to_peak <= horizon);
            if let Some(exit) = trade.days_to_exit {
                prop_assert!(exit <= horizon);
            }
        }
        prop_assert_eq!(report.trades.len() + report.excluded.len(), report.cycles.len());
    }
}

// ── 4. Short input ───────────────────────────────────────────────────

proptest! {
    #[test]
    fn short_input_yields_empty_series(seed in any::<u64>(), shortfall in 1usize..10) {
        let registry = StrategyRegistry::with_builtin();
        let config = EngineConfig::default();
        for id in registry.ids() {
            let strategy = registry.get(&id).unwrap();
            let params = registry.resolve_params(&id, &config).unwrap();
            let required = strategy.required_minimum_bars(&params);
            let n = required.saturating_sub(shortfall);
            let bars = random_walk(seed, n, 40.0);
            let indicators = compute_indicators(&bars, &config.indicators)
                .unwrap_or_else(|_| IndicatorSeries::new(n));
            let evaluation = strategy.evaluate(&bars, &indicators, &params).unwrap();
            prop_assert_eq!(evaluation.signals.len(), n);
            prop_assert!(evaluation.signals.iter().all(|s| s.is_empty()), "{} signalled", id);
        }
    }
}
