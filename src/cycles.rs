use crate::models::{SignalCycle, SignalEvent, SignalState};
use log::debug;
use std::collections::BTreeMap;

/// Group one strategy's per-bar signal series into cycles.
///
/// `window` is the number of bars after a cycle's first signal during which
/// further signals count as transitions of that cycle.
pub fn group_cycles(strategy_id: &str, signals: &[SignalState], window: usize) -> Vec<SignalCycle> {
    let tagged = signals
        .iter()
        .enumerate()
        .filter(|(_, state)| is_strategy_tag(**state))
        .map(|(idx, state)| (idx, *state));
    group_tagged(strategy_id, tagged, window)
}

/// Group raw events from any number of strategies. Strategies never share a
/// cycle; two events on the same bar for the same strategy collapse to the
/// more severe one.
pub fn classify_events(events: &[SignalEvent], window: usize) -> BTreeMap<String, Vec<SignalCycle>> {
    let mut per_strategy: BTreeMap<&str, BTreeMap<usize, SignalState>> = BTreeMap::new();
    for event in events {
        if !is_strategy_tag(event.state) {
            continue;
        }
        let bars = per_strategy.entry(event.strategy_id.as_str()).or_default();
        bars.entry(event.bar_index)
            .and_modify(|existing| {
                if event.state.severity() > existing.severity() {
                    debug!(
                        "{} bar {}: {} replaces {}",
                        event.strategy_id, event.bar_index, event.state, existing
                    );
                    *existing = event.state;
                }
            })
            .or_insert(event.state);
    }

    per_strategy
        .into_iter()
        .map(|(strategy_id, bars)| {
            let cycles = group_tagged(strategy_id, bars.into_iter(), window);
            (strategy_id.to_string(), cycles)
        })
        .collect()
}

// SUCCESS/FAIL belong to the simulator, never to raw strategy output.
fn is_strategy_tag(state: SignalState) -> bool {
    matches!(
        state,
        SignalState::Flag | SignalState::Pre | SignalState::Mid | SignalState::Post
    )
}

fn open_cycle(strategy_id: &str, index: usize, state: SignalState, window: usize) -> SignalCycle {
    SignalCycle {
        strategy_id: strategy_id.to_string(),
        start_index: index,
        window_end: index.saturating_add(window),
        entry_index: None,
        entry_price: None,
        entry_method: None,
        state_sequence: vec![(index, state)],
        duplicates_absorbed: 0,
    }
}

fn group_tagged<I>(strategy_id: &str, tagged: I, window: usize) -> Vec<SignalCycle>
where
    I: Iterator<Item = (usize, SignalState)>,
{
    let mut cycles: Vec<SignalCycle> = Vec::new();
    let mut current: Option<SignalCycle> = None;

    for (idx, state) in tagged {
        let Some(cycle) = current.as_mut() else {
            current = Some(open_cycle(strategy_id, idx, state, window));
            continue;
        };

        let last = cycle.last_state();
        let inside = idx <= cycle.window_end;
        let restarts = !inside || (last.is_terminal() && state.severity() < last.severity());

        if restarts {
            if let Some(done) = current.take() {
                cycles.push(done);
            }
            current = Some(open_cycle(strategy_id, idx, state, window));
        } else if !last.is_terminal() && state.severity() > last.severity() {
            cycle.state_sequence.push((idx, state));
        } else {
            cycle.duplicates_absorbed += 1;
        }
    }

    if let Some(done) = current {
        cycles.push(done);
    }

    debug!("{}: grouped {} cycles", strategy_id, cycles.len());
    cycles
}

#[cfg(test)]
mod tests {
    use super::*;

    fn series(len: usize, tags: &[(usize, SignalState)]) -> Vec<SignalState> {
        let mut signals = vec![SignalState::Empty; len];
        for (idx, state) in tags {
            signals[*idx] = *state;
        }
        signals
    }

    fn event(strategy_id: &str, bar_index: usize, state: SignalState) -> SignalEvent {
        SignalEvent {
            bar_index,
            state,
            strategy_id: strategy_id.to_string(),
            payload: Default::default(),
        }
    }

    #[test]
    fn repeated_flags_collapse_into_one_cycle_per_window() {
        let signals = vec![SignalState::Flag; 12];
        let cycles = group_cycles("rising_trend", &signals, 5);
        assert_eq!(cycles.len(), 2);
        assert_eq!(cycles[0].start_index, 0);
        assert_eq!(cycles[0].window_end, 5);
        assert_eq!(cycles[0].duplicates_absorbed, 5);
        assert_eq!(cycles[1].start_index, 6);
        assert_eq!(cycles[1].duplicates_absorbed, 5);
    }

    #[test]
    fn stages_within_window_are_transitions() {
        let signals = series(
            20,
            &[
                (2, SignalState::Pre),
                (4, SignalState::Mid),
                (5, SignalState::Mid),
                (7, SignalState::Post),
            ],
        );
        let cycles = group_cycles("macd_stage", &signals, 10);
        assert_eq!(cycles.len(), 1);
        assert_eq!(
            cycles[0].state_sequence,
            vec![
                (2, SignalState::Pre),
                (4, SignalState::Mid),
                (7, SignalState::Post)
            ]
        );
        assert_eq!(cycles[0].duplicates_absorbed, 1);
        assert!(cycles[0].is_closed());
    }

    #[test]
    fn regression_inside_open_cycle_is_absorbed() {
        let signals = series(10, &[(1, SignalState::Mid), (3, SignalState::Pre)]);
        let cycles = group_cycles("macd_stage", &signals, 10);
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].state_sequence, vec![(1, SignalState::Mid)]);
        assert_eq!(cycles[0].duplicates_absorbed, 1);
    }

    #[test]
    fn earlier_stage_after_terminal_opens_new_cycle() {
        let signals = series(
            10,
            &[
                (1, SignalState::Pre),
                (2, SignalState::Post),
                (3, SignalState::Post),
                (4, SignalState::Pre),
            ],
        );
        let cycles = group_cycles("macd_stage", &signals, 10);
        assert_eq!(cycles.len(), 2);
        assert_eq!(cycles[0].duplicates_absorbed, 1);
        assert_eq!(cycles[1].start_index, 4);
        assert_eq!(cycles[1].opening_state(), SignalState::Pre);
    }

    #[test]
    fn same_bar_duplicates_keep_higher_severity() {
        let events = vec![
            event("macd_stage", 3, SignalState::Pre),
            event("macd_stage", 3, SignalState::Mid),
            event("macd_stage", 3, SignalState::Pre),
        ];
        let cycles = classify_events(&events, 10);
        assert_eq!(cycles["macd_stage"].len(), 1);
        assert_eq!(
            cycles["macd_stage"][0].state_sequence,
            vec![(3, SignalState::Mid)]
        );
    }

    #[test]
    fn strategies_are_grouped_independently() {
        let events = vec![
            event("ma_crossover", 2, SignalState::Flag),
            event("rsi_rebound", 3, SignalState::Pre),
            event("ma_crossover", 4, SignalState::Flag),
            event("rsi_rebound", 6, SignalState::Mid),
            event("rsi_rebound", 7, SignalState::Success),
        ];
        let cycles = classify_events(&events, 10);
        assert_eq!(cycles.len(), 2);
        assert_eq!(cycles["ma_crossover"].len(), 1);
        assert_eq!(cycles["ma_crossover"][0].duplicates_absorbed, 1);
        assert_eq!(
            cycles["rsi_rebound"][0].state_sequence,
            vec![(3, SignalState::Pre), (6, SignalState::Mid)]
        );
    }
}
