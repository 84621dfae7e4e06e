use crate::config::DecisionConfig;
use crate::error::EngineError;
use crate::models::Position;
use crate::scoring::DecisionScores;
use chrono::NaiveDate;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const T1_RESTRICTION: &str = "T+1 restriction";

/// Anything smaller is treated as no remaining capacity.
const MIN_POSITION_FRACTION: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionState {
    NoPosition,
    HeldUnsellable,
    HeldSellable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    Buy,
    Sell,
    Hold,
    Observe,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub instrument_id: String,
    pub date: Option<NaiveDate>,
    pub action: Action,
    pub reason: String,
    /// Capital fraction to commit; non-zero only for BUY.
    pub position_fraction: f64,
    pub state: PositionState,
}

/// Owns every open position and enforces the settlement rule: a position
/// bought on day N can only be sold once the processing date is past N.
#[derive(Debug, Clone)]
pub struct PositionBook {
    capital: f64,
    cash: f64,
    config: DecisionConfig,
    positions: BTreeMap<String, Position>,
    current_date: Option<NaiveDate>,
    violations: Vec<EngineError>,
}

impl PositionBook {
    pub fn new(capital: f64, config: DecisionConfig) -> Self {
        Self {
            capital,
            cash: capital,
            config,
            positions: BTreeMap::new(),
            current_date: None,
            violations: Vec::new(),
        }
    }

    pub fn current_date(&self) -> Option<NaiveDate> {
        self.current_date
    }

    pub fn cash(&self) -> f64 {
        self.cash
    }

    pub fn position(&self, instrument_id: &str) -> Option<&Position> {
        self.positions.get(instrument_id)
    }

    pub fn positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.values()
    }

    /// Rule violations that were downgraded or clamped, oldest first.
    pub fn violations(&self) -> &[EngineError] {
        &self.violations
    }

    pub fn state(&self, instrument_id: &str) -> PositionState {
        match self.positions.get(instrument_id) {
            None => PositionState::NoPosition,
            Some(position) if position.sellable => PositionState::HeldSellable,
            Some(_) => PositionState::HeldUnsellable,
        }
    }

    /// Move the processing date forward; positions entered before it become sellable.
    pub fn advance_to(&mut self, date: NaiveDate) {
        if let Some(current) = self.current_date {
            if date < current {
                warn!(
                    "Ignoring processing date {} earlier than current {}",
                    date, current
                );
                return;
            }
        }
        self.current_date = Some(date);
        for position in self.positions.values_mut() {
            if !position.sellable && position.entry_date < date {
                position.sellable = true;
                debug!(
                    "{} bought {} is sellable from {}",
                    position.instrument_id, position.entry_date, date
                );
            }
        }
    }

    /// Share of capital currently committed at cost.
    pub fn invested_fraction(&self) -> f64 {
        if self.capital <= 0.0 {
            return 0.0;
        }
        self.positions.values().map(|p| p.cost_basis()).sum::<f64>() / self.capital
    }

    fn record_violation(&mut self, instrument_id: &str, reason: String) {
        warn!("Rule violation for {}: {}", instrument_id, reason);
        self.violations.push(EngineError::RuleViolation {
            instrument_id: instrument_id.to_string(),
            reason,
        });
    }

    /// Capital fraction for a new position, clamped to both caps.
    pub fn suggest_fraction(&mut self, instrument_id: &str, scores: &DecisionScores) -> f64 {
        let raw = self.config.base_position_fraction
            * (0.5 + scores.confidence)
            * (1.0 - scores.risk / 100.0);
        self.clamp_fraction(instrument_id, raw)
    }

    /// Clamp a requested fraction to the per-instrument cap and to what the
    /// portfolio cap leaves right now, recording each clamp.
    fn clamp_fraction(&mut self, instrument_id: &str, requested: f64) -> f64 {
        let mut fraction = if requested.is_finite() {
            requested.max(0.0)
        } else {
            0.0
        };

        if fraction > self.config.max_position_fraction {
            self.record_violation(
                instrument_id,
                format!(
                    "position size {:.3} above per-instrument cap {:.3}",
                    fraction, self.config.max_position_fraction
                ),
            );
            fraction = self.config.max_position_fraction;
        }

        let capacity = (self.config.max_portfolio_fraction - self.invested_fraction()).max(0.0);
        if fraction > capacity {
            self.record_violation(
                instrument_id,
                format!(
                    "position size {:.3} above remaining portfolio capacity {:.3}",
                    fraction, capacity
                ),
            );
            fraction = capacity;
        }
        fraction
    }

    fn sell_reason(&self, position: &Position, price: f64, scores: &DecisionScores) -> Option<String> {
        let change = position.unrealized_pct(price);
        let cfg = &self.config;
        if change >= cfg.take_profit_pct {
            Some(format!("take profit at {:.2}%", change))
        } else if -change >= cfg.stop_loss_pct {
            Some(format!("stop loss at {:.2}%", change))
        } else if scores.risk > cfg.sell_risk_min {
            Some(format!("risk score {:.0} too high", scores.risk))
        } else if scores.technical < cfg.sell_weak_score && scores.momentum < cfg.sell_weak_score {
            Some("technical and momentum both weak".to_string())
        } else {
            None
        }
    }

    fn decision(&self, instrument_id: &str, action: Action, reason: String, fraction: f64) -> Decision {
        Decision {
            instrument_id: instrument_id.to_string(),
            date: self.current_date,
            action,
            reason,
            position_fraction: fraction,
            state: self.state(instrument_id),
        }
    }

    /// Decide what to do with one instrument on the current processing date.
    pub fn decide(&mut self, instrument_id: &str, price: f64, scores: &DecisionScores) -> Decision {
        let cfg = self.config.clone();
        match self.state(instrument_id) {
            PositionState::NoPosition => {
                let wants_buy = scores.technical > cfg.buy_technical_min
                    && scores.momentum > cfg.buy_momentum_min
                    && scores.risk < cfg.buy_risk_max;
                if !wants_buy {
                    return self.decision(
                        instrument_id,
                        Action::Observe,
                        "entry conditions not met".to_string(),
                        0.0,
                    );
                }
                let fraction = self.suggest_fraction(instrument_id, scores);
                if fraction < MIN_POSITION_FRACTION {
                    return self.decision(
                        instrument_id,
                        Action::Hold,
                        "portfolio limit reached".to_string(),
                        0.0,
                    );
                }
                self.decision(
                    instrument_id,
                    Action::Buy,
                    format!(
                        "technical {:.0}, momentum {:.0}, risk {:.0}",
                        scores.technical, scores.momentum, scores.risk
                    ),
                    fraction,
                )
            }
            PositionState::HeldUnsellable => {
                let reason = match self
                    .positions
                    .get(instrument_id)
                    .and_then(|p| self.sell_reason(p, price, scores))
                {
                    Some(wanted) => {
                        info!("{}: {} blocked by {}", instrument_id, wanted, T1_RESTRICTION);
                        T1_RESTRICTION.to_string()
                    }
                    None => "holding".to_string(),
                };
                self.decision(instrument_id, Action::Hold, reason, 0.0)
            }
            PositionState::HeldSellable => {
                match self
                    .positions
                    .get(instrument_id)
                    .and_then(|p| self.sell_reason(p, price, scores))
                {
                    Some(reason) => self.decision(instrument_id, Action::Sell, reason, 0.0),
                    None => self.decision(instrument_id, Action::Hold, "holding".to_string(), 0.0),
                }
            }
        }
    }

    /// External SELL request. Never executes while the position is unsellable.
    pub fn request_sell(
        &mut self,
        instrument_id: &str,
        price: f64,
        scores: &DecisionScores,
    ) -> Result<Decision, EngineError> {
        match self.state(instrument_id) {
            PositionState::NoPosition => Ok(self.decision(
                instrument_id,
                Action::Observe,
                "no position to sell".to_string(),
                0.0,
            )),
            PositionState::HeldUnsellable => {
                self.record_violation(
                    instrument_id,
                    format!("sell requested before settlement ({})", T1_RESTRICTION),
                );
                Ok(self.decision(instrument_id, Action::Hold, T1_RESTRICTION.to_string(), 0.0))
            }
            PositionState::HeldSellable => {
                let decision = self.decide(instrument_id, price, scores);
                if decision.action == Action::Sell {
                    self.execute(&decision, price)?;
                }
                Ok(decision)
            }
        }
    }

    /// Apply a decision. BUY opens an unsellable position dated today, sized
    /// against the caps as they stand now; SELL is refused unless the position
    /// is sellable.
    pub fn execute(&mut self, decision: &Decision, price: f64) -> Result<(), EngineError> {
        let instrument_id = decision.instrument_id.as_str();
        match decision.action {
            Action::Hold | Action::Observe => Ok(()),
            Action::Buy => {
                if self.positions.contains_key(instrument_id) {
                    return Err(EngineError::RuleViolation {
                        instrument_id: instrument_id.to_string(),
                        reason: "already holding a position".to_string(),
                    });
                }
                let Some(date) = self.current_date else {
                    return Err(EngineError::RuleViolation {
                        instrument_id: instrument_id.to_string(),
                        reason: "no processing date set".to_string(),
                    });
                };
                if !(price.is_finite() && price > 0.0) {
                    return Err(EngineError::Data {
                        instrument_id: instrument_id.to_string(),
                        reason: format!("cannot buy at price {}", price),
                    });
                }
                let fraction = self.clamp_fraction(instrument_id, decision.position_fraction);
                if fraction < MIN_POSITION_FRACTION {
                    return Err(EngineError::RuleViolation {
                        instrument_id: instrument_id.to_string(),
                        reason: "portfolio limit reached".to_string(),
                    });
                }
                let shares = fraction * self.capital / price;
                self.cash -= shares * price;
                self.positions.insert(
                    instrument_id.to_string(),
                    Position {
                        instrument_id: instrument_id.to_string(),
                        shares,
                        entry_price: price,
                        entry_date: date,
                        sellable: false,
                    },
                );
                info!(
                    "BUY {} {:.4} shares at {:.2} on {}",
                    instrument_id, shares, price, date
                );
                Ok(())
            }
            Action::Sell => match self.state(instrument_id) {
                PositionState::HeldSellable => {
                    if let Some(position) = self.positions.remove(instrument_id) {
                        self.cash += position.shares * price;
                        info!(
                            "SELL {} {:.4} shares at {:.2} ({:+.2}%)",
                            instrument_id,
                            position.shares,
                            price,
                            position.unrealized_pct(price)
                        );
                    }
                    Ok(())
                }
                PositionState::HeldUnsellable => Err(EngineError::RuleViolation {
                    instrument_id: instrument_id.to_string(),
                    reason: T1_RESTRICTION.to_string(),
                }),
                PositionState::NoPosition => Err(EngineError::RuleViolation {
                    instrument_id: instrument_id.to_string(),
                    reason: "no position to sell".to_string(),
                }),
            },
        }
    }
}
