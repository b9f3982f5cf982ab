use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::ConfigError;
use crate::models::CrossoverEvent;
use crate::risk::{AccountLedger, LedgerSnapshot};

/// Forward-only checkpoints of an open position
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Stage {
    Opened,
    /// Stop raised part of the way towards entry
    RiskReduced,
    /// Stop above entry, profit locked in
    BreakevenPlus,
    /// Part of the profit banked, remainder trailing
    PartiallyClosed,
}

impl Stage {
    pub fn label(&self) -> &'static str {
        match self {
            Stage::Opened => "opened",
            Stage::RiskReduced => "risk reduced",
            Stage::BreakevenPlus => "breakeven plus",
            Stage::PartiallyClosed => "partially closed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    /// Initial stop hit before any stage was reached
    StopLoss,
    /// Raised stop hit before the partial exit
    ProtectiveStop,
    /// Trailing stop hit after the partial exit
    TrailingStop,
    /// Terminal R multiple reached
    TakeProfit,
}

/// R multiples that gate each stage
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StageThresholds {
    pub t0: f64,
    pub t1: f64,
    pub t2: f64,
}

/// Stop placement per stage, in R relative to entry
///
/// Stage 0 moves the stop to `entry - R*k0`, stage 1 to `entry + R*k1` and
/// stage 2 to `entry + R*k2`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StopMultipliers {
    pub k0: f64,
    pub k1: f64,
    pub k2: f64,
}

/// Every tunable of the staged lifecycle
#[derive(Debug, Clone, PartialEq)]
pub struct LifecycleConfig {
    pub risk_percent_of_balance: f64,
    /// Safety offset below the reference low for the initial stop
    pub stop_buffer_pct: f64,
    pub thresholds: StageThresholds,
    pub stop_multipliers: StopMultipliers,
    /// Fraction of the position realized at `t2`
    pub partial_exit_fraction: f64,
    /// Price advance over the trailing reference that moves the stop
    pub trail_trigger_pct: f64,
    /// Relative stop increase per trailing move
    pub trail_step_pct: f64,
    /// Terminal target in R, None to ride the trailing stop only
    pub take_profit_r: Option<f64>,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            risk_percent_of_balance: 0.05,
            stop_buffer_pct: 0.0005,
            thresholds: StageThresholds {
                t0: 1.0,
                t1: 1.5,
                t2: 2.1,
            },
            stop_multipliers: StopMultipliers {
                k0: 0.5,
                k1: 0.5,
                k2: 1.5,
            },
            partial_exit_fraction: 0.7,
            trail_trigger_pct: 0.002,
            trail_step_pct: 0.001,
            take_profit_r: Some(3.0),
        }
    }
}

impl LifecycleConfig {
    /// Reject orderings that would make a stage lower the stop or stop out immediately
    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = self.thresholds;
        let k = self.stop_multipliers;

        if !(0.0 < t.t0 && t.t0 < t.t1 && t.t1 < t.t2) {
            return Err(ConfigError::ThresholdOrder {
                t0: t.t0,
                t1: t.t1,
                t2: t.t2,
            });
        }
        // Stop levels -k0 < k1 < k2, first one above the initial stop (-1R)
        if !(0.0 < k.k0 && k.k0 < 1.0 && 0.0 < k.k1 && k.k1 < k.k2) {
            return Err(ConfigError::StopOrder {
                k0: k.k0,
                k1: k.k1,
                k2: k.k2,
            });
        }
        if k.k1 >= t.t1 || k.k2 >= t.t2 {
            return Err(ConfigError::Invalid(format!(
                "stop multipliers must sit below their trigger (k1={} < t1={}, k2={} < t2={})",
                k.k1, t.t1, k.k2, t.t2
            )));
        }
        if let Some(target) = self.take_profit_r {
            if target <= t.t2 {
                return Err(ConfigError::Invalid(format!(
                    "take_profit_r ({}) must exceed t2 ({})",
                    target, t.t2
                )));
            }
        }

        check_fraction("risk_percent_of_balance", self.risk_percent_of_balance)?;
        check_fraction("partial_exit_fraction", self.partial_exit_fraction)?;
        if !(0.0..1.0).contains(&self.stop_buffer_pct) {
            return Err(ConfigError::OutOfRange {
                field: "stop_buffer_pct",
                value: self.stop_buffer_pct,
            });
        }
        check_fraction("trail_trigger_pct", self.trail_trigger_pct)?;
        check_fraction("trail_step_pct", self.trail_step_pct)?;
        Ok(())
    }
}

fn check_fraction(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value > 0.0 && value < 1.0 {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange { field, value })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Position {
    pub id: Uuid,
    pub opened_at: DateTime<Utc>,
    pub entry_price: f64,
    pub initial_stop_price: f64,
    pub current_stop_price: f64,
    pub risk_amount_usd: f64, // Fixed at entry
    pub stage: Stage,
    pub realized_pnl: f64,
    pub highest_price_seen: f64, // Trailing reference after the partial exit
    pub realized_fraction: f64,  // Share of the position already closed
}

impl Position {
    /// Price distance between entry and initial stop (R)
    pub fn risk_unit(&self) -> f64 {
        self.entry_price - self.initial_stop_price
    }

    /// Live reward/risk multiple at `price`
    pub fn r_multiple(&self, price: f64) -> f64 {
        (price - self.entry_price) / self.risk_unit()
    }

    pub fn remaining_fraction(&self) -> f64 {
        1.0 - self.realized_fraction
    }

    /// PnL of the still-open leg if it were closed at `price`
    pub fn remaining_pnl(&self, price: f64) -> f64 {
        self.r_multiple(price) * self.risk_amount_usd * self.remaining_fraction()
    }

    fn raise_stop(&mut self, level: f64) -> f64 {
        self.current_stop_price = self.current_stop_price.max(level);
        self.current_stop_price
    }
}

/// Outcome of a closed position
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClosedTrade {
    pub id: Uuid,
    pub entry_price: f64,
    pub exit_price: f64,
    pub initial_stop_price: f64,
    pub risk_amount_usd: f64,
    pub reason: ExitReason,
    pub stage_reached: Stage,
    pub realized_pnl: f64,
    pub remaining_pnl: f64,
    pub total_pnl: f64,
    /// Total PnL in units of the entry risk
    pub r_multiple: f64,
    pub is_win: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    Opened {
        position: Position,
        trigger: CrossoverEvent,
        ledger: LedgerSnapshot,
    },
    StageAdvanced {
        stage: Stage,
        price: f64,
        new_stop: f64,
        /// Amount banked by this transition (partial exit only)
        banked: Option<f64>,
        realized_pnl: f64,
        ledger: LedgerSnapshot,
    },
    StopTrailed {
        new_stop: f64,
        highest_price: f64,
    },
    Closed {
        trade: ClosedTrade,
        ledger: LedgerSnapshot,
    },
}

/// Staged state machine owning at most one paper position and the ledger
pub struct PositionManager {
    config: LifecycleConfig,
    position: Option<Position>,
    ledger: AccountLedger,
}

impl PositionManager {
    pub fn new(config: LifecycleConfig, initial_balance: f64) -> Self {
        Self {
            config,
            position: None,
            ledger: AccountLedger::new(initial_balance),
        }
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    pub fn ledger(&self) -> &AccountLedger {
        &self.ledger
    }

    pub fn position(&self) -> Option<&Position> {
        self.position.as_ref()
    }

    pub fn has_open_position(&self) -> bool {
        self.position.is_some()
    }

    /// Open a long at `entry_price` with the stop just under `reference_low`
    pub fn open_position(
        &mut self,
        entry_price: f64,
        reference_low: f64,
        trigger: CrossoverEvent,
    ) -> anyhow::Result<LifecycleEvent> {
        self.open_position_at(entry_price, reference_low, trigger, None)
    }

    /// Open with an explicit timestamp
    pub fn open_position_at(
        &mut self,
        entry_price: f64,
        reference_low: f64,
        trigger: CrossoverEvent,
        timestamp: Option<DateTime<Utc>>,
    ) -> anyhow::Result<LifecycleEvent> {
        if self.position.is_some() {
            anyhow::bail!("Already have an open position");
        }

        let stop = reference_low * (1.0 - self.config.stop_buffer_pct);
        let risk_unit = entry_price - stop;
        if !risk_unit.is_finite() || risk_unit <= 0.0 {
            anyhow::bail!(
                "Stop {:.4} is not below entry {:.4}, refusing entry",
                stop,
                entry_price
            );
        }

        let risk_amount_usd = self.ledger.risk_budget(self.config.risk_percent_of_balance);
        if risk_amount_usd <= 0.0 {
            anyhow::bail!("No balance left to risk ({:.2})", self.ledger.balance());
        }

        let position = Position {
            id: Uuid::new_v4(),
            opened_at: timestamp.unwrap_or_else(Utc::now),
            entry_price,
            initial_stop_price: stop,
            current_stop_price: stop,
            risk_amount_usd,
            stage: Stage::Opened,
            realized_pnl: 0.0,
            highest_price_seen: entry_price,
            realized_fraction: 0.0,
        };

        tracing::info!(
            id = %position.id,
            entry = entry_price,
            stop = stop,
            risk_usd = risk_amount_usd,
            "Opened position"
        );

        self.position = Some(position.clone());
        Ok(LifecycleEvent::Opened {
            position,
            trigger,
            ledger: self.ledger.snapshot(),
        })
    }

    /// Evaluate stage gates, trailing and exits for one price tick
    pub fn on_price(&mut self, price: f64) -> Vec<LifecycleEvent> {
        let mut events = Vec::new();
        let Some(position) = self.position.as_mut() else {
            return events;
        };

        let thresholds = self.config.thresholds;
        let k = self.config.stop_multipliers;
        let entry = position.entry_price;
        let risk_unit = position.risk_unit();
        let rr = position.r_multiple(price);

        if position.stage < Stage::RiskReduced && rr >= thresholds.t0 {
            let new_stop = position.raise_stop(entry - risk_unit * k.k0);
            position.stage = Stage::RiskReduced;
            events.push(LifecycleEvent::StageAdvanced {
                stage: Stage::RiskReduced,
                price,
                new_stop,
                banked: None,
                realized_pnl: position.realized_pnl,
                ledger: self.ledger.snapshot(),
            });
        }

        if position.stage < Stage::BreakevenPlus && rr >= thresholds.t1 {
            let new_stop = position.raise_stop(entry + risk_unit * k.k1);
            position.stage = Stage::BreakevenPlus;
            events.push(LifecycleEvent::StageAdvanced {
                stage: Stage::BreakevenPlus,
                price,
                new_stop,
                banked: None,
                realized_pnl: position.realized_pnl,
                ledger: self.ledger.snapshot(),
            });
        }

        if position.stage < Stage::PartiallyClosed && rr >= thresholds.t2 {
            let fraction = self.config.partial_exit_fraction;
            let banked = position.risk_amount_usd * thresholds.t2 * fraction;

            position.realized_pnl += banked;
            position.realized_fraction = fraction;
            position.highest_price_seen = price;
            self.ledger.realize_partial(banked);

            let new_stop = position.raise_stop(entry + risk_unit * k.k2);
            position.stage = Stage::PartiallyClosed;
            events.push(LifecycleEvent::StageAdvanced {
                stage: Stage::PartiallyClosed,
                price,
                new_stop,
                banked: Some(banked),
                realized_pnl: position.realized_pnl,
                ledger: self.ledger.snapshot(),
            });
        } else if position.stage == Stage::PartiallyClosed
            && price > position.highest_price_seen * (1.0 + self.config.trail_trigger_pct)
        {
            position.highest_price_seen = price;
            let trailed = position.current_stop_price * (1.0 + self.config.trail_step_pct);
            let new_stop = position.raise_stop(trailed);
            tracing::debug!(new_stop, highest = price, "Trailing stop moved");
            events.push(LifecycleEvent::StopTrailed {
                new_stop,
                highest_price: price,
            });
        }

        let exit = match self.config.take_profit_r {
            Some(target) if rr >= target => {
                Some((entry + risk_unit * target, ExitReason::TakeProfit))
            }
            _ if price <= position.current_stop_price => {
                let reason = match position.stage {
                    Stage::Opened => ExitReason::StopLoss,
                    Stage::RiskReduced | Stage::BreakevenPlus => ExitReason::ProtectiveStop,
                    Stage::PartiallyClosed => ExitReason::TrailingStop,
                };
                Some((position.current_stop_price, reason))
            }
            _ => None,
        };

        if let Some((exit_price, reason)) = exit {
            if let Some(event) = self.close_position(exit_price, reason) {
                events.push(event);
            }
        }

        events
    }

    /// Close the open position at `exit_price` and book it in the ledger
    pub fn close_position(&mut self, exit_price: f64, reason: ExitReason) -> Option<LifecycleEvent> {
        let position = self.position.take()?;

        let remaining_pnl = position.remaining_pnl(exit_price);
        let total_pnl = position.realized_pnl + remaining_pnl;
        let is_win = self.ledger.record_close(remaining_pnl, total_pnl);

        let trade = ClosedTrade {
            id: position.id,
            entry_price: position.entry_price,
            exit_price,
            initial_stop_price: position.initial_stop_price,
            risk_amount_usd: position.risk_amount_usd,
            reason,
            stage_reached: position.stage,
            realized_pnl: position.realized_pnl,
            remaining_pnl,
            total_pnl,
            r_multiple: total_pnl / position.risk_amount_usd,
            is_win,
        };

        tracing::info!(
            id = %trade.id,
            reason = ?reason,
            exit = exit_price,
            total_pnl = total_pnl,
            balance = self.ledger.balance(),
            "Closed position"
        );

        Some(LifecycleEvent::Closed {
            trade,
            ledger: self.ledger.snapshot(),
        })
    }

    /// Unrealized PnL of the open leg at `price`
    pub fn unrealized_pnl(&self, price: f64) -> Option<f64> {
        self.position.as_ref().map(|p| p.remaining_pnl(price))
    }
}
