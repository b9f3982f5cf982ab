use serde::{Deserialize, Serialize};

/// Point-in-time copy of the ledger, attached to lifecycle events
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub balance: f64,
    pub initial_balance: f64,
    pub total_trades: u32,
    pub wins: u32,
    pub losses: u32,
}

impl LedgerSnapshot {
    pub fn net_pnl(&self) -> f64 {
        self.balance - self.initial_balance
    }

    pub fn win_rate(&self) -> f64 {
        if self.total_trades == 0 {
            0.0
        } else {
            self.wins as f64 / self.total_trades as f64
        }
    }
}

/// Paper account: running balance and outcome counters
///
/// Only the position lifecycle mutates it, on partial realization and on
/// close. It is never reset while the process runs.
#[derive(Debug, Clone)]
pub struct AccountLedger {
    initial_balance: f64,
    balance: f64,
    total_trades: u32,
    wins: u32,
    losses: u32,
}

impl AccountLedger {
    pub fn new(initial_balance: f64) -> Self {
        Self {
            initial_balance,
            balance: initial_balance,
            total_trades: 0,
            wins: 0,
            losses: 0,
        }
    }

    pub fn balance(&self) -> f64 {
        self.balance
    }

    pub fn total_trades(&self) -> u32 {
        self.total_trades
    }

    pub fn wins(&self) -> u32 {
        self.wins
    }

    pub fn losses(&self) -> u32 {
        self.losses
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            balance: self.balance,
            initial_balance: self.initial_balance,
            total_trades: self.total_trades,
            wins: self.wins,
            losses: self.losses,
        }
    }

    /// Capital to put at risk on the next entry
    pub fn risk_budget(&self, risk_percent_of_balance: f64) -> f64 {
        self.balance * risk_percent_of_balance
    }

    /// Bank a partial exit; the trade stays open so counters are untouched
    pub(crate) fn realize_partial(&mut self, amount: f64) {
        self.balance += amount;
    }

    /// Book the remaining leg of a closed trade and classify it by `total_pnl`
    ///
    /// Returns true for a win.
    pub(crate) fn record_close(&mut self, remaining_pnl: f64, total_pnl: f64) -> bool {
        self.balance += remaining_pnl;
        self.total_trades += 1;

        let is_win = total_pnl > 0.0;
        if is_win {
            self.wins += 1;
        } else {
            self.losses += 1;
        }
        is_win
    }
}
