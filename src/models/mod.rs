use serde::{Deserialize, Serialize};

/// OHLCV candle for the signal interval
///
/// The close of the last candle in a buffer is repainted by every tick
/// until the candle finalizes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open_time_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    /// Flat candle opened at `price` (used when a new candle starts forming)
    pub fn opened_at(open_time_ms: i64, price: f64) -> Self {
        Self {
            open_time_ms,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: 0.0,
        }
    }

    /// All prices finite and strictly positive, low <= high
    pub fn is_valid(&self) -> bool {
        [self.open, self.high, self.low, self.close]
            .iter()
            .all(|p| p.is_finite() && *p > 0.0)
            && self.low <= self.high
    }
}

/// Single feed event for the subscribed tick interval
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub close_price: f64,
    /// True on the last update of a tick-interval candle
    pub interval_final: bool,
    pub volume: f64,
    pub open_time_ms: i64,
}

impl Tick {
    pub fn is_valid(&self) -> bool {
        self.close_price.is_finite() && self.close_price > 0.0 && self.open_time_ms >= 0
    }
}

/// Direction of an oscillator / signal-line cross
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CrossDirection {
    Up,
    Down,
}

/// Produced once per finalized signal candle when a cross happened
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CrossoverEvent {
    pub direction: CrossDirection,
    pub oscillator: f64,
    pub signal: f64,
}
