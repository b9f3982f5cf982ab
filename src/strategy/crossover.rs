use crate::indicators::IndicatorReading;
use crate::models::{CrossDirection, CrossoverEvent};

/// Detect an oscillator / signal-line cross between two consecutive candles
///
/// Up fires iff `prev_oscillator <= prev_signal && oscillator > signal`,
/// Down iff `prev_oscillator >= prev_signal && oscillator < signal`. The
/// trailing comparison is non-strict and the leading one strict, so an
/// oscillator sitting flat on its signal line does not re-trigger.
pub fn detect_crossover(
    prev_oscillator: f64,
    prev_signal: f64,
    oscillator: f64,
    signal: f64,
) -> Option<CrossDirection> {
    if prev_oscillator <= prev_signal && oscillator > signal {
        Some(CrossDirection::Up)
    } else if prev_oscillator >= prev_signal && oscillator < signal {
        Some(CrossDirection::Down)
    } else {
        None
    }
}

/// Crossover event for a reading taken at a finalized candle
pub fn crossover_event(reading: &IndicatorReading) -> Option<CrossoverEvent> {
    detect_crossover(
        reading.previous_oscillator,
        reading.previous_signal,
        reading.oscillator,
        reading.signal,
    )
    .map(|direction| CrossoverEvent {
        direction,
        oscillator: reading.oscillator,
        signal: reading.signal,
    })
}
