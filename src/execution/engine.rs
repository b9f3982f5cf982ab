use crate::config::{parse_interval, ConfigError, Settings};
use crate::execution::candle_buffer::{BufferError, CandleBuffer};
use crate::execution::position_manager::{LifecycleEvent, PositionManager};
use crate::indicators::{IndicatorEngine, IndicatorReading};
use crate::models::{Candle, CrossDirection, CrossoverEvent, Tick};
use crate::strategy::crossover_event;

/// What a single tick did to the engine
#[derive(Debug, Clone, Default)]
pub struct TickOutcome {
    pub events: Vec<LifecycleEvent>,
    pub crossover: Option<CrossoverEvent>,
    /// Reading taken at a finalized signal candle
    pub reading: Option<IndicatorReading>,
    /// A signal candle finalized on this tick
    pub candle_closed: bool,
    /// Tick skipped past the buffer, the window must be re-fetched
    pub needs_rehydration: bool,
}

/// Owned per-instrument trading state
///
/// Wires the candle buffer, indicator engine, crossover detector and position
/// lifecycle together. Only the supervisor task mutates it.
pub struct TradingEngine {
    symbol: String,
    tick_interval_ms: i64,
    signal_interval_ms: i64,
    buffer: CandleBuffer,
    indicators: IndicatorEngine,
    positions: PositionManager,
    last_evaluated_open_time: Option<i64>,
}

impl TradingEngine {
    pub fn new(settings: &Settings) -> Result<Self, ConfigError> {
        let tick_interval_ms = parse_interval(&settings.tick_interval)?;
        let signal_interval_ms = parse_interval(&settings.signal_interval)?;

        Ok(Self {
            symbol: settings.symbol.clone(),
            tick_interval_ms,
            signal_interval_ms,
            buffer: CandleBuffer::new(settings.stream.buffer_capacity),
            indicators: IndicatorEngine::new(settings.indicator_settings()),
            positions: PositionManager::new(settings.lifecycle(), settings.initial_balance),
            last_evaluated_open_time: None,
        })
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn buffer(&self) -> &CandleBuffer {
        &self.buffer
    }

    pub fn positions(&self) -> &PositionManager {
        &self.positions
    }

    pub fn signal_interval_ms(&self) -> i64 {
        self.signal_interval_ms
    }

    /// Candles needed before the oscillator is defined
    pub fn min_window(&self) -> usize {
        self.indicators.settings().min_window()
    }

    /// Enough candles for a defined oscillator
    pub fn is_warm(&self) -> bool {
        self.buffer.len() >= self.min_window()
    }

    /// Replace the signal window with a fresh snapshot and recompute indicators
    ///
    /// A snapshot shorter than the oscillator window is rejected and the
    /// current window is kept.
    pub fn rehydrate(&mut self, candles: Vec<Candle>) -> Result<(), BufferError> {
        if candles.len() < self.min_window() {
            return Err(BufferError::TooShort {
                got: candles.len(),
                need: self.min_window(),
            });
        }
        self.buffer.replace(candles)?;
        let reading = self.indicators.update(&self.buffer);

        tracing::debug!(
            symbol = %self.symbol,
            candles = self.buffer.len(),
            oscillator = reading.oscillator,
            signal = reading.signal,
            "Signal window rehydrated"
        );
        Ok(())
    }

    /// Process one feed tick
    pub fn on_tick(&mut self, tick: &Tick) -> TickOutcome {
        let mut outcome = TickOutcome::default();

        if !tick.is_valid() {
            tracing::warn!(?tick, "Discarding malformed tick");
            return outcome;
        }
        let Some(last_open) = self.buffer.last().map(|c| c.open_time_ms) else {
            outcome.needs_rehydration = true;
            return outcome;
        };

        let price = tick.close_price;
        let signal_open = tick.open_time_ms - tick.open_time_ms.rem_euclid(self.signal_interval_ms);

        if signal_open < last_open {
            tracing::debug!(signal_open, last_open, "Discarding out-of-order tick");
            return outcome;
        }

        if signal_open == last_open {
            if let Err(e) = self.buffer.repaint(price) {
                tracing::warn!("Repaint failed: {}", e);
                return outcome;
            }
        } else if signal_open == last_open + self.signal_interval_ms {
            // The closing tick of the previous candle was missed
            self.evaluate_close(price, &mut outcome);
            self.buffer.roll(signal_open, price);
        } else {
            tracing::warn!(
                signal_open,
                last_open,
                "Tick skipped past the signal window, rehydration required"
            );
            outcome.needs_rehydration = true;
        }

        outcome.events.extend(self.positions.on_price(price));

        let closes_signal_candle = tick.interval_final
            && tick.open_time_ms + self.tick_interval_ms == signal_open + self.signal_interval_ms;
        if closes_signal_candle && !outcome.needs_rehydration {
            self.evaluate_close(price, &mut outcome);
            self.buffer.roll(signal_open + self.signal_interval_ms, price);
        }

        outcome
    }

    /// Evaluate the just-finalized candle (last in the buffer) once
    fn evaluate_close(&mut self, price: f64, outcome: &mut TickOutcome) {
        let Some(closed) = self.buffer.last().copied() else {
            return;
        };
        if self.last_evaluated_open_time == Some(closed.open_time_ms) {
            return;
        }
        self.last_evaluated_open_time = Some(closed.open_time_ms);
        outcome.candle_closed = true;

        let reading = self.indicators.update(&self.buffer);
        let crossover = crossover_event(&reading);
        let ledger = self.positions.ledger().snapshot();

        tracing::info!(
            symbol = %self.symbol,
            close = closed.close,
            oscillator = %format!("{:.2}", reading.oscillator),
            signal = %format!("{:.2}", reading.signal),
            cross = ?crossover.map(|c| c.direction),
            in_position = self.positions.has_open_position(),
            balance = %format!("{:.2}", ledger.balance),
            "Signal candle closed"
        );

        if let Some(event) = crossover {
            if event.direction == CrossDirection::Up && !self.positions.has_open_position() {
                match self.positions.open_position(price, closed.low, event) {
                    Ok(opened) => outcome.events.push(opened),
                    Err(e) => tracing::warn!("Entry skipped: {}", e),
                }
            }
        }

        outcome.reading = Some(reading);
        outcome.crossover = crossover;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: i64 = 60_000;
    const SIGNAL: i64 = 15 * MINUTE;

    fn settings() -> Settings {
        Settings {
            oscillator_period: 3,
            signal_smoothing_period: 2,
            ..Settings::default()
        }
    }

    fn candles(closes: &[f64]) -> Vec<Candle> {
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| Candle {
                open_time_ms: i as i64 * SIGNAL,
                open: c,
                high: c,
                low: c * 0.99,
                close: c,
                volume: 1.0,
            })
            .collect()
    }

    fn tick(open_time_ms: i64, price: f64, interval_final: bool) -> Tick {
        Tick {
            close_price: price,
            interval_final,
            volume: 1.0,
            open_time_ms,
        }
    }

    #[test]
    fn test_cold_engine_requests_rehydration() {
        let mut engine = TradingEngine::new(&settings()).unwrap();
        let outcome = engine.on_tick(&tick(0, 100.0, false));
        assert!(outcome.needs_rehydration);
        assert!(!engine.is_warm());
    }

    #[test]
    fn test_repaint_does_not_evaluate() {
        let mut engine = TradingEngine::new(&settings()).unwrap();
        engine
            .rehydrate(candles(&[100.0, 99.0, 98.0, 97.0, 96.0]))
            .unwrap();
        let forming = 4 * SIGNAL;

        let outcome = engine.on_tick(&tick(forming + MINUTE, 105.0, true));
        assert!(!outcome.candle_closed);
        assert!(outcome.crossover.is_none());
        assert_eq!(engine.buffer().last().unwrap().close, 105.0);
        assert_eq!(engine.buffer().len(), 5);
    }

    #[test]
    fn test_last_tick_closes_signal_candle() {
        let mut engine = TradingEngine::new(&settings()).unwrap();
        engine
            .rehydrate(candles(&[100.0, 99.0, 98.0, 97.0, 96.0]))
            .unwrap();
        let forming = 4 * SIGNAL;

        // Not final yet
        let outcome = engine.on_tick(&tick(forming + 14 * MINUTE, 104.0, false));
        assert!(!outcome.candle_closed);

        let outcome = engine.on_tick(&tick(forming + 14 * MINUTE, 104.0, true));
        assert!(outcome.candle_closed);
        assert!(outcome.reading.is_some());
        assert_eq!(engine.buffer().len(), 6);
        assert_eq!(engine.buffer().last().unwrap().open_time_ms, forming + SIGNAL);

        // Duplicate final tick is not evaluated twice
        let outcome = engine.on_tick(&tick(forming + 14 * MINUTE, 104.0, true));
        assert!(!outcome.candle_closed);
    }

    #[test]
    fn test_upward_cross_opens_position() {
        let mut engine = TradingEngine::new(&settings()).unwrap();
        engine
            .rehydrate(candles(&[100.0, 99.0, 98.0, 97.0, 96.0]))
            .unwrap();
        let forming = 4 * SIGNAL;

        // Sharp reversal on the forming candle drives the oscillator over its signal
        engine.on_tick(&tick(forming, 101.0, false));
        let outcome = engine.on_tick(&tick(forming + 14 * MINUTE, 104.0, true));

        let cross = outcome.crossover.expect("expected a crossover");
        assert_eq!(cross.direction, CrossDirection::Up);
        assert!(matches!(
            outcome.events.last(),
            Some(LifecycleEvent::Opened { .. })
        ));

        let position = engine.positions().position().unwrap();
        assert_eq!(position.entry_price, 104.0);
        // Stop sits under the finalized candle's low
        assert!(position.initial_stop_price < 96.0 * 0.99);
    }

    #[test]
    fn test_missed_close_is_evaluated_on_roll() {
        let mut engine = TradingEngine::new(&settings()).unwrap();
        engine
            .rehydrate(candles(&[100.0, 99.0, 98.0, 97.0, 96.0]))
            .unwrap();
        let forming = 4 * SIGNAL;

        engine.on_tick(&tick(forming + 3 * MINUTE, 104.0, false));
        let outcome = engine.on_tick(&tick(forming + SIGNAL, 104.5, false));

        assert!(outcome.candle_closed);
        assert_eq!(engine.buffer().last().unwrap().open_time_ms, forming + SIGNAL);
        assert_eq!(engine.buffer().last().unwrap().close, 104.5);
    }

    #[test]
    fn test_gap_requests_rehydration() {
        let mut engine = TradingEngine::new(&settings()).unwrap();
        engine
            .rehydrate(candles(&[100.0, 99.0, 98.0, 97.0, 96.0]))
            .unwrap();

        let outcome = engine.on_tick(&tick(7 * SIGNAL, 101.0, false));
        assert!(outcome.needs_rehydration);
        assert_eq!(engine.buffer().len(), 5);
        assert_eq!(engine.buffer().last().unwrap().close, 96.0);
    }

    #[test]
    fn test_short_snapshot_keeps_current_window() {
        let mut engine = TradingEngine::new(&settings()).unwrap();
        engine
            .rehydrate(candles(&[100.0, 99.0, 98.0, 97.0, 96.0]))
            .unwrap();
        let generation = engine.buffer().generation();
        let before = engine.buffer().candles();

        let result = engine.rehydrate(candles(&[120.0, 121.0, 122.0]));

        assert_eq!(result, Err(BufferError::TooShort { got: 3, need: 4 }));
        assert!(engine.is_warm());
        assert_eq!(engine.buffer().generation(), generation);
        assert_eq!(engine.buffer().candles(), before);
    }

    #[test]
    fn test_short_snapshot_rejected_on_cold_engine() {
        let mut engine = TradingEngine::new(&settings()).unwrap();
        assert!(engine.rehydrate(candles(&[100.0, 99.0])).is_err());
        assert_eq!(engine.buffer().len(), 0);
        assert!(!engine.is_warm());
    }

    #[test]
    fn test_malformed_and_stale_ticks_leave_buffer_unchanged() {
        let mut engine = TradingEngine::new(&settings()).unwrap();
        engine
            .rehydrate(candles(&[100.0, 99.0, 98.0, 97.0, 96.0]))
            .unwrap();
        let before = engine.buffer().candles();

        engine.on_tick(&tick(4 * SIGNAL, f64::NAN, false));
        engine.on_tick(&tick(4 * SIGNAL, -1.0, false));
        engine.on_tick(&tick(2 * SIGNAL, 120.0, true));

        assert_eq!(engine.buffer().candles(), before);
    }
}
