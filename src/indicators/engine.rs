use std::collections::VecDeque;

use super::moving_average::{ema_alpha, weighted_mean, SignalSmoothing};
use super::rsi::WilderAccumulator;
use crate::execution::CandleBuffer;

/// Oscillator midpoint reported while the window is too short
pub const NEUTRAL_OSCILLATOR: f64 = 50.0;

/// Minimum number of oscillator values kept for the signal line
const MIN_HISTORY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndicatorSettings {
    pub oscillator_period: usize,
    pub signal_period: usize,
    pub smoothing: SignalSmoothing,
}

impl Default for IndicatorSettings {
    fn default() -> Self {
        Self {
            oscillator_period: 14,
            signal_period: 9,
            smoothing: SignalSmoothing::Ema,
        }
    }
}

impl IndicatorSettings {
    /// Closes needed before the oscillator is defined
    pub fn min_window(&self) -> usize {
        self.oscillator_period + 1
    }
}

/// Oscillator and signal at the forming candle, plus the values at the
/// previous (finalized) candle
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndicatorReading {
    pub oscillator: f64,
    pub signal: f64,
    pub previous_oscillator: f64,
    pub previous_signal: f64,
}

impl IndicatorReading {
    pub fn neutral() -> Self {
        Self {
            oscillator: NEUTRAL_OSCILLATOR,
            signal: NEUTRAL_OSCILLATOR,
            previous_oscillator: NEUTRAL_OSCILLATOR,
            previous_signal: NEUTRAL_OSCILLATOR,
        }
    }
}

/// Indicator state committed over finalized closes
#[derive(Debug, Clone)]
pub struct IndicatorState {
    pub oscillator: f64,
    /// Signal line, None until `signal_period` oscillator values exist
    pub smoothed_oscillator: Option<f64>,
    pub oscillator_history: VecDeque<f64>,
    accumulator: WilderAccumulator,
    history_cap: usize,
}

impl IndicatorState {
    /// Full recompute over `closes`
    pub fn from_closes(closes: &[f64], settings: &IndicatorSettings) -> Option<Self> {
        let accumulator = WilderAccumulator::seed(closes, settings.oscillator_period)?;
        let mut state = Self {
            oscillator: accumulator.oscillator(),
            smoothed_oscillator: None,
            oscillator_history: VecDeque::new(),
            accumulator,
            history_cap: settings.signal_period.max(MIN_HISTORY),
        };
        state.push_oscillator(state.oscillator, settings);

        for &close in &closes[settings.oscillator_period + 1..] {
            state.commit(close, settings);
        }
        Some(state)
    }

    /// Advance by one finalized close
    pub fn commit(&mut self, close: f64, settings: &IndicatorSettings) {
        self.accumulator = self.accumulator.step(close);
        self.oscillator = self.accumulator.oscillator();
        self.push_oscillator(self.oscillator, settings);
    }

    pub fn avg_gain(&self) -> f64 {
        self.accumulator.avg_gain
    }

    pub fn avg_loss(&self) -> f64 {
        self.accumulator.avg_loss
    }

    /// Last finalized close folded into the averages
    pub fn last_close(&self) -> f64 {
        self.accumulator.last_close
    }

    /// Signal at the last committed close
    pub fn signal(&self) -> f64 {
        self.smoothed_oscillator.unwrap_or(self.oscillator)
    }

    /// Oscillator and signal if `close` were the next value, without committing it
    pub fn peek(&self, close: f64, settings: &IndicatorSettings) -> (f64, f64) {
        let oscillator = self.accumulator.step(close).oscillator();
        let period = settings.signal_period;

        let signal = match settings.smoothing {
            SignalSmoothing::Ema => match self.smoothed_oscillator {
                Some(prev) => {
                    let alpha = ema_alpha(period);
                    alpha * oscillator + (1.0 - alpha) * prev
                }
                None if self.oscillator_history.len() + 1 == period => {
                    (self.oscillator_history.iter().sum::<f64>() + oscillator) / period as f64
                }
                None => oscillator,
            },
            SignalSmoothing::Wma => {
                if self.oscillator_history.len() + 1 < period {
                    oscillator
                } else {
                    let skip = self.oscillator_history.len() + 1 - period;
                    let window: Vec<f64> = self
                        .oscillator_history
                        .iter()
                        .skip(skip)
                        .copied()
                        .chain(std::iter::once(oscillator))
                        .collect();
                    weighted_mean(&window)
                }
            }
        };

        (oscillator, signal)
    }

    fn push_oscillator(&mut self, value: f64, settings: &IndicatorSettings) {
        self.oscillator_history.push_back(value);
        while self.oscillator_history.len() > self.history_cap {
            self.oscillator_history.pop_front();
        }

        let period = settings.signal_period;
        self.smoothed_oscillator = match settings.smoothing {
            SignalSmoothing::Ema => match self.smoothed_oscillator {
                Some(prev) => {
                    let alpha = ema_alpha(period);
                    Some(alpha * value + (1.0 - alpha) * prev)
                }
                None if self.oscillator_history.len() == period => {
                    Some(self.oscillator_history.iter().sum::<f64>() / period as f64)
                }
                None => None,
            },
            SignalSmoothing::Wma => {
                let len = self.oscillator_history.len();
                if len < period {
                    None
                } else {
                    let window: Vec<f64> = self
                        .oscillator_history
                        .iter()
                        .skip(len - period)
                        .copied()
                        .collect();
                    Some(weighted_mean(&window))
                }
            }
        };
    }
}

/// Incremental oscillator / signal-line engine over a [`CandleBuffer`]
///
/// Finalized closes are folded into a committed [`IndicatorState`] one at a
/// time as the buffer rolls. The forming candle is only peeked at. Whenever
/// the buffer was replaced (its generation changed) the committed state is
/// rebuilt from the whole refreshed window instead of being patched.
#[derive(Debug, Clone)]
pub struct IndicatorEngine {
    settings: IndicatorSettings,
    committed: Option<IndicatorState>,
    synced_generation: Option<u64>,
    synced_rolls: u64,
}

impl IndicatorEngine {
    pub fn new(settings: IndicatorSettings) -> Self {
        Self {
            settings,
            committed: None,
            synced_generation: None,
            synced_rolls: 0,
        }
    }

    pub fn settings(&self) -> &IndicatorSettings {
        &self.settings
    }

    /// Committed state over finalized closes, if warm
    pub fn state(&self) -> Option<&IndicatorState> {
        self.committed.as_ref()
    }

    /// Drop all accumulators; the next update recomputes from scratch
    pub fn reset(&mut self) {
        self.committed = None;
        self.synced_generation = None;
        self.synced_rolls = 0;
    }

    /// Bring the committed state in line with `buffer` and read the forming candle
    pub fn update(&mut self, buffer: &CandleBuffer) -> IndicatorReading {
        let closes = buffer.closes();
        let n = closes.len();

        if n < self.settings.min_window() {
            self.committed = None;
            self.mark_synced(buffer);
            return IndicatorReading::neutral();
        }

        let finalized = &closes[..n - 1];
        let live_close = closes[n - 1];
        let pending = buffer.rolls().saturating_sub(self.synced_rolls) as usize;
        let stale = self.synced_generation != Some(buffer.generation());

        let incremental = !stale && pending <= finalized.len() && self.committed.is_some();
        if incremental {
            if let Some(state) = self.committed.as_mut() {
                for &close in &finalized[finalized.len() - pending..] {
                    state.commit(close, &self.settings);
                }
            }
        } else {
            if stale && self.synced_generation.is_some() {
                tracing::debug!(
                    generation = buffer.generation(),
                    closes = n,
                    "Buffer replaced, recomputing indicators from scratch"
                );
            }
            self.committed = IndicatorState::from_closes(finalized, &self.settings);
        }
        self.mark_synced(buffer);

        match &self.committed {
            Some(state) => {
                let (oscillator, signal) = state.peek(live_close, &self.settings);
                IndicatorReading {
                    oscillator,
                    signal,
                    previous_oscillator: state.oscillator,
                    previous_signal: state.signal(),
                }
            }
            None => {
                // Exactly one full window: only the forming candle is defined
                let oscillator = WilderAccumulator::seed(&closes, self.settings.oscillator_period)
                    .map(|acc| acc.oscillator())
                    .unwrap_or(NEUTRAL_OSCILLATOR);
                IndicatorReading {
                    oscillator,
                    signal: oscillator,
                    previous_oscillator: NEUTRAL_OSCILLATOR,
                    previous_signal: NEUTRAL_OSCILLATOR,
                }
            }
        }
    }

    fn mark_synced(&mut self, buffer: &CandleBuffer) {
        self.synced_generation = Some(buffer.generation());
        self.synced_rolls = buffer.rolls();
    }
}
