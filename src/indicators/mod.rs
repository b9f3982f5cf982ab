// Technical indicators module
// Wilder RSI and its smoothed signal line

pub mod engine;
pub mod moving_average;
pub mod rsi;

pub use engine::{
    IndicatorEngine, IndicatorReading, IndicatorSettings, IndicatorState, NEUTRAL_OSCILLATOR,
};
pub use moving_average::{calculate_ema, calculate_sma, calculate_wma, SignalSmoothing};
pub use rsi::{calculate_rsi, calculate_rsi_series, WilderAccumulator};
