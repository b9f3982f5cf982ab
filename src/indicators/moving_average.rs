use serde::{Deserialize, Serialize};

/// Smoothing applied to the oscillator to build the signal line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalSmoothing {
    /// Exponential, `alpha = 2 / (period + 1)`, seeded by the SMA of the first `period` values
    #[default]
    Ema,
    /// Linearly weighted, newest value weighted `period`
    Wma,
}

impl SignalSmoothing {
    /// Smooth a full series, returning the latest value
    pub fn apply(&self, values: &[f64], period: usize) -> Option<f64> {
        match self {
            SignalSmoothing::Ema => calculate_ema(values, period),
            SignalSmoothing::Wma => calculate_wma(values, period),
        }
    }
}

/// EMA smoothing factor
pub fn ema_alpha(period: usize) -> f64 {
    2.0 / (period as f64 + 1.0)
}

/// Calculate Simple Moving Average (SMA)
pub fn calculate_sma(prices: &[f64], period: usize) -> Option<f64> {
    if period == 0 || prices.len() < period {
        return None;
    }

    let sum: f64 = prices.iter().rev().take(period).sum();
    Some(sum / period as f64)
}

/// Calculate Exponential Moving Average (EMA)
pub fn calculate_ema(prices: &[f64], period: usize) -> Option<f64> {
    if period == 0 || prices.len() < period {
        return None;
    }

    let alpha = ema_alpha(period);

    // Start with SMA
    let initial_sma = calculate_sma(&prices[0..period], period)?;

    // Calculate EMA
    let mut ema = initial_sma;
    for price in &prices[period..] {
        ema = alpha * price + (1.0 - alpha) * ema;
    }

    Some(ema)
}

/// Calculate Weighted Moving Average (WMA) over the last `period` values
pub fn calculate_wma(prices: &[f64], period: usize) -> Option<f64> {
    if period == 0 || prices.len() < period {
        return None;
    }

    Some(weighted_mean(&prices[prices.len() - period..]))
}

/// Linear weights 1..=n, oldest first
pub(crate) fn weighted_mean(window: &[f64]) -> f64 {
    let n = window.len() as f64;
    let numerator: f64 = window
        .iter()
        .enumerate()
        .map(|(i, v)| (i as f64 + 1.0) * v)
        .sum();
    numerator / (n * (n + 1.0) / 2.0)
}
