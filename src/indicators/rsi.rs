/// Wilder smoothing accumulator for the Relative Strength Index (RSI)
///
/// Seeded with the arithmetic mean of the first `period` gains and losses,
/// then advanced one close at a time with
/// `avg = (avg * (period - 1) + current) / period`.
///
/// The accumulator is path dependent: two accumulators fed the same closes
/// from different starting points do not converge to identical values, so
/// after a data gap it has to be rebuilt from the full window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WilderAccumulator {
    pub avg_gain: f64,
    pub avg_loss: f64,
    pub last_close: f64,
    period: usize,
}

impl WilderAccumulator {
    /// Seed from `closes[..=period]`
    ///
    /// Returns None when fewer than `period + 1` closes are available.
    pub fn seed(closes: &[f64], period: usize) -> Option<Self> {
        if period == 0 || closes.len() < period + 1 {
            return None;
        }

        let mut gains = 0.0;
        let mut losses = 0.0;
        for window in closes[..=period].windows(2) {
            let change = window[1] - window[0];
            if change > 0.0 {
                gains += change;
            } else {
                losses += -change;
            }
        }

        Some(Self {
            avg_gain: gains / period as f64,
            avg_loss: losses / period as f64,
            last_close: closes[period],
            period,
        })
    }

    /// Advance by one close
    pub fn step(&self, close: f64) -> Self {
        let change = close - self.last_close;
        let gain = change.max(0.0);
        let loss = (-change).max(0.0);
        let weight = (self.period - 1) as f64;

        Self {
            avg_gain: (self.avg_gain * weight + gain) / self.period as f64,
            avg_loss: (self.avg_loss * weight + loss) / self.period as f64,
            last_close: close,
            period: self.period,
        }
    }

    pub fn period(&self) -> usize {
        self.period
    }

    /// Current oscillator value
    pub fn oscillator(&self) -> f64 {
        rsi_from_averages(self.avg_gain, self.avg_loss)
    }
}

/// `100 - 100 / (1 + rs)` with `rs = avg_gain / avg_loss`
///
/// `rs` is taken as 0 when there were no losses, so a window without any
/// down moves reads 0 rather than 100.
pub fn rsi_from_averages(avg_gain: f64, avg_loss: f64) -> f64 {
    let rs = if avg_loss > 0.0 {
        avg_gain / avg_loss
    } else {
        0.0
    };
    (100.0 - (100.0 / (1.0 + rs))).clamp(0.0, 100.0)
}

/// RSI for every close from index `period` onwards
///
/// The first value comes straight from the seed; every following value is
/// one Wilder step.
pub fn calculate_rsi_series(prices: &[f64], period: usize) -> Vec<f64> {
    let Some(mut acc) = WilderAccumulator::seed(prices, period) else {
        return Vec::new();
    };

    let mut series = Vec::with_capacity(prices.len() - period);
    series.push(acc.oscillator());
    for &price in &prices[period + 1..] {
        acc = acc.step(price);
        series.push(acc.oscillator());
    }
    series
}

/// Calculate the latest Wilder RSI
///
/// Values:
/// - RSI > 70: Overbought
/// - RSI < 30: Oversold
///
pub fn calculate_rsi(prices: &[f64], period: usize) -> Option<f64> {
    calculate_rsi_series(prices, period).last().copied()
}
