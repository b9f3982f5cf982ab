use crate::models::Candle;
use std::collections::VecDeque;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BufferError {
    #[error("candle buffer is empty")]
    Empty,
    #[error("invalid price {0}")]
    InvalidPrice(f64),
    #[error("snapshot rejected: {0}")]
    InvalidSnapshot(String),
    #[error("snapshot too short: {got} candles, need {need}")]
    TooShort { got: usize, need: usize },
}

/// Rolling window of signal-interval candles for one instrument
///
/// Every candle except the last is final. The last one is still forming and
/// its close is repainted by each tick until it rolls.
#[derive(Debug, Clone)]
pub struct CandleBuffer {
    candles: VecDeque<Candle>,
    max_candles: usize,
    generation: u64,
    rolls: u64,
}

impl CandleBuffer {
    /// Create a new candle buffer
    ///
    /// # Arguments
    /// * `max_candles` - Maximum number of candles to keep
    pub fn new(max_candles: usize) -> Self {
        Self {
            candles: VecDeque::with_capacity(max_candles),
            max_candles: max_candles.max(1),
            generation: 0,
            rolls: 0,
        }
    }

    /// Replace the whole window (seeding or rehydration)
    ///
    /// Keeps the newest `max_candles` candles and bumps the generation so
    /// derived state knows it has to be rebuilt.
    pub fn replace(&mut self, candles: Vec<Candle>) -> Result<(), BufferError> {
        if candles.is_empty() {
            return Err(BufferError::InvalidSnapshot("no candles".to_string()));
        }
        if let Some(bad) = candles.iter().find(|c| !c.is_valid()) {
            return Err(BufferError::InvalidSnapshot(format!(
                "invalid candle at {}",
                bad.open_time_ms
            )));
        }
        if candles
            .windows(2)
            .any(|w| w[1].open_time_ms <= w[0].open_time_ms)
        {
            return Err(BufferError::InvalidSnapshot(
                "candles out of order".to_string(),
            ));
        }

        let skip = candles.len().saturating_sub(self.max_candles);
        self.candles = candles.into_iter().skip(skip).collect();
        self.generation += 1;
        Ok(())
    }

    /// Overwrite the forming candle's close with the latest price
    pub fn repaint(&mut self, price: f64) -> Result<(), BufferError> {
        if !price.is_finite() || price <= 0.0 {
            return Err(BufferError::InvalidPrice(price));
        }
        let last = self.candles.back_mut().ok_or(BufferError::Empty)?;

        last.close = price;
        last.high = last.high.max(price);
        last.low = last.low.min(price);
        Ok(())
    }

    /// Start a new forming candle; the previous last candle becomes final
    ///
    /// If the buffer is full, removes the oldest candle
    pub fn roll(&mut self, open_time_ms: i64, price: f64) {
        self.candles.push_back(Candle::opened_at(open_time_ms, price));

        // Remove oldest if exceeds max
        while self.candles.len() > self.max_candles {
            self.candles.pop_front();
        }
        self.rolls += 1;
    }

    /// Close prices, oldest first (last one is forming)
    pub fn closes(&self) -> Vec<f64> {
        self.candles.iter().map(|c| c.close).collect()
    }

    /// Get all candles
    pub fn candles(&self) -> Vec<Candle> {
        self.candles.iter().copied().collect()
    }

    /// The forming candle
    pub fn last(&self) -> Option<&Candle> {
        self.candles.back()
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn max_candles(&self) -> usize {
        self.max_candles
    }

    /// Incremented on every `replace`
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Total number of `roll` calls since creation
    pub fn rolls(&self) -> u64 {
        self.rolls
    }
}
