// Exchange and notification adapters
pub mod binance;
pub mod telegram;

pub use binance::{BinanceKlineStream, BinanceRestClient};
pub use telegram::TelegramClient;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use thiserror::Error;

use crate::models::{Candle, Tick};

/// REST / notification transport failures
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed response: {0}")]
    Decode(String),
}

/// Market stream failures; all of them are recoverable by reconnecting
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("websocket error: {0}")]
    WebSocket(String),

    #[error("stream closed by server")]
    Closed,

    #[error("no data for {0:?}")]
    IdleTimeout(std::time::Duration),

    #[error("snapshot unavailable: {0}")]
    Snapshot(String),
}

pub type TickStream = BoxStream<'static, Result<Tick, FeedError>>;

/// Opaque id of a delivered notification, used to edit it later
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageHandle(pub i64);

/// Historical candles for seeding and refreshing the signal window
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Most recent `count` candles, oldest first; the last one may still be forming
    async fn fetch_candles(
        &self,
        symbol: &str,
        interval: &str,
        count: usize,
    ) -> Result<Vec<Candle>, ApiError>;
}

/// Live tick subscription
#[async_trait]
pub trait MarketFeed: Send + Sync {
    async fn subscribe(&self, symbol: &str, interval: &str) -> Result<TickStream, FeedError>;
}

/// Outbound text channel
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send(&self, text: &str) -> Result<MessageHandle, ApiError>;

    async fn edit(&self, handle: MessageHandle, text: &str) -> Result<MessageHandle, ApiError>;
}
