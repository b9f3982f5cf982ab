use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use super::{ApiError, FeedError, MarketFeed, SnapshotSource, TickStream};
use crate::models::{Candle, Tick};

pub const BINANCE_REST_BASE: &str = "https://api.binance.com";
pub const BINANCE_WS_BASE: &str = "wss://stream.binance.com:9443";
const MAX_KLINE_LIMIT: usize = 1000; // Exchange cap per request

/// Client for the public klines endpoint
#[derive(Clone)]
pub struct BinanceRestClient {
    client: Client,
    base_url: String,
}

impl BinanceRestClient {
    pub fn new(base_url: impl Into<String>, timeout: std::time::Duration) -> Result<Self, ApiError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl SnapshotSource for BinanceRestClient {
    async fn fetch_candles(
        &self,
        symbol: &str,
        interval: &str,
        count: usize,
    ) -> Result<Vec<Candle>, ApiError> {
        let url = format!("{}/api/v3/klines", self.base_url);
        let limit = count.clamp(1, MAX_KLINE_LIMIT).to_string();

        let response = self
            .client
            .get(&url)
            .query(&[("symbol", symbol), ("interval", interval), ("limit", limit.as_str())])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ApiError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let raw: Vec<serde_json::Value> = response.json().await?;
        let total = raw.len();
        let candles: Vec<Candle> = raw.iter().filter_map(parse_kline_row).collect();

        if candles.len() < total {
            tracing::warn!(
                symbol,
                skipped = total - candles.len(),
                "Skipped malformed kline rows"
            );
        }
        tracing::debug!(symbol, interval, count = candles.len(), "Fetched klines");
        Ok(candles)
    }
}

/// `[open_time, "open", "high", "low", "close", "volume", close_time, ...]`
fn parse_kline_row(row: &serde_json::Value) -> Option<Candle> {
    let arr = row.as_array()?;
    if arr.len() < 6 {
        return None;
    }
    let candle = Candle {
        open_time_ms: arr[0].as_i64()?,
        open: arr[1].as_str()?.parse().ok()?,
        high: arr[2].as_str()?.parse().ok()?,
        low: arr[3].as_str()?.parse().ok()?,
        close: arr[4].as_str()?.parse().ok()?,
        volume: arr[5].as_str()?.parse().ok()?,
    };
    candle.is_valid().then_some(candle)
}

#[derive(Debug, Deserialize)]
struct KlineEvent {
    k: KlinePayload,
}

#[derive(Debug, Deserialize)]
struct KlinePayload {
    #[serde(rename = "t")]
    open_time: i64,
    #[serde(rename = "c")]
    close: String,
    #[serde(rename = "x")]
    is_final: bool,
    #[serde(rename = "v")]
    volume: String,
}

/// Decode one `<symbol>@kline_<interval>` push; None for anything else
pub fn parse_kline_message(text: &str) -> Option<Tick> {
    let event: KlineEvent = serde_json::from_str(text).ok()?;
    Some(Tick {
        close_price: event.k.close.parse().ok()?,
        interval_final: event.k.is_final,
        volume: event.k.volume.parse().ok()?,
        open_time_ms: event.k.open_time,
    })
}

/// Websocket kline subscription
#[derive(Clone)]
pub struct BinanceKlineStream {
    base_url: String,
}

impl BinanceKlineStream {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn stream_url(&self, symbol: &str, interval: &str) -> String {
        format!(
            "{}/ws/{}@kline_{}",
            self.base_url,
            symbol.to_lowercase(),
            interval
        )
    }
}

impl Default for BinanceKlineStream {
    fn default() -> Self {
        Self::new(BINANCE_WS_BASE)
    }
}

#[async_trait]
impl MarketFeed for BinanceKlineStream {
    async fn subscribe(&self, symbol: &str, interval: &str) -> Result<TickStream, FeedError> {
        let url = self.stream_url(symbol, interval);
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| FeedError::Connect(e.to_string()))?;
        tracing::info!(%url, "Kline stream connected");

        let ticks = ws_stream.filter_map(|message| async move {
            match message {
                Ok(Message::Text(text)) => match parse_kline_message(&text) {
                    Some(tick) => Some(Ok(tick)),
                    None => {
                        tracing::debug!(payload = %text, "Ignoring unrecognized message");
                        None
                    }
                },
                Ok(Message::Close(frame)) => {
                    tracing::info!(?frame, "Kline stream closed by server");
                    Some(Err(FeedError::Closed))
                }
                Ok(_) => None,
                Err(e) => Some(Err(FeedError::WebSocket(e.to_string()))),
            }
        });

        Ok(ticks.boxed())
    }
}
