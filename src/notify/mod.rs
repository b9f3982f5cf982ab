//! Outbound notifications.
//!
//! The engine never awaits delivery: events go over an unbounded channel to a
//! notifier task that owns the sink and the trade-log message state.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::api::{ApiError, MessageHandle, NotificationSink, TelegramClient};
use crate::execution::position_manager::{ClosedTrade, ExitReason, LifecycleEvent, Position};
use crate::models::CrossoverEvent;
use crate::risk::LedgerSnapshot;

#[derive(Debug, Clone)]
pub enum Notification {
    Lifecycle(LifecycleEvent),
    Text(String),
}

/// Cheap, cloneable sender side of the notifier
#[derive(Debug, Clone)]
pub struct NotifierHandle {
    tx: mpsc::UnboundedSender<Notification>,
}

impl NotifierHandle {
    pub fn lifecycle(&self, event: LifecycleEvent) {
        self.notify(Notification::Lifecycle(event));
    }

    pub fn text(&self, text: impl Into<String>) {
        self.notify(Notification::Text(text.into()));
    }

    pub fn notify(&self, notification: Notification) {
        if self.tx.send(notification).is_err() {
            tracing::warn!("Notifier task is gone, dropping notification");
        }
    }

    /// Handle whose notifications go nowhere (tests, dry runs)
    pub fn detached() -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self { tx }
    }
}

/// Formats lifecycle events and keeps the live trade message up to date
pub struct Notifier {
    sink: Arc<dyn NotificationSink>,
    symbol: String,
    trade_message: Option<MessageHandle>,
    trade_log: Vec<String>,
}

impl Notifier {
    pub fn new(sink: Arc<dyn NotificationSink>, symbol: impl Into<String>) -> Self {
        Self {
            sink,
            symbol: symbol.into(),
            trade_message: None,
            trade_log: Vec::new(),
        }
    }

    /// Start the notifier task; it exits once every handle is dropped
    pub fn spawn(self) -> (NotifierHandle, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut notifier = self;

        let task = tokio::spawn(async move {
            while let Some(notification) = rx.recv().await {
                notifier.handle(notification).await;
            }
            tracing::debug!("Notifier channel closed");
        });

        (NotifierHandle { tx }, task)
    }

    pub async fn handle(&mut self, notification: Notification) {
        match notification {
            Notification::Text(text) => {
                self.deliver(&text).await;
            }
            Notification::Lifecycle(LifecycleEvent::Opened {
                position,
                trigger,
                ledger,
            }) => {
                self.trade_log = vec![format_open(&self.symbol, &position, &trigger, &ledger)];
                self.trade_message = self.deliver(&self.trade_log.join("\n")).await;
            }
            Notification::Lifecycle(LifecycleEvent::StageAdvanced {
                stage,
                price,
                new_stop,
                banked,
                ..
            }) => {
                let mut line = format!(
                    "✅ *{}* at `{:.4}` · stop → `{:.4}`",
                    stage.label(),
                    price,
                    new_stop
                );
                if let Some(amount) = banked {
                    line.push_str(&format!(" · banked `${:.2}`", amount));
                }
                self.trade_log.push(line);

                let text = self.trade_log.join("\n");
                self.trade_message = match self.trade_message {
                    Some(handle) => match self.sink.edit(handle, &text).await {
                        Ok(handle) => Some(handle),
                        Err(e) => {
                            tracing::warn!("Failed to edit trade message: {}", e);
                            Some(handle)
                        }
                    },
                    None => self.deliver(&text).await,
                };
            }
            Notification::Lifecycle(LifecycleEvent::StopTrailed {
                new_stop,
                highest_price,
            }) => {
                // Too frequent for the chat
                tracing::debug!(new_stop, highest_price, "Stop trailed");
            }
            Notification::Lifecycle(LifecycleEvent::Closed { trade, ledger }) => {
                self.deliver(&format_close(&self.symbol, &trade, &ledger))
                    .await;
                self.trade_message = None;
                self.trade_log.clear();
            }
        }
    }

    async fn deliver(&self, text: &str) -> Option<MessageHandle> {
        match self.sink.send(text).await {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::warn!("Failed to send notification: {}", e);
                None
            }
        }
    }
}

pub fn format_open(
    symbol: &str,
    position: &Position,
    trigger: &CrossoverEvent,
    ledger: &LedgerSnapshot,
) -> String {
    format!(
        "🚀 *{} LONG*\nEntry `{:.4}` · Stop `{:.4}`\nRisk `${:.2}` · RSI `{:.2}` > signal `{:.2}`\nBalance `${:.2}`",
        symbol,
        position.entry_price,
        position.initial_stop_price,
        position.risk_amount_usd,
        trigger.oscillator,
        trigger.signal,
        ledger.balance
    )
}

pub fn format_close(symbol: &str, trade: &ClosedTrade, ledger: &LedgerSnapshot) -> String {
    let outcome = if trade.is_win { "🟢 WIN" } else { "🔴 LOSS" };
    let reason = match trade.reason {
        ExitReason::StopLoss => "stop loss",
        ExitReason::ProtectiveStop => "protective stop",
        ExitReason::TrailingStop => "trailing stop",
        ExitReason::TakeProfit => "take profit",
    };
    format!(
        "{} *{}* ({})\nEntry `{:.4}` → Exit `{:.4}`\nPnL `${:.2}` ({:+.2}R)\nBalance `${:.2}` · W/L {}/{}",
        outcome,
        symbol,
        reason,
        trade.entry_price,
        trade.exit_price,
        trade.total_pnl,
        trade.r_multiple,
        ledger.balance,
        ledger.wins,
        ledger.losses
    )
}

/// Writes messages to the log instead of a chat
#[derive(Debug, Default)]
pub struct LogSink {
    next_id: AtomicI64,
}

#[async_trait]
impl NotificationSink for LogSink {
    async fn send(&self, text: &str) -> Result<MessageHandle, ApiError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::info!(message_id = id, "📨 {}", text);
        Ok(MessageHandle(id))
    }

    async fn edit(&self, handle: MessageHandle, text: &str) -> Result<MessageHandle, ApiError> {
        tracing::info!(message_id = handle.0, "✏️ {}", text);
        Ok(handle)
    }
}

/// Telegram when `TELEGRAM_TOKEN` and `TELEGRAM_CHAT_ID` are set, the log otherwise
pub fn sink_from_env() -> Result<Arc<dyn NotificationSink>, ApiError> {
    let token = std::env::var("TELEGRAM_TOKEN").ok().filter(|t| !t.trim().is_empty());
    let chat_id = std::env::var("TELEGRAM_CHAT_ID").ok().filter(|c| !c.trim().is_empty());

    match (token, chat_id) {
        (Some(token), Some(chat_id)) => {
            tracing::info!("Telegram notifications enabled");
            Ok(Arc::new(TelegramClient::new(
                token.trim().to_string(),
                chat_id.trim().to_string(),
            )?))
        }
        _ => {
            tracing::warn!("TELEGRAM_TOKEN / TELEGRAM_CHAT_ID not set, notifications go to the log");
            Ok(Arc::new(LogSink::default()))
        }
    }
}
