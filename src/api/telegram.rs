use async_trait::async_trait;
use governor::{Quota, RateLimiter};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;
use std::sync::Arc;

use super::{ApiError, MessageHandle, NotificationSink};

pub const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

type TelegramRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Bot API client bound to one chat
///
/// Cloneable; clones share the rate limiter (one message per second, the
/// per-chat limit of the Bot API).
#[derive(Clone)]
pub struct TelegramClient {
    client: Client,
    base_url: String,
    token: String,
    chat_id: String,
    rate_limiter: Arc<TelegramRateLimiter>,
}

#[derive(Debug, Serialize)]
struct SendMessageRequest<'a> {
    chat_id: &'a str,
    text: &'a str,
    parse_mode: &'static str,
}

#[derive(Debug, Serialize)]
struct EditMessageRequest<'a> {
    chat_id: &'a str,
    message_id: i64,
    text: &'a str,
    parse_mode: &'static str,
}

#[derive(Debug, Deserialize)]
struct TelegramResponse {
    ok: bool,
    result: Option<SentMessage>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    message_id: i64,
}

impl TelegramClient {
    pub fn new(token: String, chat_id: String) -> Result<Self, ApiError> {
        Self::with_base_url(TELEGRAM_API_BASE, token, chat_id)
    }

    pub fn with_base_url(
        base_url: impl Into<String>,
        token: String,
        chat_id: String,
    ) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            chat_id,
            rate_limiter: Arc::new(RateLimiter::direct(Quota::per_second(NonZeroU32::MIN))),
        })
    }

    async fn call<T: Serialize + ?Sized>(
        &self,
        method: &str,
        body: &T,
    ) -> Result<TelegramResponse, ApiError> {
        self.rate_limiter.until_ready().await;

        let url = format!("{}/bot{}/{}", self.base_url, self.token, method);
        let response = self.client.post(&url).json(body).send().await?;
        let status = response.status();
        let text = response.text().await?;

        let parsed: TelegramResponse = serde_json::from_str(&text)
            .map_err(|_| ApiError::Status {
                status: status.as_u16(),
                body: text.clone(),
            })?;
        if !parsed.ok {
            return Err(ApiError::Status {
                status: status.as_u16(),
                body: parsed.description.unwrap_or(text),
            });
        }
        Ok(parsed)
    }
}

#[async_trait]
impl NotificationSink for TelegramClient {
    async fn send(&self, text: &str) -> Result<MessageHandle, ApiError> {
        let request = SendMessageRequest {
            chat_id: &self.chat_id,
            text,
            parse_mode: "Markdown",
        };
        let response = self.call("sendMessage", &request).await?;
        let sent = response
            .result
            .ok_or_else(|| ApiError::Decode("sendMessage returned no message".to_string()))?;
        Ok(MessageHandle(sent.message_id))
    }

    async fn edit(&self, handle: MessageHandle, text: &str) -> Result<MessageHandle, ApiError> {
        let request = EditMessageRequest {
            chat_id: &self.chat_id,
            message_id: handle.0,
            text,
            parse_mode: "Markdown",
        };
        match self.call("editMessageText", &request).await {
            Ok(_) => Ok(handle),
            // Same text twice is rejected by the API but leaves the message as wanted
            Err(ApiError::Status { body, .. }) if body.contains("message is not modified") => {
                Ok(handle)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn client(server: &mockito::Server) -> TelegramClient {
        TelegramClient::with_base_url(server.url(), "TOKEN".into(), "42".into()).unwrap()
    }

    #[tokio::test]
    async fn test_send_returns_message_id() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/botTOKEN/sendMessage")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "chat_id": "42",
                "text": "*hello*",
                "parse_mode": "Markdown"
            })))
            .with_status(200)
            .with_body(r#"{"ok":true,"result":{"message_id":777,"date":0}}"#)
            .create_async()
            .await;

        let handle = client(&server).send("*hello*").await.unwrap();

        mock.assert_async().await;
        assert_eq!(handle, MessageHandle(777));
    }

    #[tokio::test]
    async fn test_edit_targets_handle() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/botTOKEN/editMessageText")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "chat_id": "42",
                "message_id": 777
            })))
            .with_status(200)
            .with_body(r#"{"ok":true,"result":{"message_id":777}}"#)
            .create_async()
            .await;

        let handle = client(&server)
            .edit(MessageHandle(777), "updated")
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(handle, MessageHandle(777));
    }

    #[tokio::test]
    async fn test_unmodified_edit_is_not_an_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/botTOKEN/editMessageText")
            .with_status(400)
            .with_body(
                r#"{"ok":false,"error_code":400,"description":"Bad Request: message is not modified"}"#,
            )
            .create_async()
            .await;

        let result = client(&server).edit(MessageHandle(5), "same").await;
        assert_eq!(result.unwrap(), MessageHandle(5));
    }

    #[tokio::test]
    async fn test_api_error_is_surfaced() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/botTOKEN/sendMessage")
            .with_status(401)
            .with_body(r#"{"ok":false,"error_code":401,"description":"Unauthorized"}"#)
            .create_async()
            .await;

        let err = client(&server).send("hi").await.unwrap_err();
        match err {
            ApiError::Status { status, body } => {
                assert_eq!(status, 401);
                assert_eq!(body, "Unauthorized");
            }
            other => panic!("unexpected error {:?}", other),
        }
    }
}
