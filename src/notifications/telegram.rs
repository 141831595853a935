use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::Notifier;

const TELEGRAM_API: &str = "https://api.telegram.org";

#[derive(Debug, Serialize)]
struct SendMessageRequest<'a> {
    chat_id: &'a str,
    text: &'a str,
    disable_web_page_preview: bool,
}

#[derive(Debug, Deserialize)]
struct TelegramResponse {
    ok: bool,
    description: Option<String>,
}

/// Sends messages through the Telegram Bot API
#[derive(Debug, Clone)]
pub struct TelegramNotifier {
    client: Client,
    bot_token: String,
    chat_id: String,
    base_url: String,
}

impl TelegramNotifier {
    pub fn new(bot_token: String, chat_id: String, timeout: Duration) -> Result<Self> {
        if bot_token.is_empty() || chat_id.is_empty() {
            return Err(anyhow!("Telegram bot token and chat id are required"));
        }
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            bot_token,
            chat_id,
            base_url: TELEGRAM_API.to_string(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn send_message_url(&self) -> String {
        format!("{}/bot{}/sendMessage", self.base_url, self.bot_token)
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send(&self, message: String) -> Result<()> {
        let request = SendMessageRequest {
            chat_id: &self.chat_id,
            text: &message,
            disable_web_page_preview: true,
        };
        let resp: TelegramResponse = self
            .client
            .post(self.send_message_url())
            .json(&request)
            .send()
            .await?
            .json()
            .await?;

        if !resp.ok {
            return Err(anyhow!(
                "Telegram rejected message: {}",
                resp.description.unwrap_or_else(|| "no description".to_string())
            ));
        }
        debug!("Telegram message delivered to {}", self.chat_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requires_credentials() {
        assert!(TelegramNotifier::new(String::new(), "42".into(), Duration::from_secs(5)).is_err());
        assert!(TelegramNotifier::new("token".into(), String::new(), Duration::from_secs(5)).is_err());
    }

    #[test]
    fn test_send_message_url() {
        let notifier = TelegramNotifier::new("123:abc".into(), "42".into(), Duration::from_secs(5))
            .unwrap()
            .with_base_url("http://localhost:9999");
        assert_eq!(notifier.send_message_url(), "http://localhost:9999/bot123:abc/sendMessage");
    }

    #[test]
    fn test_request_payload() {
        let request = SendMessageRequest {
            chat_id: "42",
            text: "Model Promoted",
            disable_web_page_preview: true,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["chat_id"], "42");
        assert_eq!(json["text"], "Model Promoted");
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_an_error() {
        let notifier = TelegramNotifier::new("t".into(), "42".into(), Duration::from_millis(500))
            .unwrap()
            .with_base_url("http://127.0.0.1:1");
        assert!(notifier.send("hello".to_string()).await.is_err());
    }
}
