//! Fire-and-forget delivery of cycle reports.

use async_trait::async_trait;
use coffer_core::Settings;
use reqwest::Client;
use serde_json::json;
use tracing::{debug, warn};

const TELEGRAM_API: &str = "https://api.telegram.org";

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver `lines` as one message. Never fails the caller.
    async fn send(&self, lines: &[String]);
}

/// Drops every message.
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn send(&self, lines: &[String]) {
        debug!(lines = lines.len(), "notification dropped, no notifier configured");
    }
}

/// Sends messages to Telegram chats through the Bot API.
pub struct TelegramNotifier {
    client: Client,
    api_base: String,
    token: String,
    chat_ids: Vec<i64>,
}

impl TelegramNotifier {
    pub fn new(token: impl Into<String>, chat_ids: Vec<i64>) -> Self {
        Self {
            client: Client::new(),
            api_base: TELEGRAM_API.to_string(),
            token: token.into(),
            chat_ids,
        }
    }

    /// `None` unless both a bot token and at least one chat id are configured.
    pub fn from_settings(settings: &Settings) -> Option<Self> {
        let token = settings.telegram_bot_token.as_deref().filter(|t| !t.is_empty())?;
        if settings.telegram_chat_ids.is_empty() {
            return None;
        }
        Some(Self::new(token, settings.telegram_chat_ids.clone()))
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    async fn send_to(&self, chat_id: i64, text: &str) {
        let url = format!("{}/bot{}/sendMessage", self.api_base, self.token);
        let payload = json!({
            "chat_id": chat_id,
            "text": text,
            "disable_web_page_preview": true,
        });

        match self.client.post(&url).json(&payload).send().await {
            Ok(response) if response.status().is_success() => {
                debug!(chat_id, "telegram notification sent");
            }
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                warn!(chat_id, %status, %body, "telegram API rejected notification");
            }
            Err(e) => warn!(chat_id, error = %e, "failed to send telegram notification"),
        }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send(&self, lines: &[String]) {
        if lines.is_empty() {
            return;
        }
        let text = lines.join("\n");
        futures::future::join_all(self.chat_ids.iter().map(|id| self.send_to(*id, &text))).await;
    }
}
