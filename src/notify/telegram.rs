//! Telegram Bot API notifier.
//!
//! Endpoint: `POST https://api.telegram.org/bot{token}/sendMessage`
//! The bot token is part of the URL, so it is never logged.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

use super::Notifier;

const API_BASE: &str = "https://api.telegram.org";

#[derive(Debug, Serialize)]
struct SendMessageRequest<'a> {
    chat_id: &'a str,
    text: &'a str,
    disable_web_page_preview: bool,
}

pub struct TelegramNotifier {
    http: Client,
    bot_token: SecretString,
    chat_id: String,
}

impl TelegramNotifier {
    pub fn new(bot_token: SecretString, chat_id: String, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client for Telegram")?;

        Ok(Self { http, bot_token, chat_id })
    }

    fn request<'a>(&'a self, text: &'a str) -> SendMessageRequest<'a> {
        SendMessageRequest {
            chat_id: &self.chat_id,
            text,
            disable_web_page_preview: true,
        }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send(&self, text: &str) -> Result<()> {
        let url = format!("{API_BASE}/bot{}/sendMessage", self.bot_token.expose_secret());

        let resp = self
            .http
            .post(&url)
            .json(&self.request(text))
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Telegram request failed: {}", e.without_url()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Telegram send failed {status}: {body}");
        }

        debug!(chat_id = %self.chat_id, "Telegram message delivered");
        Ok(())
    }
}
