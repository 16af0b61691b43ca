//! Telegram Bot API notifier.
//!
//! Sends the rendered alert text to a chat with `sendMessage`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{AdapterError, NotificationSink};
use crate::domain::AlertMessage;

/// Telegram's hard limit on message length
const MAX_MESSAGE_CHARS: usize = 4096;

/// Telegram Bot API client
pub struct TelegramNotifier {
    /// Bot token
    bot_token: String,
    /// Target chat ID
    chat_id: String,
    /// API base (overridable for tests)
    api_base: String,
    /// HTTP client
    client: reqwest::Client,
}

/// Response from Telegram API
#[derive(Debug, Deserialize)]
struct TelegramResponse {
    ok: bool,
    description: Option<String>,
    error_code: Option<u16>,
}

/// Configuration for Telegram notifier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    pub bot_token: String,
    pub chat_id: String,
}

impl TelegramNotifier {
    /// Create a new Telegram client
    pub fn new(bot_token: String, chat_id: String) -> Self {
        Self {
            bot_token,
            chat_id,
            api_base: "https://api.telegram.org".to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// Create from config
    pub fn from_config(config: TelegramConfig) -> Self {
        Self::new(config.bot_token, config.chat_id)
    }

    /// Point the client at a different API host
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    /// Build API URL
    fn api_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.bot_token, method)
    }

    /// Format the alert as one chat message
    fn format_message(alert: &AlertMessage) -> String {
        let text = format!("{}\n\n{}", alert.subject(), alert.render_text());
        if text.chars().count() <= MAX_MESSAGE_CHARS {
            return text;
        }
        let mut truncated: String = text.chars().take(MAX_MESSAGE_CHARS - 1).collect();
        truncated.push('…');
        truncated
    }
}

#[async_trait]
impl NotificationSink for TelegramNotifier {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn publish(&self, alert: &AlertMessage) -> Result<(), AdapterError> {
        let url = self.api_url("sendMessage");

        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({
                "chat_id": self.chat_id,
                "text": Self::format_message(alert),
            }))
            .send()
            .await
            .map_err(AdapterError::from_reqwest)?;

        let status = response.status().as_u16();
        let result: TelegramResponse = response.json().await.map_err(AdapterError::from_reqwest)?;

        if !result.ok {
            return Err(AdapterError::from_http_status(
                result.error_code.unwrap_or(status),
                format!("Telegram API error: {}", result.description.unwrap_or_default()),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RiskLevel;
    use chrono::Utc;

    #[test]
    fn test_api_url() {
        let client = TelegramNotifier::new("TOKEN".to_string(), "123".to_string());
        assert_eq!(
            client.api_url("sendMessage"),
            "https://api.telegram.org/botTOKEN/sendMessage"
        );
    }

    #[test]
    fn test_long_messages_truncated() {
        let alert = AlertMessage {
            artifact_id: "seg-001".to_string(),
            risk_level: RiskLevel::High,
            risk_score: Some(7),
            confidence: 0.8,
            summary: "Vandalism".to_string(),
            body: "Hello team".to_string(),
            full_analysis: "x".repeat(10_000),
            source_location: "seg-001.mp4".to_string(),
            generated_at: Utc::now(),
        };

        let text = TelegramNotifier::format_message(&alert);
        assert_eq!(text.chars().count(), MAX_MESSAGE_CHARS);
        assert!(text.starts_with("High Risk Alert: Vandalism"));
    }
}
