//! Webhook notifier for alert fan-out.
//!
//! Endpoint: POST {url}
//! Auth: Bearer token (optional)

use async_trait::async_trait;
use serde::Serialize;

use super::{AdapterError, NotificationSink};
use crate::domain::{AlertMessage, RiskLevel};

/// Webhook client
pub struct WebhookNotifier {
    endpoint: String,
    token: Option<String>,
    client: reqwest::Client,
}

/// Payload posted for each alert
#[derive(Debug, Serialize)]
pub struct AlertPayload<'a> {
    pub subject: String,
    pub message: String,
    pub artifact_id: &'a str,
    pub risk_level: RiskLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk_score: Option<u8>,
    pub confidence: f64,
    pub source_location: &'a str,
    pub generated_at: String,
}

impl<'a> AlertPayload<'a> {
    pub fn from_alert(alert: &'a AlertMessage) -> Self {
        Self {
            subject: alert.subject(),
            message: alert.render_text(),
            artifact_id: &alert.artifact_id,
            risk_level: alert.risk_level,
            risk_score: alert.risk_score,
            confidence: alert.confidence,
            source_location: &alert.source_location,
            generated_at: alert.generated_at.to_rfc3339(),
        }
    }
}

impl WebhookNotifier {
    /// Create a new client
    pub fn new(endpoint: String, token: Option<String>) -> Self {
        Self {
            endpoint,
            token,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl NotificationSink for WebhookNotifier {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn publish(&self, alert: &AlertMessage) -> Result<(), AdapterError> {
        let payload = AlertPayload::from_alert(alert);

        let mut request = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .json(&payload);

        if let Some(ref token) = self.token {
            request = request.header("Authorization", format!("Bearer {}", token));
        }

        let response = request.send().await.map_err(AdapterError::from_reqwest)?;

        // 202 Accepted is expected for async fan-out
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let text = response.text().await.unwrap_or_default();
            Err(AdapterError::from_http_status(status.as_u16(), text))
        }
    }
}
