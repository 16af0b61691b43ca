//! Notifier that writes alerts to the log.
//!
//! Used when no external channel is configured.

use async_trait::async_trait;
use tracing::warn;

use super::{AdapterError, NotificationSink};
use crate::domain::AlertMessage;

#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl NotificationSink for LogNotifier {
    fn name(&self) -> &str {
        "log"
    }

    async fn publish(&self, alert: &AlertMessage) -> Result<(), AdapterError> {
        warn!(
            artifact_id = %alert.artifact_id,
            risk_level = %alert.risk_level,
            risk_score = ?alert.risk_score,
            confidence = alert.confidence,
            source = %alert.source_location,
            "{}",
            alert.subject()
        );
        Ok(())
    }
}
