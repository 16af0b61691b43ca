//! Adapter interfaces for external systems.
//!
//! The orchestrator reaches every collaborator through one of these traits:
//! - `ArtifactStore`: fetches segment bytes
//! - `InferenceBackend`: runs the threat-analysis model
//! - `NotificationSink`: publishes alerts
//!
//! All of them report failures as `AdapterError`, which classifies each
//! failure as not-found, transient, or permanent.

pub mod command;
pub mod http_model;
pub mod inference;
pub mod log_sink;
pub mod store;
pub mod telegram;
pub mod webhook;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{AlertMessage, VideoSegment};

pub use command::CommandBackend;
pub use http_model::{HttpModelBackend, HttpModelConfig};
pub use inference::{InferenceClient, PromptSchema};
pub use log_sink::LogNotifier;
pub use store::{FsArtifactStore, HttpArtifactStore};
pub use telegram::{TelegramConfig, TelegramNotifier};
pub use webhook::WebhookNotifier;

/// How the orchestrator should react to a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// The artifact is gone; permanent
    NotFound,

    /// Expected to succeed on redelivery
    Transient,

    /// Will reproduce identically; never retried
    Permanent,
}

/// Errors reported by adapters
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AdapterError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Unsupported content: {0}")]
    UnsupportedContent(String),

    #[error("Content rejected by safety filter: {0}")]
    ContentRejected(String),

    #[error("Model output violates schema: {0}")]
    SchemaViolation(String),

    #[error("Permanent failure: {0}")]
    Permanent(String),
}

impl AdapterError {
    /// Classify this error for retry dispatch
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::NotFound(_) => ErrorCategory::NotFound,
            Self::Timeout(_) | Self::RateLimited(_) | Self::Transient(_) => ErrorCategory::Transient,
            Self::InvalidInput(_)
            | Self::UnsupportedContent(_)
            | Self::ContentRejected(_)
            | Self::SchemaViolation(_)
            | Self::Permanent(_) => ErrorCategory::Permanent,
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }

    /// Map an HTTP status code and response body to an error
    pub fn from_http_status(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        let message = format!("HTTP {}: {}", status, body.trim());

        match status {
            404 => Self::NotFound(message),
            408 => Self::Transient(message),
            429 => Self::RateLimited(message),
            413 | 415 => Self::UnsupportedContent(message),
            400 | 422 => Self::InvalidInput(message),
            500..=599 => Self::Transient(message),
            400..=499 => Self::Permanent(message),
            _ => Self::Transient(message),
        }
    }

    /// Map a transport-level HTTP client error
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return Self::from_http_status(status.as_u16(), err.to_string());
        }
        if err.is_builder() {
            return Self::Permanent(err.to_string());
        }
        // Connect, timeout, and body errors are all worth another delivery
        Self::Transient(err.to_string())
    }
}

/// Bytes and type of an object returned by an artifact store
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

/// Retrieves segment bytes by locator
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Human-readable store name
    fn name(&self) -> &str;

    /// Fetch the object at `locator`
    async fn get(&self, locator: &str) -> Result<StoredObject, AdapterError>;
}

/// A single inference call
#[derive(Debug, Clone, Copy)]
pub struct InferenceRequest<'a> {
    pub segment: &'a VideoSegment,
    pub system_prompt: &'a str,
    pub user_prompt: &'a str,
}

/// Runs the threat-analysis model and returns its raw text answer
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Human-readable backend name
    fn name(&self) -> &str;

    /// Execute one inference call
    async fn invoke(&self, request: InferenceRequest<'_>) -> Result<String, AdapterError>;
}

/// Publishes alerts to a fan-out channel
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Human-readable sink name
    fn name(&self) -> &str;

    /// Publish an alert; `Ok` means the sink accepted it
    async fn publish(&self, alert: &AlertMessage) -> Result<(), AdapterError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_from_http_status_429() {
        let err = AdapterError::from_http_status(429, "slow down");
        assert!(matches!(err, AdapterError::RateLimited(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_error_from_http_status_5xx() {
        for status in [500, 502, 503, 504] {
            let err = AdapterError::from_http_status(status, "server error");
            assert!(err.is_retryable(), "{} should be retryable", status);
        }
    }

    #[test]
    fn test_error_from_http_status_404() {
        let err = AdapterError::from_http_status(404, "no such key");
        assert_eq!(err.category(), ErrorCategory::NotFound);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_error_from_http_status_4xx_permanent() {
        assert!(matches!(
            AdapterError::from_http_status(400, "bad request"),
            AdapterError::InvalidInput(_)
        ));
        assert!(matches!(
            AdapterError::from_http_status(415, "unsupported"),
            AdapterError::UnsupportedContent(_)
        ));
        assert_eq!(
            AdapterError::from_http_status(403, "denied").category(),
            ErrorCategory::Permanent
        );
    }

    #[test]
    fn test_timeout_is_transient() {
        let err = AdapterError::Timeout(Duration::from_secs(30));
        assert_eq!(err.category(), ErrorCategory::Transient);
    }

    #[test]
    fn test_schema_violation_is_permanent() {
        let err = AdapterError::SchemaViolation("missing risk".into());
        assert_eq!(err.category(), ErrorCategory::Permanent);
    }
}
