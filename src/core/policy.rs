//! Retry and timeout policy for pipeline steps.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::RiskLevel;

/// Retry policy for notification publishing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including first try)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay between retries in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier (delay *= multiplier after each retry)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_delay() -> u64 {
    500
}
fn default_max_delay() -> u64 {
    10000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryPolicy {
    /// Calculate delay for a specific attempt (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::from_millis(self.initial_delay_ms);
        }

        let delay = self.initial_delay_ms as f64
            * self.backoff_multiplier.powi((attempt - 1) as i32);

        let capped = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(capped)
    }

    /// Check if we should retry based on attempt count
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Longest a retried call can take when every attempt runs to `per_attempt`
    pub fn worst_case(&self, per_attempt: Duration) -> Duration {
        let attempts = self.max_attempts.max(1);
        let backoff: Duration = (1..attempts).map(|a| self.delay_for_attempt(a)).sum();
        per_attempt * attempts + backoff
    }
}

/// Per-call timeouts in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timeouts {
    /// Artifact fetch (default: 60)
    #[serde(default = "default_fetch_timeout")]
    pub fetch_seconds: u64,

    /// One inference call (default: 120)
    #[serde(default = "default_inference_timeout")]
    pub inference_seconds: u64,

    /// One notification publish (default: 15)
    #[serde(default = "default_notify_timeout")]
    pub notify_seconds: u64,
}

fn default_fetch_timeout() -> u64 {
    60
}
fn default_inference_timeout() -> u64 {
    120
}
fn default_notify_timeout() -> u64 {
    15
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            fetch_seconds: default_fetch_timeout(),
            inference_seconds: default_inference_timeout(),
            notify_seconds: default_notify_timeout(),
        }
    }
}

impl Timeouts {
    pub fn fetch(&self) -> Duration {
        Duration::from_secs(self.fetch_seconds)
    }

    pub fn inference(&self) -> Duration {
        Duration::from_secs(self.inference_seconds)
    }

    pub fn notify(&self) -> Duration {
        Duration::from_secs(self.notify_seconds)
    }
}

/// Orchestrator knobs that are not owned by a collaborator
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Minimum risk level that triggers an alert
    pub alert_threshold: RiskLevel,

    /// Fetch timeout
    pub fetch_timeout: Duration,

    /// Timeout for a single publish attempt
    pub notify_timeout: Duration,

    /// Bounded retry for publishing an alert
    pub notification_retry: RetryPolicy,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        let timeouts = Timeouts::default();
        Self {
            alert_threshold: RiskLevel::High,
            fetch_timeout: timeouts.fetch(),
            notify_timeout: timeouts.notify(),
            notification_retry: RetryPolicy::default(),
        }
    }
}
