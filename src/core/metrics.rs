//! Pipeline metrics recorded through the `metrics` facade.
//!
//! Without an installed recorder these calls are no-ops.

use metrics::{counter, histogram};

use crate::domain::ProcessingOutcome;

/// Metric names as constants for consistency.
pub mod names {
    pub const OUTCOMES_TOTAL: &str = "vigil_outcomes_total";
    pub const RETRYABLE_FAILURES_TOTAL: &str = "vigil_retryable_failures_total";
    pub const STEP_DURATION_SECONDS: &str = "vigil_step_duration_seconds";
    pub const ALERTS_PUBLISHED_TOTAL: &str = "vigil_alerts_published_total";
    pub const PUBLISH_RETRIES_TOTAL: &str = "vigil_publish_retries_total";
}

/// Record a terminal outcome.
pub fn record_outcome(outcome: ProcessingOutcome) {
    let labels = [("outcome", outcome.as_str().to_string())];
    counter!(names::OUTCOMES_TOTAL, &labels).increment(1);
}

/// Record a failure handed back to the transport for redelivery.
pub fn record_retryable_failure(step: &str) {
    let labels = [("step", step.to_string())];
    counter!(names::RETRYABLE_FAILURES_TOTAL, &labels).increment(1);
}

/// Record how long one step took.
pub fn record_step_duration(step: &str, duration_secs: f64) {
    let labels = [("step", step.to_string())];
    histogram!(names::STEP_DURATION_SECONDS, &labels).record(duration_secs);
}

/// Record an alert accepted by a sink.
pub fn record_alert_published(sink: &str) {
    let labels = [("sink", sink.to_string())];
    counter!(names::ALERTS_PUBLISHED_TOTAL, &labels).increment(1);
}

/// Record one publish retry.
pub fn record_publish_retry(sink: &str) {
    let labels = [("sink", sink.to_string())];
    counter!(names::PUBLISH_RETRIES_TOTAL, &labels).increment(1);
}
