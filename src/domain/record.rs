//! Idempotency ledger records and processing outcomes.
//!
//! A record tracks one artifact through `IN_PROGRESS -> {COMPLETED, FAILED}`.
//! Both terminal states turn later deliveries of the same artifact into no-ops.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::assessment::{RiskLevel, ThreatAssessment};

/// Status of an artifact in the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    InProgress,
    Completed,
    Failed,
}

impl ProcessingStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

/// Ledger entry for one artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingRecord {
    pub artifact_id: String,

    /// Locator from the trigger that created the record
    pub source_location: String,

    pub status: ProcessingStatus,

    /// Number of attempts that acquired the artifact
    pub attempt_count: u32,

    pub created_at: DateTime<Utc>,

    /// Last write to this record (acquire, heartbeat, or transition)
    pub last_updated: DateTime<Utc>,

    /// Attempt currently holding the lease
    pub lease_owner: Option<Uuid>,

    /// Lease expiry; `None` when no attempt holds the artifact
    pub lease_expires_at: Option<DateTime<Utc>>,

    /// Risk level of the final assessment
    pub result_risk_level: Option<RiskLevel>,

    /// Assessment memoized so retries never re-run inference
    pub assessment: Option<ThreatAssessment>,

    /// Error from the last failed attempt
    pub last_error: Option<String>,
}

impl ProcessingRecord {
    /// Create a record for a first sighting, leased to `owner` until `expires_at`
    pub fn first_attempt(
        artifact_id: impl Into<String>,
        source_location: impl Into<String>,
        owner: Uuid,
        expires_at: DateTime<Utc>,
    ) -> Self {
        let now = Utc::now();
        Self {
            artifact_id: artifact_id.into(),
            source_location: source_location.into(),
            status: ProcessingStatus::InProgress,
            attempt_count: 1,
            created_at: now,
            last_updated: now,
            lease_owner: Some(owner),
            lease_expires_at: Some(expires_at),
            result_risk_level: None,
            assessment: None,
            last_error: None,
        }
    }

    /// Whether some attempt currently holds an unexpired lease
    pub fn lease_active(&self, now: DateTime<Utc>) -> bool {
        self.status == ProcessingStatus::InProgress
            && self.lease_expires_at.map(|t| t > now).unwrap_or(false)
    }

    /// Whether `owner` still holds this record
    pub fn held_by(&self, owner: Uuid) -> bool {
        self.status == ProcessingStatus::InProgress && self.lease_owner == Some(owner)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Result of handling one trigger event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingOutcome {
    /// Assessed below the alert threshold
    ProcessedClean,

    /// Assessed at or above the threshold and the alert was accepted
    ProcessedAlerted,

    /// Already completed, failed, or owned by another attempt
    SkippedDuplicate,

    /// Failed in a way retrying cannot fix; recorded in the ledger
    FailedPermanent,
}

impl ProcessingOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ProcessedClean => "processed_clean",
            Self::ProcessedAlerted => "processed_alerted",
            Self::SkippedDuplicate => "skipped_duplicate",
            Self::FailedPermanent => "failed_permanent",
        }
    }

    /// Whether this attempt drove the artifact to completion
    pub fn is_processed(self) -> bool {
        matches!(self, Self::ProcessedClean | Self::ProcessedAlerted)
    }
}

impl fmt::Display for ProcessingOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_first_attempt_is_leased() {
        let owner = Uuid::new_v4();
        let record = ProcessingRecord::first_attempt(
            "seg-001",
            "seg-001.mp4",
            owner,
            Utc::now() + Duration::seconds(60),
        );

        assert_eq!(record.status, ProcessingStatus::InProgress);
        assert_eq!(record.attempt_count, 1);
        assert!(record.lease_active(Utc::now()));
        assert!(record.held_by(owner));
        assert!(!record.held_by(Uuid::new_v4()));
    }

    #[test]
    fn test_expired_lease_is_inactive() {
        let record = ProcessingRecord::first_attempt(
            "seg-001",
            "seg-001.mp4",
            Uuid::new_v4(),
            Utc::now() - Duration::seconds(1),
        );
        assert!(!record.lease_active(Utc::now()));
    }

    #[test]
    fn test_terminal_records_have_no_active_lease() {
        let mut record = ProcessingRecord::first_attempt(
            "seg-001",
            "seg-001.mp4",
            Uuid::new_v4(),
            Utc::now() + Duration::seconds(60),
        );
        record.status = ProcessingStatus::Completed;

        assert!(record.is_terminal());
        assert!(!record.lease_active(Utc::now()));
    }

    #[test]
    fn test_outcome_serialization() {
        let json = serde_json::to_string(&ProcessingOutcome::FailedPermanent).unwrap();
        assert_eq!(json, "\"failed_permanent\"");
        assert_eq!(ProcessingOutcome::ProcessedAlerted.to_string(), "processed_alerted");
        assert!(ProcessingOutcome::ProcessedClean.is_processed());
        assert!(!ProcessingOutcome::SkippedDuplicate.is_processed());
    }
}
