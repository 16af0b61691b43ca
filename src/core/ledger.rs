//! Idempotency ledger with lease-based ownership.
//!
//! Each artifact moves through `UNSEEN -> IN_PROGRESS -> {COMPLETED, FAILED}`.
//! An attempt owns an artifact through a [`Lease`]; every write after
//! acquisition is conditional on still holding it, so an attempt whose lease
//! was taken over can no longer change the record.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};
use uuid::Uuid;

use super::ledger_store::{LedgerError, LedgerStore, Versioned};
use crate::domain::{
    ProcessingRecord, ProcessingStatus, RiskLevel, ThreatAssessment, TriggerEvent,
};

/// Lost CAS races tolerated before giving up on one operation
const MAX_CAS_ROUNDS: u32 = 16;

/// Proof of ownership of one artifact
#[derive(Debug, Clone, PartialEq)]
pub struct Lease {
    pub artifact_id: String,
    pub source_location: String,
    pub owner: Uuid,

    /// 1-based attempt number this lease was granted for
    pub attempt: u32,

    /// Assessment memoized by an earlier attempt, if any
    pub assessment: Option<ThreatAssessment>,
}

/// Why an acquire did not grant a lease
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateReason {
    Completed,
    Failed,
    LeaseHeld,
}

/// Result of `try_acquire`
#[derive(Debug, Clone, PartialEq)]
pub enum AcquireResult {
    Acquired(Lease),
    Duplicate(DuplicateReason),

    /// The attempt budget was already spent; the record is now FAILED
    Exhausted(ProcessingRecord),
}

/// Ledger settings
#[derive(Debug, Clone, Copy)]
pub struct LedgerSettings {
    /// How long an acquired lease lasts without a heartbeat
    pub lease_duration: Duration,

    /// Attempts allowed before a retryable failure becomes permanent
    pub max_attempts: u32,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(300),
            max_attempts: 3,
        }
    }
}

/// Lease-aware facade over a [`LedgerStore`]
#[derive(Clone)]
pub struct IdempotencyLedger {
    store: Arc<dyn LedgerStore>,
    settings: LedgerSettings,
}

impl IdempotencyLedger {
    pub fn new(store: Arc<dyn LedgerStore>, settings: LedgerSettings) -> Self {
        Self { store, settings }
    }

    pub fn settings(&self) -> LedgerSettings {
        self.settings
    }

    pub fn store_name(&self) -> &str {
        self.store.name()
    }

    fn lease_expiry(&self) -> chrono::DateTime<Utc> {
        let lease = chrono::Duration::from_std(self.settings.lease_duration)
            .unwrap_or_else(|_| chrono::Duration::seconds(300));
        Utc::now() + lease
    }

    /// Claim `event.artifact_id` for a new attempt
    pub async fn try_acquire(&self, event: &TriggerEvent) -> Result<AcquireResult, LedgerError> {
        for _ in 0..MAX_CAS_ROUNDS {
            let owner = Uuid::new_v4();
            let now = Utc::now();

            let current = self.store.load(&event.artifact_id).await?;
            let (expected, record, result) = match current {
                None => {
                    let record = ProcessingRecord::first_attempt(
                        &event.artifact_id,
                        &event.source_location,
                        owner,
                        self.lease_expiry(),
                    );
                    (None, record, None)
                }
                Some(Versioned { version, mut record }) => match record.status {
                    ProcessingStatus::Completed => {
                        return Ok(AcquireResult::Duplicate(DuplicateReason::Completed))
                    }
                    ProcessingStatus::Failed => {
                        return Ok(AcquireResult::Duplicate(DuplicateReason::Failed))
                    }
                    ProcessingStatus::InProgress if record.lease_active(now) => {
                        return Ok(AcquireResult::Duplicate(DuplicateReason::LeaseHeld))
                    }
                    ProcessingStatus::InProgress if record.attempt_count >= self.settings.max_attempts => {
                        record.status = ProcessingStatus::Failed;
                        record.lease_owner = None;
                        record.lease_expires_at = None;
                        record.last_updated = now;
                        let reason = format!("attempt budget of {} spent", self.settings.max_attempts);
                        record.last_error = Some(match record.last_error.take() {
                            Some(prev) => format!("{}; last error: {}", reason, prev),
                            None => reason,
                        });
                        (Some(version), record.clone(), Some(AcquireResult::Exhausted(record)))
                    }
                    ProcessingStatus::InProgress => {
                        if record.lease_owner.is_some() {
                            warn!(
                                artifact_id = %record.artifact_id,
                                attempt = record.attempt_count,
                                "Lease expired, taking over"
                            );
                        }
                        record.attempt_count += 1;
                        record.lease_owner = Some(owner);
                        record.lease_expires_at = Some(self.lease_expiry());
                        record.last_updated = now;
                        (Some(version), record, None)
                    }
                },
            };

            match self.store.compare_and_swap(expected, record.clone()).await {
                Ok(_) => {
                    return Ok(result.unwrap_or_else(|| {
                        AcquireResult::Acquired(Lease {
                            artifact_id: record.artifact_id,
                            source_location: record.source_location,
                            owner,
                            attempt: record.attempt_count,
                            assessment: record.assessment,
                        })
                    }))
                }
                Err(LedgerError::Conflict { .. }) => {
                    debug!(artifact_id = %event.artifact_id, "Lost acquire race, re-reading");
                    continue;
                }
                Err(e) => return Err(e),
            }
        }

        Err(LedgerError::Conflict {
            artifact_id: event.artifact_id.clone(),
        })
    }

    /// Apply `update` to the record if `lease` still owns it
    async fn update_owned<F>(&self, lease: &Lease, update: F) -> Result<ProcessingRecord, LedgerError>
    where
        F: Fn(&mut ProcessingRecord),
    {
        for _ in 0..MAX_CAS_ROUNDS {
            let Versioned { version, mut record } = self
                .store
                .load(&lease.artifact_id)
                .await?
                .ok_or_else(|| LedgerError::Missing(lease.artifact_id.clone()))?;

            if !record.held_by(lease.owner) {
                return Err(LedgerError::LeaseConflict {
                    artifact_id: lease.artifact_id.clone(),
                });
            }

            update(&mut record);
            record.last_updated = Utc::now();

            match self.store.compare_and_swap(Some(version), record.clone()).await {
                Ok(_) => return Ok(record),
                Err(LedgerError::Conflict { .. }) => continue,
                Err(e) => return Err(e),
            }
        }

        Err(LedgerError::Conflict {
            artifact_id: lease.artifact_id.clone(),
        })
    }

    /// Extend the lease
    pub async fn heartbeat(&self, lease: &Lease) -> Result<(), LedgerError> {
        let expires_at = self.lease_expiry();
        self.update_owned(lease, |record| {
            record.lease_expires_at = Some(expires_at);
        })
        .await
        .map(|_| ())
    }

    /// Memoize an assessment so later attempts skip inference
    pub async fn record_assessment(
        &self,
        lease: &Lease,
        assessment: &ThreatAssessment,
    ) -> Result<(), LedgerError> {
        let expires_at = self.lease_expiry();
        self.update_owned(lease, |record| {
            record.assessment = Some(assessment.clone());
            record.result_risk_level = Some(assessment.risk_level);
            record.lease_expires_at = Some(expires_at);
        })
        .await
        .map(|_| ())
    }

    /// Mark the artifact COMPLETED
    pub async fn complete(&self, lease: &Lease, risk_level: RiskLevel) -> Result<(), LedgerError> {
        self.update_owned(lease, |record| {
            record.status = ProcessingStatus::Completed;
            record.result_risk_level = Some(risk_level);
            record.lease_owner = None;
            record.lease_expires_at = None;
            record.last_error = None;
        })
        .await
        .map(|_| ())
    }

    /// Record a failed attempt and return the resulting status.
    ///
    /// Permanent failures are terminal. Retryable failures release the lease
    /// so a redelivery can take over at once, unless the attempt budget is
    /// spent, in which case the record becomes FAILED too.
    pub async fn fail(
        &self,
        lease: &Lease,
        permanent: bool,
        error: &str,
    ) -> Result<ProcessingStatus, LedgerError> {
        let max_attempts = self.settings.max_attempts;
        let record = self
            .update_owned(lease, |record| {
                record.last_error = Some(error.to_string());
                record.lease_owner = None;
                record.lease_expires_at = None;
                if permanent || record.attempt_count >= max_attempts {
                    record.status = ProcessingStatus::Failed;
                }
            })
            .await?;
        Ok(record.status)
    }

    /// Current record for an artifact
    pub async fn get(&self, artifact_id: &str) -> Result<Option<ProcessingRecord>, LedgerError> {
        Ok(self.store.load(artifact_id).await?.map(|v| v.record))
    }

    /// Most recently updated records
    pub async fn list(&self, limit: usize) -> Result<Vec<ProcessingRecord>, LedgerError> {
        self.store.list(limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ledger_store::MemoryLedgerStore;

    fn ledger(lease: Duration, max_attempts: u32) -> IdempotencyLedger {
        IdempotencyLedger::new(
            Arc::new(MemoryLedgerStore::new()),
            LedgerSettings {
                lease_duration: lease,
                max_attempts,
            },
        )
    }

    fn event(id: &str) -> TriggerEvent {
        TriggerEvent::new(id, format!("{}.mp4", id))
    }

    fn acquired(result: AcquireResult) -> Lease {
        match result {
            AcquireResult::Acquired(lease) => lease,
            other => panic!("expected Acquired, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_second_acquire_is_duplicate_while_leased() {
        let ledger = ledger(Duration::from_secs(60), 3);

        let lease = acquired(ledger.try_acquire(&event("seg-001")).await.unwrap());
        assert_eq!(lease.attempt, 1);

        let second = ledger.try_acquire(&event("seg-001")).await.unwrap();
        assert_eq!(second, AcquireResult::Duplicate(DuplicateReason::LeaseHeld));
    }

    #[tokio::test]
    async fn test_completed_is_duplicate() {
        let ledger = ledger(Duration::from_secs(60), 3);
        let lease = acquired(ledger.try_acquire(&event("seg-001")).await.unwrap());
        ledger.complete(&lease, RiskLevel::Low).await.unwrap();

        let again = ledger.try_acquire(&event("seg-001")).await.unwrap();
        assert_eq!(again, AcquireResult::Duplicate(DuplicateReason::Completed));

        let record = ledger.get("seg-001").await.unwrap().unwrap();
        assert_eq!(record.status, ProcessingStatus::Completed);
        assert_eq!(record.result_risk_level, Some(RiskLevel::Low));
    }

    #[tokio::test]
    async fn test_expired_lease_taken_over() {
        let ledger = ledger(Duration::from_millis(20), 3);
        let stale = acquired(ledger.try_acquire(&event("seg-001")).await.unwrap());

        tokio::time::sleep(Duration::from_millis(40)).await;

        let fresh = acquired(ledger.try_acquire(&event("seg-001")).await.unwrap());
        assert_eq!(fresh.attempt, 2);

        // The stale owner can no longer write
        let err = ledger.complete(&stale, RiskLevel::High).await.unwrap_err();
        assert!(matches!(err, LedgerError::LeaseConflict { .. }));

        ledger.complete(&fresh, RiskLevel::Low).await.unwrap();
    }

    #[tokio::test]
    async fn test_transient_failure_releases_lease() {
        let ledger = ledger(Duration::from_secs(60), 3);
        let lease = acquired(ledger.try_acquire(&event("seg-003")).await.unwrap());

        let status = ledger.fail(&lease, false, "timeout").await.unwrap();
        assert_eq!(status, ProcessingStatus::InProgress);

        let retry = acquired(ledger.try_acquire(&event("seg-003")).await.unwrap());
        assert_eq!(retry.attempt, 2);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_terminal() {
        let ledger = ledger(Duration::from_secs(60), 3);
        let lease = acquired(ledger.try_acquire(&event("seg-002")).await.unwrap());

        let status = ledger.fail(&lease, true, "not found").await.unwrap();
        assert_eq!(status, ProcessingStatus::Failed);

        let again = ledger.try_acquire(&event("seg-002")).await.unwrap();
        assert_eq!(again, AcquireResult::Duplicate(DuplicateReason::Failed));

        let record = ledger.get("seg-002").await.unwrap().unwrap();
        assert_eq!(record.last_error.as_deref(), Some("not found"));
    }

    #[tokio::test]
    async fn test_budget_exhaustion_fails_record() {
        let ledger = ledger(Duration::from_secs(60), 2);

        let first = acquired(ledger.try_acquire(&event("seg-004")).await.unwrap());
        assert_eq!(
            ledger.fail(&first, false, "503").await.unwrap(),
            ProcessingStatus::InProgress
        );

        let second = acquired(ledger.try_acquire(&event("seg-004")).await.unwrap());
        assert_eq!(
            ledger.fail(&second, false, "503").await.unwrap(),
            ProcessingStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_takeover_past_budget_is_exhausted() {
        let ledger = ledger(Duration::from_millis(20), 1);
        let _crashed = acquired(ledger.try_acquire(&event("seg-005")).await.unwrap());

        tokio::time::sleep(Duration::from_millis(40)).await;

        match ledger.try_acquire(&event("seg-005")).await.unwrap() {
            AcquireResult::Exhausted(record) => {
                assert_eq!(record.status, ProcessingStatus::Failed);
                assert!(record.last_error.is_some());
            }
            other => panic!("expected Exhausted, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_memoized_assessment_returned_on_takeover() {
        let ledger = ledger(Duration::from_secs(60), 3);
        let lease = acquired(ledger.try_acquire(&event("seg-006")).await.unwrap());

        let assessment = ThreatAssessment {
            artifact_id: "seg-006".to_string(),
            risk_level: RiskLevel::High,
            risk_score: Some(8),
            confidence: 0.9,
            summary: "Break-in".to_string(),
            body: String::new(),
            full_analysis: String::new(),
            raw_model_output: serde_json::json!({}),
            assessed_at: Utc::now(),
        };
        ledger.record_assessment(&lease, &assessment).await.unwrap();
        ledger.fail(&lease, false, "notify 503").await.unwrap();

        let retry = acquired(ledger.try_acquire(&event("seg-006")).await.unwrap());
        assert_eq!(retry.assessment, Some(assessment));
    }
}
