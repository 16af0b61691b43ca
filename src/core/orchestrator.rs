//! Main orchestrator for segment processing.
//!
//! Drives one artifact per trigger through
//! acquire -> fetch -> inference -> (alert) -> complete,
//! classifying every failure as permanent (recorded, reported as an outcome)
//! or retryable (returned as an error so the transport redelivers).

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, instrument, warn};

use crate::adapters::{AdapterError, ArtifactStore, InferenceClient, NotificationSink};
use crate::domain::{
    AlertMessage, ProcessingOutcome, ProcessingStatus, ThreatAssessment, TriggerEvent,
    VideoSegment,
};

use super::error::{step, PipelineError};
use super::ledger::{AcquireResult, IdempotencyLedger, Lease};
use super::ledger_store::LedgerError;
use super::metrics;
use super::policy::PipelineSettings;
use super::safety::SegmentLimits;

/// Per-step latency of one attempt, in milliseconds
#[derive(Debug, Default, Clone, Copy)]
struct StepTimings {
    fetch_ms: u64,
    inference_ms: u64,
    notify_ms: u64,
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

/// Main segment orchestrator
pub struct Orchestrator {
    store: Arc<dyn ArtifactStore>,
    inference: InferenceClient,
    notifier: Arc<dyn NotificationSink>,
    ledger: IdempotencyLedger,
    limits: SegmentLimits,
    settings: PipelineSettings,
}

impl Orchestrator {
    /// Create an orchestrator with default settings and limits
    pub fn new(
        store: Arc<dyn ArtifactStore>,
        inference: InferenceClient,
        notifier: Arc<dyn NotificationSink>,
        ledger: IdempotencyLedger,
    ) -> Self {
        Self {
            store,
            inference,
            notifier,
            ledger,
            limits: SegmentLimits::default(),
            settings: PipelineSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: PipelineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_limits(mut self, limits: SegmentLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn ledger(&self) -> &IdempotencyLedger {
        &self.ledger
    }

    /// Handle one trigger event.
    ///
    /// Returns an outcome for everything that is settled (processed,
    /// duplicate, permanently failed) and an error only when redelivery
    /// may succeed.
    #[instrument(skip(self, event), fields(artifact_id = %event.artifact_id))]
    pub async fn handle(&self, event: &TriggerEvent) -> Result<ProcessingOutcome, PipelineError> {
        let result = self.process(event).await;
        match &result {
            Ok(outcome) => metrics::record_outcome(*outcome),
            Err(PipelineError::Retryable { step, .. }) => metrics::record_retryable_failure(step),
            Err(PipelineError::Ledger { .. }) => metrics::record_retryable_failure(step::LEDGER),
        }
        result
    }

    async fn process(&self, event: &TriggerEvent) -> Result<ProcessingOutcome, PipelineError> {
        let lease = match self
            .ledger
            .try_acquire(event)
            .await
            .map_err(|source| ledger_error(&event.artifact_id, source))?
        {
            AcquireResult::Acquired(lease) => lease,
            AcquireResult::Duplicate(reason) => {
                info!(
                    reason = ?reason,
                    outcome = %ProcessingOutcome::SkippedDuplicate,
                    "Duplicate trigger skipped"
                );
                return Ok(ProcessingOutcome::SkippedDuplicate);
            }
            AcquireResult::Exhausted(record) => {
                error!(
                    attempt = record.attempt_count,
                    error = record.last_error.as_deref().unwrap_or(""),
                    outcome = %ProcessingOutcome::FailedPermanent,
                    "Attempt budget spent, artifact failed"
                );
                return Ok(ProcessingOutcome::FailedPermanent);
            }
        };

        info!(attempt = lease.attempt, source = %lease.source_location, "Processing artifact");

        let mut timings = StepTimings::default();

        let assessment = match lease.assessment.clone() {
            Some(assessment) => {
                info!(
                    attempt = lease.attempt,
                    risk_level = %assessment.risk_level,
                    "Reusing memoized assessment"
                );
                assessment
            }
            None => {
                let segment = match self.fetch(&lease, &mut timings).await {
                    Ok(segment) => segment,
                    Err(e) => return self.settle_failure(&lease, step::FETCH, e, timings).await,
                };

                match self.ledger.heartbeat(&lease).await {
                    Ok(()) => {}
                    Err(LedgerError::LeaseConflict { .. }) => return Ok(self.lease_lost(&lease)),
                    Err(source) => return Err(ledger_error(&lease.artifact_id, source)),
                }

                let assessment = match self.infer(segment, &mut timings).await {
                    Ok(assessment) => assessment,
                    Err(e) => {
                        return self.settle_failure(&lease, step::INFERENCE, e, timings).await
                    }
                };

                match self.ledger.record_assessment(&lease, &assessment).await {
                    Ok(()) => {}
                    Err(LedgerError::LeaseConflict { .. }) => return Ok(self.lease_lost(&lease)),
                    Err(source) => return Err(ledger_error(&lease.artifact_id, source)),
                }

                assessment
            }
        };

        let alerted = assessment.risk_level.meets(self.settings.alert_threshold);
        if alerted {
            if let Err(e) = self.publish(&lease, &assessment, &mut timings).await {
                return self.settle_failure(&lease, step::NOTIFY, e, timings).await;
            }
        } else {
            debug!(
                risk_level = %assessment.risk_level,
                threshold = %self.settings.alert_threshold,
                "Below alert threshold"
            );
        }

        match self.ledger.complete(&lease, assessment.risk_level).await {
            Ok(()) => {}
            Err(LedgerError::LeaseConflict { .. }) => return Ok(self.lease_lost(&lease)),
            Err(source) => return Err(ledger_error(&lease.artifact_id, source)),
        }

        let outcome = if alerted {
            ProcessingOutcome::ProcessedAlerted
        } else {
            ProcessingOutcome::ProcessedClean
        };

        info!(
            attempt = lease.attempt,
            risk_level = %assessment.risk_level,
            risk_score = ?assessment.risk_score,
            confidence = assessment.confidence,
            fetch_ms = timings.fetch_ms,
            inference_ms = timings.inference_ms,
            notify_ms = timings.notify_ms,
            outcome = %outcome,
            "Artifact processed"
        );

        Ok(outcome)
    }

    /// Fetch and validate the segment
    async fn fetch(&self, lease: &Lease, timings: &mut StepTimings) -> Result<VideoSegment, AdapterError> {
        self.limits.validate_locator(&lease.source_location)?;

        let started = Instant::now();
        let timeout = self.settings.fetch_timeout;
        let fetched = tokio::time::timeout(timeout, self.store.get(&lease.source_location)).await;
        timings.fetch_ms = elapsed_ms(started);
        metrics::record_step_duration(step::FETCH, started.elapsed().as_secs_f64());

        let object = fetched.map_err(|_| AdapterError::Timeout(timeout))??;

        let segment = VideoSegment::new(
            &lease.artifact_id,
            &lease.source_location,
            object.bytes,
            object.content_type,
        );
        self.limits.validate_segment(&segment)?;

        debug!(
            store = self.store.name(),
            size_bytes = segment.size_bytes,
            content_type = %segment.content_type,
            fetch_ms = timings.fetch_ms,
            "Segment fetched"
        );

        Ok(segment)
    }

    /// Run inference; the segment is consumed and dropped here
    async fn infer(
        &self,
        segment: VideoSegment,
        timings: &mut StepTimings,
    ) -> Result<ThreatAssessment, AdapterError> {
        let started = Instant::now();
        let result = self.inference.analyze(segment).await;
        timings.inference_ms = elapsed_ms(started);
        metrics::record_step_duration(step::INFERENCE, started.elapsed().as_secs_f64());

        if let Ok(ref assessment) = result {
            debug!(
                backend = self.inference.backend_name(),
                risk_level = %assessment.risk_level,
                confidence = assessment.confidence,
                inference_ms = timings.inference_ms,
                "Assessment produced"
            );
        }

        result
    }

    /// Publish an alert with bounded retry; never re-runs inference
    async fn publish(
        &self,
        lease: &Lease,
        assessment: &ThreatAssessment,
        timings: &mut StepTimings,
    ) -> Result<(), AdapterError> {
        let alert = AlertMessage::from_assessment(assessment, &lease.source_location);
        let policy = &self.settings.notification_retry;
        let timeout = self.settings.notify_timeout;
        let started = Instant::now();
        let mut attempt = 0u32;

        let result = loop {
            attempt += 1;

            let result = match tokio::time::timeout(timeout, self.notifier.publish(&alert)).await {
                Ok(result) => result,
                Err(_) => Err(AdapterError::Timeout(timeout)),
            };

            match result {
                Ok(()) => break Ok(()),
                Err(e) if e.is_retryable() && policy.should_retry(attempt) => {
                    let delay: Duration = policy.delay_for_attempt(attempt);
                    warn!(
                        sink = self.notifier.name(),
                        publish_attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Publish failed, retrying"
                    );
                    metrics::record_publish_retry(self.notifier.name());
                    tokio::time::sleep(delay).await;
                }
                Err(e) => break Err(e),
            }
        };

        timings.notify_ms = elapsed_ms(started);
        metrics::record_step_duration(step::NOTIFY, started.elapsed().as_secs_f64());

        if result.is_ok() {
            metrics::record_alert_published(self.notifier.name());
            info!(
                sink = self.notifier.name(),
                risk_level = %alert.risk_level,
                notify_ms = timings.notify_ms,
                "Alert published"
            );
        }

        result
    }

    /// Record a failed step and turn it into an outcome or a retryable error
    async fn settle_failure(
        &self,
        lease: &Lease,
        step: &'static str,
        err: AdapterError,
        timings: StepTimings,
    ) -> Result<ProcessingOutcome, PipelineError> {
        let permanent = !err.is_retryable();
        let message = format!("{}: {}", step, err);

        match self.ledger.fail(lease, permanent, &message).await {
            Ok(ProcessingStatus::Failed) => {
                error!(
                    attempt = lease.attempt,
                    step,
                    category = ?err.category(),
                    error = %err,
                    fetch_ms = timings.fetch_ms,
                    inference_ms = timings.inference_ms,
                    notify_ms = timings.notify_ms,
                    outcome = %ProcessingOutcome::FailedPermanent,
                    "Artifact failed permanently"
                );
                Ok(ProcessingOutcome::FailedPermanent)
            }
            Ok(_) => {
                warn!(
                    attempt = lease.attempt,
                    step,
                    error = %err,
                    fetch_ms = timings.fetch_ms,
                    inference_ms = timings.inference_ms,
                    notify_ms = timings.notify_ms,
                    "Retryable failure, awaiting redelivery"
                );
                Err(PipelineError::Retryable {
                    artifact_id: lease.artifact_id.clone(),
                    step,
                    attempt: lease.attempt,
                    source: err,
                })
            }
            Err(LedgerError::LeaseConflict { .. }) => Ok(self.lease_lost(lease)),
            Err(source) => Err(ledger_error(&lease.artifact_id, source)),
        }
    }

    /// Another attempt took over; stop without further side effects
    fn lease_lost(&self, lease: &Lease) -> ProcessingOutcome {
        warn!(
            attempt = lease.attempt,
            outcome = %ProcessingOutcome::SkippedDuplicate,
            "Lease lost to another attempt, abandoning"
        );
        ProcessingOutcome::SkippedDuplicate
    }
}

fn ledger_error(artifact_id: &str, source: LedgerError) -> PipelineError {
    PipelineError::Ledger {
        artifact_id: artifact_id.to_string(),
        source,
    }
}
