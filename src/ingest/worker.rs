//! Bounded worker pool that feeds triggers to the orchestrator.
//!
//! Stands in for an at-least-once transport: each trigger is handled on its
//! own task (at most `workers` at a time) and redelivered with backoff while
//! the orchestrator reports a retryable error.

use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, Semaphore};
use tracing::{error, warn};

use crate::core::{Orchestrator, PipelineError, RetryPolicy};
use crate::domain::{ProcessingOutcome, TriggerEvent};

/// Dispatcher settings
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Triggers handled concurrently
    pub workers: usize,

    /// Redeliveries after the first delivery fails retryably
    pub max_redeliveries: u32,

    /// Backoff between redeliveries
    pub redelivery: RetryPolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_redeliveries: 3,
            redelivery: RetryPolicy {
                initial_delay_ms: 1000,
                max_delay_ms: 30000,
                ..Default::default()
            },
        }
    }
}

/// Counts of how each dispatched trigger ended
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub processed_clean: usize,
    pub processed_alerted: usize,
    pub skipped_duplicate: usize,
    pub failed_permanent: usize,

    /// Triggers still failing after every redelivery
    pub gave_up: usize,
}

impl DispatchSummary {
    fn record(&mut self, result: &Result<ProcessingOutcome, PipelineError>) {
        match result {
            Ok(ProcessingOutcome::ProcessedClean) => self.processed_clean += 1,
            Ok(ProcessingOutcome::ProcessedAlerted) => self.processed_alerted += 1,
            Ok(ProcessingOutcome::SkippedDuplicate) => self.skipped_duplicate += 1,
            Ok(ProcessingOutcome::FailedPermanent) => self.failed_permanent += 1,
            Err(_) => self.gave_up += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.processed_clean
            + self.processed_alerted
            + self.skipped_duplicate
            + self.failed_permanent
            + self.gave_up
    }
}

/// Worker pool in front of an orchestrator
pub struct Dispatcher {
    orchestrator: Arc<Orchestrator>,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(orchestrator: Arc<Orchestrator>, config: DispatcherConfig) -> Self {
        Self {
            orchestrator,
            config,
        }
    }

    /// Handle one trigger, redelivering while the failure is retryable
    pub async fn deliver(&self, event: &TriggerEvent) -> Result<ProcessingOutcome, PipelineError> {
        deliver(&self.orchestrator, event, &self.config).await
    }

    /// Drain `rx`, handling triggers concurrently; returns once the channel
    /// closes and every in-flight trigger has settled
    pub async fn run(&self, mut rx: mpsc::Receiver<TriggerEvent>) -> DispatchSummary {
        let workers = self.config.workers.max(1);
        let semaphore = Arc::new(Semaphore::new(workers));
        let summary = Arc::new(Mutex::new(DispatchSummary::default()));

        while let Some(event) = rx.recv().await {
            let permit = match Arc::clone(&semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };

            let orchestrator = Arc::clone(&self.orchestrator);
            let config = self.config.clone();
            let summary = Arc::clone(&summary);

            tokio::spawn(async move {
                let _permit = permit;
                let result = deliver(&orchestrator, &event, &config).await;
                if let Ok(mut summary) = summary.lock() {
                    summary.record(&result);
                }
            });
        }

        // Wait for in-flight triggers by reclaiming every permit
        let _all = semaphore.acquire_many(workers as u32).await;

        let summary = summary.lock().map(|s| s.clone()).unwrap_or_default();
        summary
    }

    /// Dispatch a fixed batch of triggers
    pub async fn dispatch_all(&self, events: Vec<TriggerEvent>) -> DispatchSummary {
        let (tx, rx) = mpsc::channel(events.len().max(1));
        let producer = async move {
            for event in events {
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        };

        let (_, summary) = tokio::join!(producer, self.run(rx));
        summary
    }
}

async fn deliver(
    orchestrator: &Orchestrator,
    event: &TriggerEvent,
    config: &DispatcherConfig,
) -> Result<ProcessingOutcome, PipelineError> {
    let mut delivery = 0u32;

    loop {
        delivery += 1;

        match orchestrator.handle(event).await {
            Ok(outcome) => return Ok(outcome),
            Err(e) if e.is_retryable() && delivery <= config.max_redeliveries => {
                let delay = config.redelivery.delay_for_attempt(delivery);
                warn!(
                    artifact_id = %event.artifact_id,
                    delivery,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Redelivering trigger"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                error!(
                    artifact_id = %event.artifact_id,
                    delivery,
                    error = %e,
                    "Giving up on trigger"
                );
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_counts() {
        let mut summary = DispatchSummary::default();
        summary.record(&Ok(ProcessingOutcome::ProcessedAlerted));
        summary.record(&Ok(ProcessingOutcome::SkippedDuplicate));
        summary.record(&Ok(ProcessingOutcome::SkippedDuplicate));

        assert_eq!(summary.processed_alerted, 1);
        assert_eq!(summary.skipped_duplicate, 2);
        assert_eq!(summary.total(), 3);
    }
}
