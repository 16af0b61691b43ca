//! Fakes shared by the integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use vigil::adapters::{
    AdapterError, ArtifactStore, InferenceBackend, InferenceClient, InferenceRequest,
    NotificationSink, PromptSchema, StoredObject,
};
use vigil::core::{IdempotencyLedger, LedgerSettings, LedgerStore, MemoryLedgerStore, Orchestrator};
use vigil::domain::AlertMessage;

/// Model answer for a given 0-10 score
pub fn answer(score: u8, confidence: f64) -> String {
    format!(
        r#"{{"risk": {}, "confidence": {}, "subject": "Person at the gate", "body": "Hello team", "full_analysis": "A person walks up to the gate."}}"#,
        score, confidence
    )
}

/// Artifact store that serves fixed bytes, or fails, and counts calls
pub struct FakeStore {
    result: Result<StoredObject, AdapterError>,
    delay: Duration,
    calls: AtomicUsize,
}

impl FakeStore {
    pub fn video() -> Self {
        Self {
            result: Ok(StoredObject {
                bytes: vec![0u8; 1024],
                content_type: "video/mp4".to_string(),
            }),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(err: AdapterError) -> Self {
        Self {
            result: Err(err),
            ..Self::video()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ArtifactStore for FakeStore {
    fn name(&self) -> &str {
        "fake-store"
    }

    async fn get(&self, _locator: &str) -> Result<StoredObject, AdapterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.result.clone()
    }
}

/// One scripted model behavior
pub enum Step {
    Answer(String),
    Fail(AdapterError),
    /// Sleep before answering (to trip the client timeout)
    Stall(Duration, String),
}

/// Model backend that plays back a script; the last step repeats
pub struct ScriptedModel {
    script: Mutex<VecDeque<Step>>,
    calls: AtomicUsize,
}

impl ScriptedModel {
    pub fn new(script: Vec<Step>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn always(answer: String) -> Self {
        Self::new(vec![Step::Answer(answer)])
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InferenceBackend for ScriptedModel {
    fn name(&self) -> &str {
        "scripted-model"
    }

    async fn invoke(&self, _request: InferenceRequest<'_>) -> Result<String, AdapterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let step = {
            let mut script = self.script.lock().unwrap();
            if script.len() > 1 {
                script.pop_front()
            } else {
                script.front().map(|s| match s {
                    Step::Answer(a) => Step::Answer(a.clone()),
                    Step::Fail(e) => Step::Fail(e.clone()),
                    Step::Stall(d, a) => Step::Stall(*d, a.clone()),
                })
            }
        };

        match step {
            Some(Step::Answer(a)) => Ok(a),
            Some(Step::Fail(e)) => Err(e),
            Some(Step::Stall(delay, a)) => {
                tokio::time::sleep(delay).await;
                Ok(a)
            }
            None => Err(AdapterError::Permanent("script exhausted".to_string())),
        }
    }
}

/// Notification sink that records alerts and can fail the first N publishes
#[derive(Default)]
pub struct RecordingSink {
    published: Mutex<Vec<AlertMessage>>,
    attempts: AtomicUsize,
    failures: Mutex<VecDeque<AdapterError>>,
}

impl RecordingSink {
    pub fn failing_first(failures: Vec<AdapterError>) -> Self {
        Self {
            failures: Mutex::new(failures.into()),
            ..Default::default()
        }
    }

    pub fn published(&self) -> Vec<AlertMessage> {
        self.published.lock().unwrap().clone()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    fn name(&self) -> &str {
        "recording-sink"
    }

    async fn publish(&self, alert: &AlertMessage) -> Result<(), AdapterError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        self.published.lock().unwrap().push(alert.clone());
        Ok(())
    }
}

/// Orchestrator over the given fakes with an in-memory ledger
pub struct Harness {
    pub store: Arc<FakeStore>,
    pub model: Arc<ScriptedModel>,
    pub sink: Arc<RecordingSink>,
    pub ledger_store: Arc<MemoryLedgerStore>,
}

impl Harness {
    pub fn new(store: FakeStore, model: ScriptedModel, sink: RecordingSink) -> Self {
        Self {
            store: Arc::new(store),
            model: Arc::new(model),
            sink: Arc::new(sink),
            ledger_store: Arc::new(MemoryLedgerStore::new()),
        }
    }

    pub fn ledger(&self, settings: LedgerSettings) -> IdempotencyLedger {
        let store: Arc<dyn LedgerStore> = self.ledger_store.clone();
        IdempotencyLedger::new(store, settings)
    }

    pub fn orchestrator(&self) -> Orchestrator {
        self.orchestrator_with(LedgerSettings::default(), Duration::from_secs(5))
    }

    pub fn orchestrator_with(&self, ledger: LedgerSettings, inference_timeout: Duration) -> Orchestrator {
        Orchestrator::new(
            self.store.clone(),
            InferenceClient::new(self.model.clone(), PromptSchema::default(), inference_timeout),
            self.sink.clone(),
            self.ledger(ledger),
        )
    }
}
