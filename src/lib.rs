//! vigil - Idempotent threat analysis for camera segments
//!
//! Takes notifications that a video segment landed in storage, runs a
//! multimodal model over it, and publishes an alert when the assessed risk
//! meets a threshold.
//!
//! # Architecture
//!
//! Triggers are delivered at least once, so every artifact goes through an
//! idempotency ledger first:
//! - A lease (compare-and-swap on a versioned record) admits one attempt at a time
//! - The assessment is memoized before alerting, so retries never re-run inference
//! - Terminal records turn every later delivery into a duplicate skip
//!
//! # Modules
//!
//! - `adapters`: External systems (artifact stores, model backends, notifiers)
//! - `core`: Orchestration logic (Orchestrator, ledger, retry policy, safety)
//! - `domain`: Data structures (TriggerEvent, ThreatAssessment, ProcessingRecord)
//! - `ingest`: Drop-directory watcher and worker pool
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Process an object store notification
//! vigil process --input notification.json
//!
//! # Drain and watch the drop directory
//! vigil watch
//!
//! # Inspect the ledger
//! vigil ledger --limit 20
//! vigil show front-door.mp4@3f2a9c1b7d4e
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod ingest;

// Re-export main types at crate root for convenience
pub use adapters::{AdapterError, ArtifactStore, InferenceBackend, InferenceClient, NotificationSink};
pub use crate::core::{IdempotencyLedger, LedgerStore, Orchestrator, PipelineError};
pub use domain::{
    AlertMessage, ProcessingOutcome, ProcessingRecord, ProcessingStatus, RiskLevel,
    ThreatAssessment, TriggerEvent,
};
pub use ingest::{Dispatcher, SegmentWatcher};
