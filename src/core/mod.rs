//! Core orchestration logic.
//!
//! This module contains:
//! - Ledger: Lease-based idempotency ledger over versioned stores
//! - Policy: Retry, timeout, and alerting settings
//! - Safety: Segment limits
//! - Orchestrator: Per-trigger state machine

pub mod error;
pub mod ledger;
pub mod ledger_store;
pub mod metrics;
pub mod orchestrator;
pub mod policy;
pub mod safety;

// Re-export commonly used types
pub use error::PipelineError;
pub use ledger::{AcquireResult, DuplicateReason, IdempotencyLedger, Lease, LedgerSettings};
pub use ledger_store::{
    JsonlLedgerStore, LedgerError, LedgerStore, MemoryLedgerStore, SqliteLedgerStore, Versioned,
};
pub use orchestrator::Orchestrator;
pub use policy::{PipelineSettings, RetryPolicy, Timeouts};
pub use safety::{SafetyViolation, SegmentLimits};
