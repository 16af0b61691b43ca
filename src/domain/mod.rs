//! Domain types for the vigil pipeline.
//!
//! This module contains the core data structures:
//! - TriggerEvent: Notification that a segment is ready
//! - VideoSegment: Fetched segment bytes, owned by one attempt
//! - ThreatAssessment / AlertMessage: Inference results and alerts
//! - ProcessingRecord: Idempotency ledger entries

pub mod assessment;
pub mod record;
pub mod segment;
pub mod trigger;

// Re-export commonly used types
pub use assessment::{AlertMessage, RiskCutoffs, RiskLevel, ThreatAssessment};
pub use record::{ProcessingOutcome, ProcessingRecord, ProcessingStatus};
pub use segment::{content_type_for, VideoSegment};
pub use trigger::{TriggerError, TriggerEvent};
