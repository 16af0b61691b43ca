//! Errors returned by the orchestrator.
//!
//! Only failures the transport should redeliver surface as errors; permanent
//! failures and duplicates are reported as outcomes.

use thiserror::Error;

use super::ledger_store::LedgerError;
use crate::adapters::AdapterError;

/// Pipeline step names used in logs and metrics
pub mod step {
    pub const FETCH: &str = "fetch";
    pub const INFERENCE: &str = "inference";
    pub const NOTIFY: &str = "notify";
    /// Any ledger read or write
    pub const LEDGER: &str = "ledger";
}

#[derive(Debug, Error)]
pub enum PipelineError {
    /// A collaborator failed transiently; redeliver the trigger
    #[error("Retryable failure in {step} for {artifact_id} (attempt {attempt}): {source}")]
    Retryable {
        artifact_id: String,
        step: &'static str,
        attempt: u32,
        #[source]
        source: AdapterError,
    },

    /// The ledger could not be read or written
    #[error("Ledger error for {artifact_id}: {source}")]
    Ledger {
        artifact_id: String,
        #[source]
        source: LedgerError,
    },
}

impl PipelineError {
    /// Whether redelivering the trigger may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Retryable { .. } => true,
            Self::Ledger { source, .. } => source.is_retryable(),
        }
    }

    pub fn artifact_id(&self) -> &str {
        match self {
            Self::Retryable { artifact_id, .. } | Self::Ledger { artifact_id, .. } => artifact_id,
        }
    }
}
