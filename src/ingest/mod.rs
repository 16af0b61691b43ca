//! Trigger ingestion.
//!
//! Turns segments produced by the motion detector into trigger events and
//! feeds them to the orchestrator:
//!
//! 1. **Watcher**: Monitors the drop directory for finished segments
//! 2. **Worker**: Bounded pool that handles triggers and redelivers on
//!    retryable failures
//!
//! # Architecture
//!
//! ```text
//! Motion detector → drop dir → Watcher → Dispatcher → Orchestrator
//!                                                        ↓
//!                                                     ledger
//! ```

pub mod watcher;
pub mod worker;

// Re-export key types
pub use watcher::{SegmentWatcher, Subscription, WatchHandle, WatcherConfig, WatcherError};
pub use worker::{DispatchSummary, Dispatcher, DispatcherConfig};
