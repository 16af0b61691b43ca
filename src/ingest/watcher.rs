//! Segment drop-directory watcher.
//!
//! Watches a directory where the motion detector writes finished segments
//! and emits a `TriggerEvent` once each file is stable (its size stopped
//! changing). Artifact IDs combine the file name with a content hash, so a
//! rewritten file with the same name is a new artifact.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use notify::RecursiveMode;
use notify_debouncer_mini::{new_debouncer, DebounceEventResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

use crate::domain::TriggerEvent;

/// Errors that can occur with the watcher
#[derive(Debug, Error)]
pub enum WatcherError {
    #[error("Watch directory does not exist: {0}")]
    DirectoryNotFound(PathBuf),

    #[error("Notify error: {0}")]
    Notify(#[from] notify::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Watcher task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Configuration for the watcher
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherConfig {
    /// Directory the motion detector writes segments to
    pub watch_path: PathBuf,

    /// How long a file must be stable before processing (seconds)
    #[serde(default = "default_stability_delay")]
    pub stability_delay_secs: u64,

    /// File extensions to watch
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
}

fn default_stability_delay() -> u64 {
    5
}

fn default_extensions() -> Vec<String> {
    vec!["mp4".to_string(), "mov".to_string(), "mkv".to_string(), "webm".to_string()]
}

impl WatcherConfig {
    /// Config for `watch_path` with default stability delay and extensions
    pub fn new(watch_path: impl Into<PathBuf>) -> Self {
        Self {
            watch_path: watch_path.into(),
            stability_delay_secs: default_stability_delay(),
            extensions: default_extensions(),
        }
    }

    /// Check if the watch path exists
    pub fn validate(&self) -> Result<(), WatcherError> {
        if !self.watch_path.exists() {
            return Err(WatcherError::DirectoryNotFound(self.watch_path.clone()));
        }
        Ok(())
    }

    fn is_segment(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| self.extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)))
            .unwrap_or(false)
    }
}

/// Segment watcher with stability checking
pub struct SegmentWatcher {
    config: WatcherConfig,
}

impl SegmentWatcher {
    pub fn new(config: WatcherConfig) -> Self {
        Self { config }
    }

    /// Get the current configuration
    pub fn config(&self) -> &WatcherConfig {
        &self.config
    }

    /// Scan the directory once and build triggers for every segment present.
    ///
    /// Triggers are ordered by file name. Already-processed segments are
    /// filtered later by the ledger, not here.
    pub async fn scan_once(&self) -> Result<Vec<TriggerEvent>, WatcherError> {
        self.config.validate()?;

        let mut paths = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.config.watch_path).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !self.config.is_segment(&path) {
                continue;
            }

            let metadata = match tokio::fs::metadata(&path).await {
                Ok(m) => m,
                Err(_) => continue,
            };
            if metadata.is_file() && metadata.len() > 0 {
                paths.push(path);
            }
        }

        paths.sort();

        let mut triggers = Vec::with_capacity(paths.len());
        for path in paths {
            match trigger_for(&path).await {
                Ok(trigger) => triggers.push(trigger),
                Err(e) => tracing::warn!("Failed to hash {}: {}", path.display(), e),
            }
        }

        Ok(triggers)
    }

    /// Watch the directory and emit triggers for new stable files.
    ///
    /// The notify subscription is live when this returns; the loop runs on
    /// the blocking pool until stopped via the returned handle.
    pub fn watch(&self) -> Result<(mpsc::Receiver<TriggerEvent>, WatchHandle), WatcherError> {
        self.config.validate()?;

        let (event_tx, event_rx) = mpsc::channel::<TriggerEvent>(100);
        let (stop_tx, stop_rx) = mpsc::channel::<()>(1);

        let (tx, rx) = std::sync::mpsc::channel();
        let mut debouncer = new_debouncer(Duration::from_secs(2), tx)?;
        debouncer
            .watcher()
            .watch(&self.config.watch_path, RecursiveMode::NonRecursive)?;

        tracing::info!("Watching {} for segments", self.config.watch_path.display());

        let config = self.config.clone();
        let runtime = Handle::current();

        let task = tokio::task::spawn_blocking(move || {
            // Dropping the debouncer ends the subscription
            let _debouncer = debouncer;
            run_watcher(config, runtime, rx, event_tx, stop_rx);
        });

        Ok((event_rx, WatchHandle { stop_tx, task }))
    }

    /// Subscribe to the directory, then scan what is already there.
    ///
    /// Segments written while the backlog is being processed arrive on the
    /// live channel. A file can show up in both; the ledger skips the repeat.
    pub async fn watch_with_backlog(&self) -> Result<Subscription, WatcherError> {
        let (live, handle) = self.watch()?;
        let backlog = match self.scan_once().await {
            Ok(backlog) => backlog,
            Err(e) => {
                handle.stop().await?;
                return Err(e);
            }
        };

        Ok(Subscription {
            backlog,
            live,
            handle,
        })
    }
}

/// Segments present at subscription time plus a stream of new ones
pub struct Subscription {
    pub backlog: Vec<TriggerEvent>,
    pub live: mpsc::Receiver<TriggerEvent>,
    pub handle: WatchHandle,
}

/// Handle to control the watcher
pub struct WatchHandle {
    stop_tx: mpsc::Sender<()>,
    task: tokio::task::JoinHandle<()>,
}

impl WatchHandle {
    /// Stop the watcher
    pub async fn stop(self) -> Result<(), WatcherError> {
        let _ = self.stop_tx.send(()).await;
        self.task.await?;
        Ok(())
    }
}

/// First 12 hex characters of the file's SHA256
pub async fn compute_file_hash(path: &Path) -> Result<String, std::io::Error> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hex::encode(hasher.finalize())[..12].to_string())
}

/// Build the trigger for a segment file
pub async fn trigger_for(path: &Path) -> Result<TriggerEvent, std::io::Error> {
    let hash = compute_file_hash(path).await?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    Ok(TriggerEvent::new(
        format!("{}@{}", name, hash),
        path.to_string_lossy().to_string(),
    ))
}

/// Internal watcher loop; blocks its thread
fn run_watcher(
    config: WatcherConfig,
    runtime: Handle,
    rx: std::sync::mpsc::Receiver<DebounceEventResult>,
    event_tx: mpsc::Sender<TriggerEvent>,
    mut stop_rx: mpsc::Receiver<()>,
) {
    // Files being stabilized (path -> (size, last_seen))
    let mut pending: HashMap<PathBuf, (u64, Instant)> = HashMap::new();
    let stability_delay = Duration::from_secs(config.stability_delay_secs);

    loop {
        match stop_rx.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => {
                tracing::info!("Watcher stopping...");
                break;
            }
            Err(TryRecvError::Empty) => {}
        }

        match rx.recv_timeout(Duration::from_millis(500)) {
            Ok(Ok(events)) => {
                for event in events {
                    let path = event.path;
                    if !config.is_segment(&path) {
                        continue;
                    }
                    if let Ok(metadata) = std::fs::metadata(&path) {
                        if metadata.is_file() {
                            pending.insert(path, (metadata.len(), Instant::now()));
                        }
                    }
                }
            }
            Ok(Err(e)) => {
                tracing::warn!("Watcher error: {:?}", e);
            }
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                tracing::error!("Watcher channel disconnected");
                break;
            }
        }

        let now = Instant::now();
        let mut stable = Vec::new();

        for (path, (last_size, last_seen)) in pending.iter_mut() {
            if now.duration_since(*last_seen) < stability_delay {
                continue;
            }
            match std::fs::metadata(&*path) {
                Ok(metadata) if metadata.len() == *last_size && *last_size > 0 => {
                    stable.push(path.clone());
                }
                Ok(metadata) => {
                    // Still being written; restart the clock
                    *last_size = metadata.len();
                    *last_seen = now;
                }
                Err(_) => stable.push(path.clone()),
            }
        }

        for path in stable {
            pending.remove(&path);
            if !path.exists() {
                continue;
            }

            match runtime.block_on(trigger_for(&path)) {
                Ok(trigger) => {
                    tracing::info!(artifact_id = %trigger.artifact_id, "New segment detected");
                    // Waits for the consumer when the channel is full
                    if event_tx.blocking_send(trigger).is_err() {
                        tracing::debug!("Trigger receiver dropped, stopping watcher");
                        return;
                    }
                }
                Err(e) => {
                    tracing::warn!("Failed to hash {}: {}", path.display(), e);
                }
            }
        }
    }
}
