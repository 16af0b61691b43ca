//! Versioned key/value stores backing the idempotency ledger.
//!
//! Every store offers one synchronization primitive: `compare_and_swap`,
//! which writes a record only if the stored version still equals the
//! version the caller read. Lease and state-machine rules live in
//! [`IdempotencyLedger`](super::ledger::IdempotencyLedger); stores only
//! guarantee that concurrent writers cannot both win.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use fs2::FileExt;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::domain::ProcessingRecord;

/// Errors from ledger storage
#[derive(Debug, Error)]
pub enum LedgerError {
    /// The stored version moved since it was read
    #[error("Version conflict for artifact {artifact_id}")]
    Conflict { artifact_id: String },

    /// Another attempt owns the artifact
    #[error("Lease for artifact {artifact_id} is held by another attempt")]
    LeaseConflict { artifact_id: String },

    #[error("No ledger record for artifact {0}")]
    Missing(String),

    #[error("Ledger I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Ledger serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Ledger database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Ledger task failed: {0}")]
    Task(String),
}

impl LedgerError {
    /// Whether the operation may succeed if the trigger is redelivered
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Conflict { .. } | Self::Io(_) | Self::Database(_) | Self::Task(_)
        )
    }
}

/// A record together with the version it was read at
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Versioned {
    pub version: u64,
    pub record: ProcessingRecord,
}

/// Conditional-write key/value store keyed by artifact ID
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Human-readable store name
    fn name(&self) -> &str;

    /// Read the current record for `artifact_id`
    async fn load(&self, artifact_id: &str) -> Result<Option<Versioned>, LedgerError>;

    /// Write `record` if the stored version equals `expected`.
    ///
    /// `expected = None` means "create; fail if a record exists". Returns the
    /// new version, or `LedgerError::Conflict` when another writer got there
    /// first.
    async fn compare_and_swap(
        &self,
        expected: Option<u64>,
        record: ProcessingRecord,
    ) -> Result<u64, LedgerError>;

    /// Records ordered by most recent update first
    async fn list(&self, limit: usize) -> Result<Vec<ProcessingRecord>, LedgerError>;
}

fn check_version(
    artifact_id: &str,
    current: Option<u64>,
    expected: Option<u64>,
) -> Result<u64, LedgerError> {
    if current != expected {
        return Err(LedgerError::Conflict {
            artifact_id: artifact_id.to_string(),
        });
    }
    Ok(expected.map(|v| v + 1).unwrap_or(1))
}

fn most_recent_first(mut records: Vec<ProcessingRecord>, limit: usize) -> Vec<ProcessingRecord> {
    records.sort_by(|a, b| b.last_updated.cmp(&a.last_updated));
    records.truncate(limit);
    records
}

async fn run_blocking<T, F>(f: F) -> Result<T, LedgerError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, LedgerError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| LedgerError::Task(e.to_string()))?
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

/// Mutex-guarded map; state is lost when the process exits
#[derive(Debug, Default)]
pub struct MemoryLedgerStore {
    records: Mutex<HashMap<String, Versioned>>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Versioned>>, LedgerError> {
        self.records
            .lock()
            .map_err(|_| LedgerError::Task("ledger mutex poisoned".to_string()))
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn load(&self, artifact_id: &str) -> Result<Option<Versioned>, LedgerError> {
        Ok(self.lock()?.get(artifact_id).cloned())
    }

    async fn compare_and_swap(
        &self,
        expected: Option<u64>,
        record: ProcessingRecord,
    ) -> Result<u64, LedgerError> {
        let mut records = self.lock()?;
        let current = records.get(&record.artifact_id).map(|v| v.version);
        let version = check_version(&record.artifact_id, current, expected)?;

        records.insert(record.artifact_id.clone(), Versioned { version, record });
        Ok(version)
    }

    async fn list(&self, limit: usize) -> Result<Vec<ProcessingRecord>, LedgerError> {
        let records = self.lock()?.values().map(|v| v.record.clone()).collect();
        Ok(most_recent_first(records, limit))
    }
}

// ---------------------------------------------------------------------------
// JSONL
// ---------------------------------------------------------------------------

/// Minimum log length before compaction is considered
const DEFAULT_COMPACT_MIN_LINES: usize = 1024;

/// Compact once the log holds this many lines per live record
const COMPACT_RATIO: usize = 8;

/// One line of the ledger log
#[derive(Debug, Serialize, Deserialize)]
struct LedgerLine {
    ts: String,
    version: u64,
    record: ProcessingRecord,
}

/// Result of replaying the log
#[derive(Debug, Default)]
struct Replay {
    state: HashMap<String, Versioned>,
    /// Parsed record lines
    lines: usize,
    /// Length of the log up to the end of the last intact line
    intact_len: u64,
    /// An interrupted append left bytes past `intact_len`
    torn_tail: bool,
    /// The intact part is empty or ends with a newline
    terminated: bool,
}

/// Append-only JSONL ledger; the latest version of each artifact wins on replay.
///
/// Writers serialize on an exclusive lock of a sidecar `<file>.lock`, so the
/// log itself can be replaced atomically when it is compacted.
#[derive(Debug, Clone)]
pub struct JsonlLedgerStore {
    path: PathBuf,
    compact_min_lines: usize,
}

impl JsonlLedgerStore {
    /// Open (or lazily create) a ledger file at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            compact_min_lines: DEFAULT_COMPACT_MIN_LINES,
        }
    }

    /// Compact once the log reaches `lines` lines (and is mostly history)
    pub fn with_compaction_threshold(mut self, lines: usize) -> Self {
        self.compact_min_lines = lines.max(1);
        self
    }

    /// Path to the ledger file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_file(path: &Path) -> Result<File, LedgerError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut name = path.as_os_str().to_owned();
        name.push(".lock");
        Ok(OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(PathBuf::from(name))?)
    }

    fn read_log(path: &Path) -> Result<Vec<u8>, LedgerError> {
        match std::fs::read(path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Replay the log into the latest version of every record.
    ///
    /// An unparseable final line is what a crash mid-append leaves behind and
    /// is skipped; a bad line anywhere else is an error.
    fn replay(path: &Path, bytes: &[u8]) -> Result<Replay, LedgerError> {
        let mut replay = Replay {
            terminated: true,
            ..Default::default()
        };
        let mut offset = 0usize;
        let mut segments = bytes.split_inclusive(|b| *b == b'\n').peekable();

        while let Some(segment) = segments.next() {
            let is_last = segments.peek().is_none();
            let line = segment.strip_suffix(b"\n").unwrap_or(segment);

            if !line.iter().all(u8::is_ascii_whitespace) {
                match serde_json::from_slice::<LedgerLine>(line) {
                    Ok(entry) => {
                        replay.lines += 1;
                        let newer = replay
                            .state
                            .get(&entry.record.artifact_id)
                            .map(|v| entry.version > v.version)
                            .unwrap_or(true);
                        if newer {
                            replay.state.insert(
                                entry.record.artifact_id.clone(),
                                Versioned {
                                    version: entry.version,
                                    record: entry.record,
                                },
                            );
                        }
                    }
                    Err(e) if is_last => {
                        warn!(
                            path = %path.display(),
                            offset,
                            error = %e,
                            "Ignoring torn trailing ledger line"
                        );
                        replay.torn_tail = true;
                        break;
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            offset += segment.len();
            replay.intact_len = offset as u64;
            replay.terminated = segment.ends_with(b"\n");
        }

        Ok(replay)
    }

    fn read_state(path: &Path) -> Result<HashMap<String, Versioned>, LedgerError> {
        let lock = Self::lock_file(path)?;
        lock.lock_shared()?;
        let replay = Self::read_log(path).and_then(|bytes| Self::replay(path, &bytes));
        FileExt::unlock(&lock)?;
        Ok(replay?.state)
    }

    /// Replace the log with one line per live record
    fn compact(path: &Path, state: HashMap<String, Versioned>) -> Result<(), LedgerError> {
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut entries: Vec<Versioned> = state.into_values().collect();
        entries.sort_by(|a, b| a.record.artifact_id.cmp(&b.record.artifact_id));

        let ts = Utc::now().to_rfc3339();
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        for entry in entries {
            let line = LedgerLine {
                ts: ts.clone(),
                version: entry.version,
                record: entry.record,
            };
            writeln!(tmp, "{}", serde_json::to_string(&line)?)?;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for JsonlLedgerStore {
    fn name(&self) -> &str {
        "jsonl"
    }

    async fn load(&self, artifact_id: &str) -> Result<Option<Versioned>, LedgerError> {
        let path = self.path.clone();
        let artifact_id = artifact_id.to_string();
        run_blocking(move || Ok(Self::read_state(&path)?.remove(&artifact_id))).await
    }

    async fn compare_and_swap(
        &self,
        expected: Option<u64>,
        record: ProcessingRecord,
    ) -> Result<u64, LedgerError> {
        let path = self.path.clone();
        let compact_min_lines = self.compact_min_lines;
        run_blocking(move || {
            let lock = Self::lock_file(&path)?;

            // Held across read-check-write; released when the lock file drops
            lock.lock_exclusive()?;

            let mut replay = Self::replay(&path, &Self::read_log(&path)?)?;
            let current = replay.state.get(&record.artifact_id).map(|v| v.version);
            let version = check_version(&record.artifact_id, current, expected)?;

            let live = replay.state.len().max(1);
            if replay.lines + 1 >= compact_min_lines && replay.lines + 1 >= live * COMPACT_RATIO {
                debug!(
                    path = %path.display(),
                    lines = replay.lines + 1,
                    live,
                    "Compacting ledger log"
                );
                replay
                    .state
                    .insert(record.artifact_id.clone(), Versioned { version, record });
                Self::compact(&path, replay.state)?;
                return Ok(version);
            }

            let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
            if replay.torn_tail {
                file.set_len(replay.intact_len)?;
            }

            let line = LedgerLine {
                ts: Utc::now().to_rfc3339(),
                version,
                record,
            };
            let mut buf = Vec::new();
            if !replay.terminated {
                buf.push(b'\n');
            }
            serde_json::to_writer(&mut buf, &line)?;
            buf.push(b'\n');

            file.write_all(&buf)?;
            file.sync_data()?;

            Ok(version)
        })
        .await
    }

    async fn list(&self, limit: usize) -> Result<Vec<ProcessingRecord>, LedgerError> {
        let path = self.path.clone();
        run_blocking(move || {
            let records = Self::read_state(&path)?
                .into_values()
                .map(|v| v.record)
                .collect();
            Ok(most_recent_first(records, limit))
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// SQLite
// ---------------------------------------------------------------------------

/// SQLite ledger with one row per artifact and a version column
#[derive(Clone)]
pub struct SqliteLedgerStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteLedgerStore {
    /// Open (creating if needed) a ledger database at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Self::init(conn)
    }

    /// In-memory database (for tests)
    pub fn in_memory() -> Result<Self, LedgerError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, LedgerError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS ledger (
                artifact_id TEXT PRIMARY KEY,
                version INTEGER NOT NULL,
                status TEXT NOT NULL,
                last_updated TEXT NOT NULL,
                record TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_ledger_updated ON ledger(last_updated);
            "#,
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, LedgerError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, LedgerError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        run_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|_| LedgerError::Task("sqlite connection mutex poisoned".to_string()))?;
            f(&conn)
        })
        .await
    }
}

fn status_column(record: &ProcessingRecord) -> Result<String, LedgerError> {
    match serde_json::to_value(record.status)? {
        serde_json::Value::String(s) => Ok(s),
        other => Ok(other.to_string()),
    }
}

#[async_trait]
impl LedgerStore for SqliteLedgerStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn load(&self, artifact_id: &str) -> Result<Option<Versioned>, LedgerError> {
        let artifact_id = artifact_id.to_string();
        self.with_conn(move |conn| {
            let row: Option<(i64, String)> = conn
                .query_row(
                    "SELECT version, record FROM ledger WHERE artifact_id = ?",
                    [&artifact_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            match row {
                Some((version, json)) => Ok(Some(Versioned {
                    version: version as u64,
                    record: serde_json::from_str(&json)?,
                })),
                None => Ok(None),
            }
        })
        .await
    }

    async fn compare_and_swap(
        &self,
        expected: Option<u64>,
        record: ProcessingRecord,
    ) -> Result<u64, LedgerError> {
        self.with_conn(move |conn| {
            let json = serde_json::to_string(&record)?;
            let status = status_column(&record)?;
            let updated = record.last_updated.to_rfc3339();

            let (changed, version) = match expected {
                None => {
                    let changed = conn.execute(
                        "INSERT OR IGNORE INTO ledger (artifact_id, version, status, last_updated, record)
                         VALUES (?1, 1, ?2, ?3, ?4)",
                        params![record.artifact_id, status, updated, json],
                    )?;
                    (changed, 1)
                }
                Some(current) => {
                    let next = current + 1;
                    let changed = conn.execute(
                        "UPDATE ledger SET version = ?1, status = ?2, last_updated = ?3, record = ?4
                         WHERE artifact_id = ?5 AND version = ?6",
                        params![
                            next as i64,
                            status,
                            updated,
                            json,
                            record.artifact_id,
                            current as i64
                        ],
                    )?;
                    (changed, next)
                }
            };

            if changed == 0 {
                return Err(LedgerError::Conflict {
                    artifact_id: record.artifact_id,
                });
            }
            Ok(version)
        })
        .await
    }

    async fn list(&self, limit: usize) -> Result<Vec<ProcessingRecord>, LedgerError> {
        self.with_conn(move |conn| {
            let mut stmt =
                conn.prepare("SELECT record FROM ledger ORDER BY last_updated DESC LIMIT ?")?;
            let rows = stmt.query_map([limit as i64], |row| row.get::<_, String>(0))?;

            let mut records = Vec::new();
            for json in rows {
                records.push(serde_json::from_str(&json?)?);
            }
            Ok(records)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use uuid::Uuid;

    fn record(id: &str) -> ProcessingRecord {
        ProcessingRecord::first_attempt(
            id,
            format!("{}.mp4", id),
            Uuid::new_v4(),
            Utc::now() + Duration::seconds(60),
        )
    }

    async fn exercise_cas(store: &dyn LedgerStore) {
        assert!(store.load("seg-001").await.unwrap().is_none());

        let v1 = store.compare_and_swap(None, record("seg-001")).await.unwrap();
        assert_eq!(v1, 1);

        // A second create loses
        let err = store.compare_and_swap(None, record("seg-001")).await.unwrap_err();
        assert!(matches!(err, LedgerError::Conflict { .. }));

        let mut next = store.load("seg-001").await.unwrap().unwrap().record;
        next.attempt_count = 2;
        let v2 = store.compare_and_swap(Some(1), next.clone()).await.unwrap();
        assert_eq!(v2, 2);

        // A stale version loses
        let err = store.compare_and_swap(Some(1), next).await.unwrap_err();
        assert!(matches!(err, LedgerError::Conflict { .. }));

        let loaded = store.load("seg-001").await.unwrap().unwrap();
        assert_eq!(loaded.version, 2);
        assert_eq!(loaded.record.attempt_count, 2);
    }

    #[tokio::test]
    async fn test_memory_store_cas() {
        exercise_cas(&MemoryLedgerStore::new()).await;
    }

    #[tokio::test]
    async fn test_jsonl_store_cas() {
        let dir = tempfile::tempdir().unwrap();
        exercise_cas(&JsonlLedgerStore::new(dir.path().join("ledger.jsonl"))).await;
    }

    #[tokio::test]
    async fn test_sqlite_store_cas() {
        exercise_cas(&SqliteLedgerStore::in_memory().unwrap()).await;
    }

    #[tokio::test]
    async fn test_jsonl_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");

        {
            let store = JsonlLedgerStore::new(&path);
            store.compare_and_swap(None, record("seg-001")).await.unwrap();
            store.compare_and_swap(None, record("seg-002")).await.unwrap();
        }

        let reopened = JsonlLedgerStore::new(&path);
        assert_eq!(reopened.list(10).await.unwrap().len(), 2);
        assert_eq!(reopened.load("seg-002").await.unwrap().unwrap().version, 1);
    }

    fn append_raw(path: &Path, bytes: &[u8]) {
        let mut file = OpenOptions::new().append(true).open(path).unwrap();
        file.write_all(bytes).unwrap();
    }

    fn log_lines(path: &Path) -> Vec<LedgerLine> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_jsonl_torn_tail_is_skipped_then_repaired() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        let store = JsonlLedgerStore::new(&path);
        store.compare_and_swap(None, record("seg-1")).await.unwrap();

        // What a crash in the middle of an append leaves behind
        append_raw(&path, br#"{"ts":"2026-01-01T00:00:00Z","version":2,"rec"#);

        assert_eq!(store.load("seg-1").await.unwrap().unwrap().version, 1);
        assert!(store.load("seg-unrelated").await.unwrap().is_none());
        assert_eq!(store.list(10).await.unwrap().len(), 1);

        // The next write drops the torn bytes before appending
        store.compare_and_swap(None, record("seg-2")).await.unwrap();
        let lines = log_lines(&path);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1].record.artifact_id, "seg-2");

        let reopened = JsonlLedgerStore::new(&path);
        assert_eq!(reopened.load("seg-1").await.unwrap().unwrap().version, 1);
        assert_eq!(reopened.load("seg-2").await.unwrap().unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_jsonl_unterminated_tail_gets_newline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        let store = JsonlLedgerStore::new(&path);
        store.compare_and_swap(None, record("seg-1")).await.unwrap();

        // A complete record whose newline never reached the disk
        let contents = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, contents.trim_end()).unwrap();

        store.compare_and_swap(None, record("seg-2")).await.unwrap();
        assert_eq!(log_lines(&path).len(), 2);
    }

    #[tokio::test]
    async fn test_jsonl_corrupt_middle_line_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        let store = JsonlLedgerStore::new(&path);
        store.compare_and_swap(None, record("seg-1")).await.unwrap();
        let intact = std::fs::read(&path).unwrap();
        append_raw(&path, b"not json\n");
        append_raw(&path, &intact);

        let err = store
            .compare_and_swap(None, record("seg-2"))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Serialization(_)));

        let err = store.load("seg-1").await.unwrap_err();
        assert!(matches!(err, LedgerError::Serialization(_)));
    }

    #[tokio::test]
    async fn test_jsonl_compacts_history() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        let store = JsonlLedgerStore::new(&path).with_compaction_threshold(16);

        store.compare_and_swap(None, record("seg-other")).await.unwrap();
        let mut version = store.compare_and_swap(None, record("seg-1")).await.unwrap();
        for attempt in 2..=40 {
            let mut next = store.load("seg-1").await.unwrap().unwrap().record;
            next.attempt_count = attempt;
            version = store.compare_and_swap(Some(version), next).await.unwrap();
        }

        assert_eq!(version, 40);
        assert!(log_lines(&path).len() < 16);

        let loaded = store.load("seg-1").await.unwrap().unwrap();
        assert_eq!(loaded.version, 40);
        assert_eq!(loaded.record.attempt_count, 40);
        assert_eq!(store.load("seg-other").await.unwrap().unwrap().version, 1);

        // Stale writers still lose after compaction
        let stale = store.compare_and_swap(Some(39), loaded.record).await.unwrap_err();
        assert!(matches!(stale, LedgerError::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_list_most_recent_first() {
        let store = MemoryLedgerStore::new();
        let mut older = record("old");
        older.last_updated = Utc::now() - Duration::hours(1);
        store.compare_and_swap(None, older).await.unwrap();
        store.compare_and_swap(None, record("new")).await.unwrap();

        let records = store.list(10).await.unwrap();
        assert_eq!(records[0].artifact_id, "new");

        assert_eq!(store.list(1).await.unwrap().len(), 1);
    }

    #[test]
    fn test_error_retryability() {
        assert!(LedgerError::Conflict {
            artifact_id: "a".into()
        }
        .is_retryable());
        assert!(!LedgerError::Missing("a".into()).is_retryable());
    }
}
