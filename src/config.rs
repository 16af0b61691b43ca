//! Configuration for vigil.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (VIGIL_HOME, VIGIL_WATCH_DIR, VIGIL_INFERENCE_ENDPOINT,
//!    VIGIL_INFERENCE_API_KEY, VIGIL_WEBHOOK_URL, VIGIL_WEBHOOK_TOKEN,
//!    TELEGRAM_BOT_TOKEN, TELEGRAM_CHAT_ID)
//! 2. Config file (.vigil/config.yaml)
//! 3. Defaults (~/.vigil)
//!
//! Config file discovery:
//! - Searches current directory and parents for .vigil/config.yaml
//! - `paths.home` is relative to the .vigil/ directory; other paths are
//!   relative to the project root (the parent of .vigil/)

pub mod paths;

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::adapters::{HttpModelConfig, PromptSchema, TelegramConfig};
use crate::core::{LedgerSettings, PipelineSettings, RetryPolicy, SegmentLimits, Timeouts};
use crate::domain::RiskLevel;
use crate::ingest::DispatcherConfig;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub timeouts: Timeouts,
    #[serde(default)]
    pub notification_retry: RetryPolicy,
    #[serde(default)]
    pub limits: SegmentLimits,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub inference: Option<InferenceConfig>,
    #[serde(default)]
    pub prompt: PromptSchema,
    #[serde(default)]
    pub notifier: NotifierConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Engine state directory (relative to .vigil/)
    pub home: Option<String>,
    /// Drop directory the motion detector writes to
    pub watch_dir: Option<String>,
}

/// Orchestration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_lease_seconds")]
    pub lease_seconds: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub alert_threshold: RiskLevel,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_max_redeliveries")]
    pub max_redeliveries: u32,
}

fn default_lease_seconds() -> u64 {
    300
}
fn default_max_attempts() -> u32 {
    3
}
fn default_workers() -> usize {
    4
}
fn default_max_redeliveries() -> u32 {
    3
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            lease_seconds: default_lease_seconds(),
            max_attempts: default_max_attempts(),
            alert_threshold: RiskLevel::default(),
            workers: default_workers(),
            max_redeliveries: default_max_redeliveries(),
        }
    }
}

/// Ledger storage backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerBackend {
    #[default]
    Sqlite,
    Jsonl,
    Memory,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerConfig {
    #[serde(default)]
    pub backend: LedgerBackend,
    /// Ledger file (defaults to $VIGIL_HOME/ledger.db or ledger.jsonl)
    #[serde(default)]
    pub path: Option<String>,
}

/// Where segments are fetched from
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreConfig {
    Fs {
        /// Root for relative locators (defaults to the watch directory)
        #[serde(default)]
        root: Option<String>,
    },
    Http {
        endpoint: String,
        #[serde(default)]
        token: Option<String>,
    },
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::Fs { root: None }
    }
}

/// Which model backend runs inference
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InferenceConfig {
    Http(HttpModelConfig),
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

/// Where alerts go
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NotifierConfig {
    #[default]
    Log,
    Webhook {
        url: String,
        #[serde(default)]
        token: Option<String>,
    },
    Telegram(TelegramConfig),
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Absolute path to vigil home (engine state)
    pub home: PathBuf,
    /// Drop directory watched for new segments
    pub watch_dir: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub pipeline: PipelineConfig,
    pub timeouts: Timeouts,
    pub notification_retry: RetryPolicy,
    pub limits: SegmentLimits,
    pub ledger_backend: LedgerBackend,
    /// Absolute path to the ledger file
    pub ledger_path: PathBuf,
    pub store: StoreConfig,
    pub inference: Option<InferenceConfig>,
    pub prompt: PromptSchema,
    pub notifier: NotifierConfig,
}

impl ResolvedConfig {
    /// Settings handed to the orchestrator
    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            alert_threshold: self.pipeline.alert_threshold,
            fetch_timeout: self.timeouts.fetch(),
            notify_timeout: self.timeouts.notify(),
            notification_retry: self.notification_retry.clone(),
        }
    }

    /// Settings handed to the ledger
    pub fn ledger_settings(&self) -> LedgerSettings {
        LedgerSettings {
            lease_duration: Duration::from_secs(self.pipeline.lease_seconds),
            max_attempts: self.pipeline.max_attempts,
        }
    }

    /// Longest stretch an attempt runs without renewing its lease.
    ///
    /// The lease is renewed after fetch and after inference. Publishing counts
    /// every retry attempt and the backoff between them.
    pub fn longest_unrenewed_step(&self) -> Duration {
        let publish = self.notification_retry.worst_case(self.timeouts.notify());
        self.timeouts
            .fetch()
            .max(self.timeouts.inference())
            .max(publish)
    }

    /// The step duration a lease cannot cover, if any
    pub fn lease_shortfall(&self) -> Option<Duration> {
        let needed = self.longest_unrenewed_step();
        (Duration::from_secs(self.pipeline.lease_seconds) <= needed).then_some(needed)
    }

    /// Settings handed to the dispatcher
    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            workers: self.pipeline.workers,
            max_redeliveries: self.pipeline.max_redeliveries,
            ..Default::default()
        }
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".vigil").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_config(&content).with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Parse config file YAML
pub fn parse_config(content: &str) -> Result<ConfigFile> {
    Ok(serde_yaml::from_str(content)?)
}

/// Resolve a path that may be relative to `base`
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Combine a parsed config file, the environment, and defaults
fn resolve<F>(
    default_home: PathBuf,
    file: Option<(&Path, ConfigFile)>,
    env: F,
) -> ResolvedConfig
where
    F: Fn(&str) -> Option<String>,
{
    let config_file = file.as_ref().map(|(path, _)| path.to_path_buf());
    let (vigil_dir, base_dir, config) = match file {
        Some((path, config)) => {
            // .vigil/ and the project root above it
            let vigil_dir = path.parent().unwrap_or(Path::new(".")).to_path_buf();
            let base_dir = vigil_dir.parent().unwrap_or(Path::new(".")).to_path_buf();
            (Some(vigil_dir), Some(base_dir), config)
        }
        None => (None, None, ConfigFile::default()),
    };

    let relative_to = |base: &Option<PathBuf>, value: &str| match base {
        Some(base) => resolve_path(base, value),
        None => PathBuf::from(value),
    };

    let home = if let Some(env_home) = env("VIGIL_HOME") {
        PathBuf::from(env_home)
    } else if let Some(ref home) = config.paths.home {
        relative_to(&vigil_dir, home)
    } else {
        default_home
    };

    let watch_dir = if let Some(env_dir) = env("VIGIL_WATCH_DIR") {
        PathBuf::from(env_dir)
    } else if let Some(ref dir) = config.paths.watch_dir {
        relative_to(&base_dir, dir)
    } else {
        home.join("segments")
    };

    let ledger_path = match config.ledger.path {
        Some(ref path) => relative_to(&base_dir, path),
        None => match config.ledger.backend {
            LedgerBackend::Jsonl => home.join("ledger.jsonl"),
            _ => home.join("ledger.db"),
        },
    };

    let store = match config.store {
        StoreConfig::Fs { root: Some(root) } => StoreConfig::Fs {
            root: Some(relative_to(&base_dir, &root).to_string_lossy().to_string()),
        },
        other => other,
    };

    let inference = match env("VIGIL_INFERENCE_ENDPOINT") {
        Some(endpoint) => {
            let mut model = match config.inference {
                Some(InferenceConfig::Http(model)) => model,
                _ => HttpModelConfig::new(endpoint.clone()),
            };
            model.endpoint = endpoint;
            Some(InferenceConfig::Http(model))
        }
        None => config.inference,
    };
    let inference = match (inference, env("VIGIL_INFERENCE_API_KEY")) {
        (Some(InferenceConfig::Http(mut model)), Some(key)) => {
            model.api_key = Some(key);
            Some(InferenceConfig::Http(model))
        }
        (inference, _) => inference,
    };

    let notifier = if let Some(url) = env("VIGIL_WEBHOOK_URL") {
        NotifierConfig::Webhook {
            url,
            token: env("VIGIL_WEBHOOK_TOKEN"),
        }
    } else if let (Some(bot_token), Some(chat_id)) = (env("TELEGRAM_BOT_TOKEN"), env("TELEGRAM_CHAT_ID")) {
        NotifierConfig::Telegram(TelegramConfig { bot_token, chat_id })
    } else {
        config.notifier
    };

    ResolvedConfig {
        home,
        watch_dir,
        config_file,
        pipeline: config.pipeline,
        timeouts: config.timeouts,
        notification_retry: config.notification_retry,
        limits: config.limits,
        ledger_backend: config.ledger.backend,
        ledger_path,
        store,
        inference,
        prompt: config.prompt,
        notifier,
    }
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".vigil");

    let file = match find_config_file() {
        Some(path) => {
            let config = load_config_file(&path)?;
            Some((path, config))
        }
        None => None,
    };

    let file = file.as_ref().map(|(path, config)| (path.as_path(), config.clone()));

    let resolved = resolve(default_home, file, |key| std::env::var(key).ok());
    if let Some(needed) = resolved.lease_shortfall() {
        tracing::warn!(
            lease_seconds = resolved.pipeline.lease_seconds,
            needed_seconds = needed.as_secs(),
            "Lease can expire mid-step; another worker may take over and alert twice"
        );
    }

    Ok(resolved)
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| e.to_string()));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Get the vigil home directory (engine state).
pub fn vigil_home() -> Result<PathBuf> {
    Ok(config()?.home.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::TempDir;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_defaults_without_file() {
        let config = resolve(PathBuf::from("/home/op/.vigil"), None, no_env);

        assert_eq!(config.home, PathBuf::from("/home/op/.vigil"));
        assert_eq!(config.watch_dir, PathBuf::from("/home/op/.vigil/segments"));
        assert_eq!(config.ledger_path, PathBuf::from("/home/op/.vigil/ledger.db"));
        assert_eq!(config.ledger_backend, LedgerBackend::Sqlite);
        assert_eq!(config.pipeline.lease_seconds, 300);
        assert_eq!(config.pipeline.max_attempts, 3);
        assert_eq!(config.pipeline.alert_threshold, RiskLevel::High);
        assert!(config.inference.is_none());
        assert!(matches!(config.notifier, NotifierConfig::Log));
        assert!(config.config_file.is_none());
    }

    #[test]
    fn test_lease_must_outlast_slowest_step() {
        let defaults = resolve(PathBuf::from("/home/op/.vigil"), None, no_env);
        assert!(defaults.lease_shortfall().is_none());

        let short_lease = parse_config("pipeline:\n  lease_seconds: 60\n").unwrap();
        let config = resolve(
            PathBuf::from("/unused"),
            Some((Path::new("/p/.vigil/config.yaml"), short_lease)),
            no_env,
        );
        assert_eq!(config.lease_shortfall(), Some(Duration::from_secs(120)));

        // Five 30s publish attempts plus backoff outrun a 150s lease
        let slow_publish = parse_config(
            r#"
pipeline:
  lease_seconds: 150
timeouts:
  notify_seconds: 30
notification_retry:
  max_attempts: 5
  initial_delay_ms: 1000
  max_delay_ms: 1000
"#,
        )
        .unwrap();
        let config = resolve(
            PathBuf::from("/unused"),
            Some((Path::new("/p/.vigil/config.yaml"), slow_publish)),
            no_env,
        );
        assert_eq!(config.longest_unrenewed_step(), Duration::from_secs(154));
        assert_eq!(config.lease_shortfall(), Some(Duration::from_secs(154)));
    }

    #[test]
    fn test_config_file_parsing() {
        let temp = TempDir::new().unwrap();
        let vigil_dir = temp.path().join(".vigil");
        std::fs::create_dir_all(&vigil_dir).unwrap();

        let config_path = vigil_dir.join("config.yaml");
        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(
            file,
            r#"
version: "1.0"
paths:
  home: ./state
  watch_dir: drop
pipeline:
  lease_seconds: 120
  alert_threshold: medium
ledger:
  backend: jsonl
inference:
  kind: http
  endpoint: https://model.local
  model_id: amazon.nova-pro-v1:0
notifier:
  kind: webhook
  url: https://hooks.local/alerts
notification_retry:
  max_attempts: 5
"#
        )
        .unwrap();

        let parsed = load_config_file(&config_path).unwrap();
        let config = resolve(PathBuf::from("/unused"), Some((config_path.as_path(), parsed)), no_env);

        assert_eq!(config.home, vigil_dir.join("state"));
        assert_eq!(config.watch_dir, temp.path().join("drop"));
        assert_eq!(config.ledger_path, vigil_dir.join("state").join("ledger.jsonl"));
        assert_eq!(config.pipeline.lease_seconds, 120);
        assert_eq!(config.pipeline.max_attempts, 3);
        assert_eq!(config.pipeline_settings().alert_threshold, RiskLevel::Medium);
        assert_eq!(config.notification_retry.max_attempts, 5);

        match config.inference {
            Some(InferenceConfig::Http(model)) => {
                assert_eq!(model.endpoint, "https://model.local");
                assert_eq!(model.model_id, "amazon.nova-pro-v1:0");
                assert_eq!(model.max_new_tokens, 3200);
            }
            other => panic!("unexpected inference config: {:?}", other),
        }
        assert!(matches!(config.notifier, NotifierConfig::Webhook { .. }));
    }

    #[test]
    fn test_env_overrides_file() {
        let parsed = parse_config(
            r#"
inference:
  kind: command
  program: ./model.sh
notifier:
  kind: log
"#,
        )
        .unwrap();

        let env: HashMap<&str, &str> = [
            ("VIGIL_HOME", "/srv/vigil"),
            ("VIGIL_INFERENCE_ENDPOINT", "https://bedrock.local"),
            ("VIGIL_INFERENCE_API_KEY", "secret"),
            ("TELEGRAM_BOT_TOKEN", "TOKEN"),
            ("TELEGRAM_CHAT_ID", "42"),
        ]
        .into_iter()
        .collect();

        let config = resolve(
            PathBuf::from("/unused"),
            Some((Path::new("/project/.vigil/config.yaml"), parsed)),
            |key| env.get(key).map(|v| v.to_string()),
        );

        assert_eq!(config.home, PathBuf::from("/srv/vigil"));
        match config.inference {
            Some(InferenceConfig::Http(model)) => {
                assert_eq!(model.endpoint, "https://bedrock.local");
                assert_eq!(model.api_key.as_deref(), Some("secret"));
            }
            other => panic!("unexpected inference config: {:?}", other),
        }
        match config.notifier {
            NotifierConfig::Telegram(telegram) => assert_eq!(telegram.chat_id, "42"),
            other => panic!("unexpected notifier: {:?}", other),
        }
    }

    #[test]
    fn test_resolve_relative_path() {
        let base = PathBuf::from("/home/user/project");

        assert_eq!(
            resolve_path(&base, "./subdir"),
            PathBuf::from("/home/user/project/subdir")
        );
        assert_eq!(
            resolve_path(&base, "/absolute/path"),
            PathBuf::from("/absolute/path")
        );
    }
}
