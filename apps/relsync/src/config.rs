//! # Configuration
//!
//! `relsync.toml` parsing. Every field has a default, so a missing file is
//! a valid configuration; a few environment variables override the file.
//!
//! ```toml
//! [store]
//! path = "relsync.redb"
//!
//! [queue]
//! backend = "dir"          # or "redb"
//! path = "queue"
//! concurrency = 5
//!
//! [source]
//! url = "http://127.0.0.1:7777"
//!
//! [engine]
//! missing_event_policy = "ignore"   # or "revoke"
//!
//! [[relations]]
//! kind = 3
//! edge_type = "FOLLOWS"
//! ```

use relsync_core::primitives::{
    DEFAULT_BATCH_SIZE, DEFAULT_CONCURRENCY, DEFAULT_RETRY_ALERT_THRESHOLD, DEFAULT_SWEEP_BATCH,
};
use relsync_core::{BulkConfig, MissingEventPolicy, RelationKind, RelationRegistry, SyncError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Overrides the event source URL.
pub const ENV_SOURCE_URL: &str = "RELSYNC_SOURCE_URL";
/// Overrides the graph database path.
pub const ENV_DATABASE: &str = "RELSYNC_DATABASE";
/// `json` selects the JSON log formatter.
pub const ENV_LOG_FORMAT: &str = "RELSYNC_LOG_FORMAT";

// =============================================================================
// TOP LEVEL
// =============================================================================

/// Top-level service configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub sweep: SweepConfig,
    #[serde(default)]
    pub bulk: BulkSection,
    #[serde(default)]
    pub engine: EngineConfig,
    /// Watched kinds. Empty means the built-in follow/mute/report set.
    #[serde(default)]
    pub relations: Vec<RelationKind>,
    #[serde(default)]
    pub server: ServerConfig,
}

impl Config {
    /// Load from `path`, or defaults if the file does not exist.
    pub fn load(path: &Path) -> Result<Self, SyncError> {
        let mut config = if path.exists() {
            Self::from_file(path)?
        } else {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            Self::default()
        };
        config.apply_env(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, SyncError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, SyncError> {
        toml::from_str(content).map_err(|e| SyncError::Config(e.to_string()))
    }

    /// Apply environment overrides through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(ENV_SOURCE_URL).filter(|v| !v.is_empty()) {
            self.source.url = Some(url);
        }
        if let Some(path) = lookup(ENV_DATABASE).filter(|v| !v.is_empty()) {
            self.store.path = PathBuf::from(path);
        }
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.queue.concurrency == 0 {
            return Err(SyncError::Config("queue.concurrency must be > 0".into()));
        }
        if self.queue.batch_size == 0 {
            return Err(SyncError::Config("queue.batch_size must be > 0".into()));
        }
        if self.sweep.batch_size == 0 {
            return Err(SyncError::Config("sweep.batch_size must be > 0".into()));
        }
        if self.bulk.max_chunk_lines == 0 {
            return Err(SyncError::Config("bulk.max_chunk_lines must be > 0".into()));
        }
        if self.source.timeout_secs == 0 {
            return Err(SyncError::Config("source.timeout_secs must be > 0".into()));
        }
        self.registry().map(|_| ())
    }

    /// The relation registry; the built-in set when none is configured.
    pub fn registry(&self) -> Result<RelationRegistry, SyncError> {
        if self.relations.is_empty() {
            return Ok(RelationRegistry::default());
        }
        RelationRegistry::new(self.relations.clone())
    }

    pub fn bulk_config(&self) -> BulkConfig {
        BulkConfig {
            workers: self.bulk.workers,
            max_chunk_lines: self.bulk.max_chunk_lines,
        }
    }
}

// =============================================================================
// SECTIONS
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Graph database file.
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

fn default_store_path() -> PathBuf {
    PathBuf::from("relsync.redb")
}

/// Which durable key-set backs the retry queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueBackend {
    /// One marker file per key.
    #[default]
    Dir,
    /// One row per key in a redb database.
    Redb,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default)]
    pub backend: QueueBackend,
    /// Directory (`dir`) or database file (`redb`).
    #[serde(default = "default_queue_path")]
    pub path: PathBuf,
    /// Keys applied concurrently by one drain pass.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Keys taken per drain pass.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Attempts after which a failing key is logged at error level.
    #[serde(default = "default_retry_alert_threshold")]
    pub retry_alert_threshold: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: QueueBackend::default(),
            path: default_queue_path(),
            concurrency: default_concurrency(),
            batch_size: default_batch_size(),
            retry_alert_threshold: default_retry_alert_threshold(),
        }
    }
}

fn default_queue_path() -> PathBuf {
    PathBuf::from("queue")
}

fn default_concurrency() -> usize {
    DEFAULT_CONCURRENCY
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_retry_alert_threshold() -> u32 {
    DEFAULT_RETRY_ALERT_THRESHOLD
}

/// Upstream event source. `url` takes precedence over `file`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Base URL of the relay query gateway.
    #[serde(default)]
    pub url: Option<String>,
    /// Local NDJSON export used as the source of truth.
    #[serde(default)]
    pub file: Option<PathBuf>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            url: None,
            file: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepConfig {
    #[serde(default = "default_sweep_interval")]
    pub interval_secs: u64,
    /// Actors per head lookup.
    #[serde(default = "default_sweep_batch")]
    pub batch_size: usize,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_sweep_interval(),
            batch_size: default_sweep_batch(),
        }
    }
}

fn default_sweep_interval() -> u64 {
    6 * 60 * 60
}

fn default_sweep_batch() -> usize {
    DEFAULT_SWEEP_BATCH
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkSection {
    /// Worker override; default is one less than the core count.
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default = "default_max_chunk_lines")]
    pub max_chunk_lines: usize,
    /// Full export read by a rebuild.
    #[serde(default)]
    pub input: Option<PathBuf>,
    /// Directory the extracted tables are written to.
    #[serde(default = "default_bulk_output")]
    pub output: PathBuf,
}

impl Default for BulkSection {
    fn default() -> Self {
        Self {
            workers: None,
            max_chunk_lines: default_max_chunk_lines(),
            input: None,
            output: default_bulk_output(),
        }
    }
}

fn default_max_chunk_lines() -> usize {
    BulkConfig::default().max_chunk_lines
}

fn default_bulk_output() -> PathBuf {
    PathBuf::from("bulk")
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub missing_event_policy: MissingEventPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use relsync_core::Kind;

    #[test]
    fn empty_file_is_all_defaults() {
        let config = Config::from_toml("").expect("parse");
        assert_eq!(config.queue.concurrency, DEFAULT_CONCURRENCY);
        assert_eq!(config.queue.backend, QueueBackend::Dir);
        assert_eq!(config.engine.missing_event_policy, MissingEventPolicy::Ignore);
        assert!(config.validate().is_ok());
        assert_eq!(config.registry().expect("registry").watched_kinds().len(), 3);
    }

    #[test]
    fn sections_parse() {
        let config = Config::from_toml(
            r#"
            [queue]
            backend = "redb"
            path = "q.redb"
            concurrency = 2

            [engine]
            missing_event_policy = "revoke"

            [[relations]]
            kind = 3
            edge_type = "FOLLOWS"

            [[relations]]
            kind = 1984
            edge_type = "REPORTS"
            subtype_index = 2
            "#,
        )
        .expect("parse");
        assert_eq!(config.queue.backend, QueueBackend::Redb);
        assert_eq!(config.queue.concurrency, 2);
        assert_eq!(config.engine.missing_event_policy, MissingEventPolicy::RevokeAll);
        let registry = config.registry().expect("registry");
        assert_eq!(registry.watched_kinds(), vec![Kind(3), Kind(1984)]);
        assert_eq!(registry.get(Kind(1984)).expect("reports").subtype_index, Some(2));
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let config = Config::from_toml("[queue]\nconcurrency = 0\n").expect("parse");
        assert!(matches!(config.validate(), Err(SyncError::Config(_))));
    }

    #[test]
    fn duplicate_relation_kind_is_rejected() {
        let config = Config::from_toml(
            "[[relations]]\nkind = 3\nedge_type = \"A\"\n[[relations]]\nkind = 3\nedge_type = \"B\"\n",
        )
        .expect("parse");
        assert!(matches!(config.validate(), Err(SyncError::Config(_))));
    }

    #[test]
    fn env_overrides_file() {
        let mut config = Config::from_toml("[source]\nurl = \"http://a\"\n").expect("parse");
        config.apply_env(|name| match name {
            ENV_SOURCE_URL => Some("http://b".to_string()),
            ENV_DATABASE => Some("/tmp/g.redb".to_string()),
            _ => None,
        });
        assert_eq!(config.source.url.as_deref(), Some("http://b"));
        assert_eq!(config.store.path, PathBuf::from("/tmp/g.redb"));
    }
}
