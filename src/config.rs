//! Configuration for the sync bridge.
//!
//! Loaded from YAML. Every tunable has a default; the identity/version
//! field names, the payload field kinds and the two store sections are the
//! only things a deployment must spell out.
//!
//! # Example
//!
//! ```
//! use sync_bridge::SyncConfig;
//!
//! let config = SyncConfig::from_yaml_str(r#"
//! interval: 10
//! id_field: id
//! version_field: version
//! docs_per_batch: 250
//! sync_fields:
//!   data_int: int
//!   data_str: string
//! "#).unwrap();
//!
//! assert_eq!(config.docs_per_batch, 250);
//! assert_eq!(config.sync_fields.len(), 2);
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::batching::hybrid_batcher::BatchConfig;
use crate::changelog::TIME_SHARDS;
use crate::record::{FieldKind, IdKind, RecordSchema};
use crate::resilience::retry::RetryConfig;

/// Fatal configuration problems. Raised before any store is contacted.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid config value for '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid { field, reason: reason.into() }
    }
}

/// How a reconciled record is made conditional on the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionalWrite {
    /// Wide-column writes carry a write timestamp derived from the version
    /// (last-write-wins). Assumes versions correlate with time.
    #[default]
    Timestamp,
    /// Wide-column writes use lightweight transactions on the version column.
    CompareAndSet,
}

/// Unit of the version field when it doubles as a wall-clock timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionUnit {
    #[default]
    Seconds,
    Millis,
    Micros,
}

impl VersionUnit {
    /// Convert a version to a CQL write timestamp (microseconds).
    #[must_use]
    pub fn to_write_timestamp(self, version: i64) -> i64 {
        match self {
            Self::Seconds => version.saturating_mul(1_000_000),
            Self::Millis => version.saturating_mul(1_000),
            Self::Micros => version,
        }
    }
}

/// Store-call retry budget.
#[derive(Debug, Clone, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Upper bound for any single store call
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    /// Fresh conditional writes issued after a conflict before giving up on a record
    #[serde(default = "default_max_conflict_retries")]
    pub max_conflict_retries: u32,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            call_timeout_ms: default_call_timeout_ms(),
            max_conflict_retries: default_max_conflict_retries(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckpointSettings {
    /// `memory`, `sqlite:<path>` or `mysql://...`
    #[serde(default = "default_checkpoint_url")]
    pub url: String,
}

impl Default for CheckpointSettings {
    fn default() -> Self {
        Self { url: default_checkpoint_url() }
    }
}

/// Wide-column store (store A) addressing.
#[derive(Debug, Clone, Deserialize)]
pub struct CassandraSettings {
    pub hosts: Vec<String>,
    pub keyspace: String,
    pub table: String,
    pub changes_table: String,
    /// Boolean column marking deleted rows under `compare_and_set`, so the
    /// deleting version survives and older upserts cannot resurrect the row
    #[serde(default = "default_tombstone_column")]
    pub tombstone_column: String,
}

/// Document store (store B) addressing.
#[derive(Debug, Clone, Deserialize)]
pub struct ElasticsearchSettings {
    pub hosts: Vec<String>,
    pub index: String,
    /// Mapping type, only sent to clusters that still use them
    #[serde(default, rename = "type")]
    pub doc_type: Option<String>,
    pub changes_index: String,
    /// `index.refresh_interval` of the changes index; entries are invisible to search until then
    #[serde(default = "default_refresh_interval_ms")]
    pub refresh_interval_ms: u64,
}

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Seconds between forever-mode passes (negative = no pause)
    #[serde(default = "default_interval")]
    pub interval: f64,

    pub id_field: String,
    #[serde(default)]
    pub id_kind: IdKind,
    pub version_field: String,
    #[serde(default)]
    pub version_unit: VersionUnit,
    #[serde(default)]
    pub conditional_write: ConditionalWrite,

    /// Batch Writer flush threshold (records)
    #[serde(default = "default_docs_per_batch")]
    pub docs_per_batch: usize,
    /// Batch Writer flush threshold (approximate bytes)
    #[serde(default = "default_max_batch_bytes")]
    pub max_batch_bytes: usize,

    /// Payload fields copied between stores, with their scalar kind
    #[serde(default)]
    pub sync_fields: BTreeMap<String, FieldKind>,

    /// Pipelines per direction
    #[serde(default = "default_workers")]
    pub workers: u32,
    /// Size of the change-log `cluster_shard` space
    #[serde(default = "default_cluster_shards")]
    pub cluster_shards: u32,
    /// Change-log entry time-to-live
    #[serde(default = "default_changelog_ttl_secs")]
    pub changelog_ttl_secs: u64,
    /// How far behind "now" a pass window ends. Entries stamped inside the
    /// lag are left for the next pass, so it must cover the time a change-log
    /// write takes to become readable plus writer clock skew.
    #[serde(default = "default_scan_lag_ms")]
    pub scan_lag_ms: u64,
    /// Worst expected clock difference between application writers and this process
    #[serde(default = "default_max_clock_skew_ms")]
    pub max_clock_skew_ms: u64,

    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub checkpoint: CheckpointSettings,

    #[serde(default)]
    pub cassandra: Option<CassandraSettings>,
    #[serde(default)]
    pub elasticsearch: Option<ElasticsearchSettings>,
}

fn default_interval() -> f64 { 30.0 }
fn default_docs_per_batch() -> usize { 500 }
fn default_max_batch_bytes() -> usize { 5 * 1024 * 1024 } // 5 MB
fn default_workers() -> u32 { 4 }
fn default_cluster_shards() -> u32 { 64 }
fn default_changelog_ttl_secs() -> u64 { 3 * 24 * 3600 } // 3 days
fn default_scan_lag_ms() -> u64 { 5_000 }
fn default_max_clock_skew_ms() -> u64 { 1_000 }
fn default_refresh_interval_ms() -> u64 { 1_000 }
fn default_max_attempts() -> usize { 5 }
fn default_initial_delay_ms() -> u64 { 200 }
fn default_max_delay_ms() -> u64 { 10_000 }
fn default_call_timeout_ms() -> u64 { 30_000 }
fn default_max_conflict_retries() -> u32 { 3 }
fn default_tombstone_column() -> String { "deleted".to_string() }
fn default_checkpoint_url() -> String { "sqlite:checkpoints.db".to_string() }

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval: default_interval(),
            id_field: "id".to_string(),
            id_kind: IdKind::default(),
            version_field: "version".to_string(),
            version_unit: VersionUnit::default(),
            conditional_write: ConditionalWrite::default(),
            docs_per_batch: default_docs_per_batch(),
            max_batch_bytes: default_max_batch_bytes(),
            sync_fields: BTreeMap::new(),
            workers: default_workers(),
            cluster_shards: default_cluster_shards(),
            changelog_ttl_secs: default_changelog_ttl_secs(),
            scan_lag_ms: default_scan_lag_ms(),
            max_clock_skew_ms: default_max_clock_skew_ms(),
            retry: RetrySettings::default(),
            checkpoint: CheckpointSettings::default(),
            cassandra: None,
            elasticsearch: None,
        }
    }
}

impl SyncConfig {
    /// Parse and validate a YAML document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.id_field.trim().is_empty() {
            return Err(ConfigError::invalid("id_field", "must not be empty"));
        }
        if self.version_field.trim().is_empty() {
            return Err(ConfigError::invalid("version_field", "must not be empty"));
        }
        if self.id_field == self.version_field {
            return Err(ConfigError::invalid("version_field", "must differ from id_field"));
        }
        for name in self.sync_fields.keys() {
            if name == &self.id_field || name == &self.version_field {
                return Err(ConfigError::invalid(
                    "sync_fields",
                    format!("'{}' is already the identity or version field", name),
                ));
            }
        }
        if self.docs_per_batch == 0 {
            return Err(ConfigError::invalid("docs_per_batch", "must be at least 1"));
        }
        if !self.interval.is_finite() {
            return Err(ConfigError::invalid("interval", "must be a finite number of seconds"));
        }
        if self.workers == 0 {
            return Err(ConfigError::invalid("workers", "must be at least 1"));
        }
        if self.cluster_shards < self.workers {
            return Err(ConfigError::invalid(
                "cluster_shards",
                format!("{} shards cannot be spread over {} workers", self.cluster_shards, self.workers),
            ));
        }
        // Buckets are days of the week; a longer TTL would let two weeks share a partition.
        let bucket_span_secs = u64::from(TIME_SHARDS) * 24 * 3600;
        if self.changelog_ttl_secs == 0 || self.changelog_ttl_secs >= bucket_span_secs {
            return Err(ConfigError::invalid(
                "changelog_ttl_secs",
                format!("must be between 1 and {} seconds", bucket_span_secs - 1),
            ));
        }
        self.validate_scan_lag()?;
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::invalid("retry.max_attempts", "must be at least 1"));
        }
        if self.retry.call_timeout_ms == 0 {
            return Err(ConfigError::invalid("retry.call_timeout_ms", "must be positive"));
        }
        if self.checkpoint.url.trim().is_empty() {
            return Err(ConfigError::invalid("checkpoint.url", "must not be empty"));
        }
        if let Some(ref cassandra) = self.cassandra {
            if cassandra.hosts.is_empty() {
                return Err(ConfigError::invalid("cassandra.hosts", "at least one host is required"));
            }
            if self.conditional_write == ConditionalWrite::CompareAndSet {
                let column = cassandra.tombstone_column.as_str();
                if column.trim().is_empty() || self.schema().columns().contains(&column) {
                    return Err(ConfigError::invalid(
                        "cassandra.tombstone_column",
                        format!("'{}' must be a separate, non-empty column", column),
                    ));
                }
            }
        }
        if let Some(ref es) = self.elasticsearch {
            if es.hosts.is_empty() {
                return Err(ConfigError::invalid("elasticsearch.hosts", "at least one host is required"));
            }
        }
        Ok(())
    }

    /// Smallest lag that still sees every entry before its window closes.
    #[must_use]
    pub fn min_scan_lag_ms(&self) -> u64 {
        let visibility = self.elasticsearch.as_ref().map_or(0, |es| es.refresh_interval_ms);
        self.max_clock_skew_ms.saturating_add(visibility).max(1)
    }

    fn validate_scan_lag(&self) -> Result<(), ConfigError> {
        let minimum = self.min_scan_lag_ms();
        if self.scan_lag_ms < minimum {
            return Err(ConfigError::invalid(
                "scan_lag_ms",
                format!(
                    "{} ms is below max_clock_skew_ms plus the changes index refresh interval ({} ms)",
                    self.scan_lag_ms, minimum
                ),
            ));
        }
        if self.scan_lag_ms / 1_000 >= self.changelog_ttl_secs {
            return Err(ConfigError::invalid("scan_lag_ms", "must be shorter than changelog_ttl_secs"));
        }
        Ok(())
    }

    /// Record layout shared by the scanners, the reconciler and the adapters.
    #[must_use]
    pub fn schema(&self) -> RecordSchema {
        RecordSchema {
            id_field: self.id_field.clone(),
            id_kind: self.id_kind,
            version_field: self.version_field.clone(),
            sync_fields: self.sync_fields.clone(),
        }
    }

    #[must_use]
    pub fn batch_config(&self) -> BatchConfig {
        BatchConfig {
            docs_per_batch: self.docs_per_batch,
            max_batch_bytes: self.max_batch_bytes,
        }
    }

    #[must_use]
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: Some(self.retry.max_attempts),
            initial_delay: Duration::from_millis(self.retry.initial_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            factor: 2.0,
            call_timeout: Duration::from_millis(self.retry.call_timeout_ms),
        }
    }

    #[must_use]
    pub fn scan_lag(&self) -> Duration {
        Duration::from_millis(self.scan_lag_ms)
    }

    #[must_use]
    pub fn changelog_ttl(&self) -> Duration {
        Duration::from_secs(self.changelog_ttl_secs)
    }

    /// Pause between forever-mode passes; `None` when the interval is negative.
    #[must_use]
    pub fn pass_interval(&self) -> Option<Duration> {
        if self.interval < 0.0 {
            None
        } else {
            Some(Duration::from_secs_f64(self.interval))
        }
    }
}
