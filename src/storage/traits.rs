use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::changelog::{ChangeCursor, ChangePage, ShardKey, TimeWindow};
use crate::record::{Document, Record};
use crate::resilience::retry::Retryable;

#[derive(Error, Debug, Clone)]
pub enum StorageError {
    /// Connection refused, node down, overloaded coordinator... worth retrying.
    #[error("store unavailable: {0}")]
    Transient(String),
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("invalid scan cursor: {0}")]
    InvalidCursor(String),
}

impl Retryable for StorageError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout(_))
    }
}

/// One slice of a partition-parallel full scan: slice `index` of `count`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScanSlice {
    pub index: u32,
    pub count: u32,
}

impl ScanSlice {
    /// The whole dataset as a single slice.
    pub const WHOLE: ScanSlice = ScanSlice { index: 0, count: 1 };

    #[must_use]
    pub fn new(index: u32, count: u32) -> Self {
        let count = count.max(1);
        Self { index: index % count, count }
    }
}

/// Opaque store-specific resume position for a full scan.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScanCursor(pub String);

impl ScanCursor {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScanPage {
    pub documents: Vec<Document>,
    /// `None` once the slice is exhausted
    pub next: Option<ScanCursor>,
}

/// A conditional write against one store. Applied only if `version` is newer
/// than whatever the store currently holds for the identity.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Upsert(Record),
    Delete { id: String, version: i64 },
}

impl WriteOp {
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Upsert(record) => &record.id,
            Self::Delete { id, .. } => id,
        }
    }

    #[must_use]
    pub fn version(&self) -> i64 {
        match self {
            Self::Upsert(record) => record.version,
            Self::Delete { version, .. } => *version,
        }
    }

    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Upsert(_) => "upsert",
            Self::Delete { .. } => "delete",
        }
    }

    /// Rough encoded size, used for byte-based batch thresholds.
    #[must_use]
    pub fn approx_size(&self) -> usize {
        match self {
            Self::Upsert(record) => record.approx_size(),
            Self::Delete { id, .. } => id.len() + 8,
        }
    }
}

/// Per-record result of a conditional write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Applied,
    /// The store already held an equal or newer version
    RejectedStale,
    /// Lost a concurrent compare-and-set race; a fresh attempt may succeed
    RejectedConflict,
    /// Record-level store error
    Failed(String),
}

impl WriteOutcome {
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::RejectedStale => "stale",
            Self::RejectedConflict => "conflict",
            Self::Failed(_) => "failed",
        }
    }
}

/// One side of the synchronization: the wide-column store or the document index.
///
/// Implementations never read-modify-write. `write_batch` returns exactly one
/// outcome per op, in order; an `Err` means the whole request failed in transit.
#[async_trait]
pub trait SyncStore: Send + Sync {
    fn name(&self) -> &str;

    /// One page of the primary dataset restricted to `slice`, resuming after `cursor`.
    async fn scan_page(
        &self,
        slice: ScanSlice,
        cursor: Option<&ScanCursor>,
        limit: usize,
    ) -> Result<ScanPage, StorageError>;

    /// Change-log entries of one partition with timestamp in `window`,
    /// ordered by (timestamp, id, version), strictly after `after`.
    async fn read_changes(
        &self,
        key: ShardKey,
        window: TimeWindow,
        after: Option<&ChangeCursor>,
        limit: usize,
    ) -> Result<ChangePage, StorageError>;

    /// Current documents for `ids`. Identities that no longer exist are simply absent.
    async fn fetch(&self, ids: &[String]) -> Result<Vec<Document>, StorageError>;

    async fn write_batch(&self, ops: &[WriteOp]) -> Result<Vec<WriteOutcome>, StorageError>;
}
