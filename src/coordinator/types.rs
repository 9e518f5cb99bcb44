//! Public types for the sync orchestrator.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;
use crate::storage::traits::StorageError;
use crate::writer::FlushReport;

/// Which way records flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Direction {
    /// Wide-column store → document index
    AToB,
    /// Document index → wide-column store
    BToA,
}

impl Direction {
    pub const ALL: [Direction; 2] = [Direction::AToB, Direction::BToA];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AToB => "a_to_b",
            Self::BToA => "b_to_a",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A (direction, worker slot) pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PipelineId {
    pub direction: Direction,
    pub worker: u32,
}

impl fmt::Display for PipelineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.direction, self.worker)
    }
}

/// Pipeline state.
///
/// ```text
/// Idle → Scanning → Flushing → Checkpointing → Idle
///            └──────────┴────────────┴──→ Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Scanning,
    Flushing,
    Checkpointing,
    /// Last pass ended in an unrecoverable error
    Failed,
}

impl PipelineState {
    #[must_use]
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Scanning => 1,
            Self::Flushing => 2,
            Self::Checkpointing => 3,
            Self::Failed => 4,
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Scanning => write!(f, "Scanning"),
            Self::Flushing => write!(f, "Flushing"),
            Self::Checkpointing => write!(f, "Checkpointing"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassMode {
    Full,
    Incremental,
}

impl PassMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Incremental => "incremental",
        }
    }
}

impl fmt::Display for PassMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What one pass of one pipeline did.
#[derive(Debug, Clone, PartialEq)]
pub struct PassReport {
    pub pipeline: PipelineId,
    pub mode: PassMode,
    /// Upper bound of the pass, fixed when it started
    pub scan_start: i64,
    /// Documents scanned (full) or collapsed identities (incremental)
    pub candidates: usize,
    /// Raw change-log entries read (incremental only)
    pub change_entries: usize,
    pub applied: usize,
    pub stale: usize,
    pub conflicts_retried: usize,
    /// Writes that exhausted their retry budget
    pub failed: usize,
    pub malformed: usize,
    /// Source returned an older version than its change-log promised
    pub lagging: usize,
    pub cancelled: bool,
    /// Lowest checkpoint saved across the pipeline's shards, if any was saved
    pub checkpoint: Option<i64>,
    pub elapsed: Duration,
}

impl PassReport {
    #[must_use]
    pub fn new(pipeline: PipelineId, mode: PassMode, scan_start: i64) -> Self {
        Self {
            pipeline,
            mode,
            scan_start,
            candidates: 0,
            change_entries: 0,
            applied: 0,
            stale: 0,
            conflicts_retried: 0,
            failed: 0,
            malformed: 0,
            lagging: 0,
            cancelled: false,
            checkpoint: None,
            elapsed: Duration::ZERO,
        }
    }

    pub fn absorb(&mut self, flush: &FlushReport) {
        self.applied += flush.applied;
        self.stale += flush.stale;
        self.conflicts_retried += flush.conflicts_retried;
        self.failed += flush.failed.len();
    }

    /// Every candidate reached the destination or was already superseded there.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        !self.cancelled && self.failed == 0 && self.lagging == 0
    }
}

/// Result of `sync_once`: one entry per pipeline.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub passes: Vec<PassReport>,
    pub failures: Vec<(PipelineId, SyncError)>,
    pub elapsed: Duration,
}

impl RunSummary {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// Process exit code: non-zero if any pipeline ended `Failed`.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        if self.is_success() {
            0
        } else {
            1
        }
    }

    #[must_use]
    pub fn applied(&self) -> usize {
        self.passes.iter().map(|p| p.applied).sum()
    }

    #[must_use]
    pub fn failed_records(&self) -> usize {
        self.passes.iter().map(|p| p.failed + p.lagging).sum()
    }
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("{store} unavailable during {operation}: {source}")]
    StoreUnavailable {
        store: String,
        operation: &'static str,
        #[source]
        source: StorageError,
    },
    #[error("change-log gap on shard {shard}: checkpoint {checkpoint} is older than the retention horizon {horizon}")]
    ChangeLogGap { shard: u32, checkpoint: i64, horizon: i64 },
    #[error("checkpoint store error: {0}")]
    Checkpoint(#[source] StorageError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("every pipeline must be idle")]
    NotIdle,
    #[error("pipeline task aborted: {0}")]
    Aborted(String),
}
