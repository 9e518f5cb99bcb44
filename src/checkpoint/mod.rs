//! Per-(direction, shard) checkpoints.
//!
//! A checkpoint says "every change-log entry of this shard up to `timestamp`
//! has been incorporated into the opposite store". Only the orchestrator
//! writes them, and only after an acknowledged flush. Saves never move a
//! checkpoint backwards.

pub mod sql;

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::changelog::now_millis;
use crate::coordinator::Direction;
use crate::storage::traits::StorageError;

pub use sql::SqlCheckpointStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CheckpointKey {
    pub direction: Direction,
    pub shard: u32,
}

impl CheckpointKey {
    #[must_use]
    pub fn new(direction: Direction, shard: u32) -> Self {
        Self { direction, shard }
    }
}

impl fmt::Display for CheckpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.direction, self.shard)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    /// Logical time (epoch millis) the shard is synchronized up to
    pub timestamp: i64,
    /// Wall-clock time of the save
    pub updated_at: i64,
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self, key: CheckpointKey) -> Result<Option<Checkpoint>, StorageError>;

    /// Checkpoints for a contiguous run of shards; missing shards are absent.
    async fn load_range(
        &self,
        direction: Direction,
        shards: Range<u32>,
    ) -> Result<BTreeMap<u32, Checkpoint>, StorageError> {
        let mut found = BTreeMap::new();
        for shard in shards {
            if let Some(checkpoint) = self.load(CheckpointKey::new(direction, shard)).await? {
                found.insert(shard, checkpoint);
            }
        }
        Ok(found)
    }

    /// Raise the checkpoint to `timestamp`. A lower value leaves it untouched.
    async fn save(&self, key: CheckpointKey, timestamp: i64) -> Result<(), StorageError>;

    /// Delete every checkpoint.
    async fn clear(&self) -> Result<(), StorageError>;
}

/// Volatile checkpoints, for tests and `checkpoint.url: memory`.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    entries: DashMap<CheckpointKey, Checkpoint>,
}

impl MemoryCheckpointStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All checkpoints, ordered by key.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<CheckpointKey, Checkpoint> {
        self.entries.iter().map(|e| (*e.key(), *e.value())).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, key: CheckpointKey) -> Result<Option<Checkpoint>, StorageError> {
        Ok(self.entries.get(&key).map(|e| *e.value()))
    }

    async fn save(&self, key: CheckpointKey, timestamp: i64) -> Result<(), StorageError> {
        let updated_at = now_millis();
        self.entries
            .entry(key)
            .and_modify(|current| {
                current.timestamp = current.timestamp.max(timestamp);
                current.updated_at = updated_at;
            })
            .or_insert(Checkpoint { timestamp, updated_at });
        Ok(())
    }

    async fn clear(&self) -> Result<(), StorageError> {
        self.entries.clear();
        Ok(())
    }
}

/// Open the checkpoint store named by `url` (`memory`, `sqlite:...`, `mysql://...`).
pub async fn open(url: &str) -> Result<Arc<dyn CheckpointStore>, StorageError> {
    if url == "memory" {
        return Ok(Arc::new(MemoryCheckpointStore::new()));
    }
    Ok(Arc::new(SqlCheckpointStore::new(url).await?))
}
