//! Shared fixtures for the end-to-end sync tests.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::future::Future;
use std::ops::Range;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use sync_bridge::changelog::{now_millis, ChangeCursor, ChangePage, ShardKey, TimeWindow};
use sync_bridge::checkpoint::Checkpoint;
use sync_bridge::config::RetrySettings;
use sync_bridge::record::{Document, FieldKind, FieldValue, Record};
use sync_bridge::storage::traits::{ScanCursor, ScanPage, ScanSlice};
use sync_bridge::{
    CheckpointKey, CheckpointStore, Direction, InMemoryStore, MemoryCheckpointStore, StorageError, SyncConfig,
    SyncOrchestrator, SyncStore, WriteOp, WriteOutcome,
};

/// Small batches and fast retries so multi-batch paths run in milliseconds.
pub fn test_config(workers: u32, cluster_shards: u32) -> SyncConfig {
    SyncConfig {
        workers,
        cluster_shards,
        docs_per_batch: 3,
        sync_fields: BTreeMap::from([("name".to_string(), FieldKind::String)]),
        retry: RetrySettings {
            max_attempts: 3,
            initial_delay_ms: 1,
            max_delay_ms: 5,
            call_timeout_ms: 2_000,
            max_conflict_retries: 3,
        },
        // In-memory change-logs are visible as soon as they are written
        scan_lag_ms: 1,
        max_clock_skew_ms: 0,
        ..SyncConfig::default()
    }
}

pub fn record(id: &str, version: i64, name: &str) -> Record {
    Record::new(id, version).with_field("name", FieldValue::Str(name.to_string()))
}

pub fn memory_store(name: &str, config: &SyncConfig) -> Arc<InMemoryStore> {
    Arc::new(InMemoryStore::new(name, config.schema(), config.cluster_shards))
}

/// Let the wall clock move past the last application write, so the next
/// pass window (which ends `scan_lag_ms` before "now") includes it.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(3)).await;
}

/// Poll `condition` until it holds, panicking after `timeout`.
pub async fn eventually<F>(timeout: Duration, what: &str, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Await `future`, panicking if it takes longer than `timeout`.
pub async fn within<T>(timeout: Duration, what: &str, future: impl Future<Output = T>) -> T {
    match tokio::time::timeout(timeout, future).await {
        Ok(value) => value,
        Err(_) => panic!("{} did not finish within {:?}", what, timeout),
    }
}

/// Application write stamped with the current time.
pub fn write_now(store: &InMemoryStore, record: Record) -> bool {
    store.write_local(record, now_millis())
}

pub struct Harness {
    pub a: Arc<InMemoryStore>,
    pub b: Arc<InMemoryStore>,
    pub checkpoints: Arc<MemoryCheckpointStore>,
    pub orchestrator: Arc<SyncOrchestrator>,
}

impl Harness {
    pub fn new(config: SyncConfig) -> Self {
        let a = memory_store("a", &config);
        let b = memory_store("b", &config);
        Self::with_stores(config, a.clone(), b.clone(), a, b)
    }

    /// Wire the orchestrator to `source_a`/`source_b` (possibly wrappers)
    /// while keeping direct handles on the underlying memory stores.
    pub fn with_stores(
        config: SyncConfig,
        a: Arc<InMemoryStore>,
        b: Arc<InMemoryStore>,
        store_a: Arc<dyn SyncStore>,
        store_b: Arc<dyn SyncStore>,
    ) -> Self {
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        Self::with_checkpoints(config, a, b, store_a, store_b, checkpoints.clone(), checkpoints)
    }

    /// Like [`Harness::with_stores`], with the orchestrator saving through
    /// `wrapped` (typically a wrapper around `checkpoints`).
    pub fn with_checkpoints(
        config: SyncConfig,
        a: Arc<InMemoryStore>,
        b: Arc<InMemoryStore>,
        store_a: Arc<dyn SyncStore>,
        store_b: Arc<dyn SyncStore>,
        checkpoints: Arc<MemoryCheckpointStore>,
        wrapped: Arc<dyn CheckpointStore>,
    ) -> Self {
        let orchestrator =
            Arc::new(SyncOrchestrator::new(config, store_a, store_b, wrapped).expect("valid test config"));
        Self {
            a,
            b,
            checkpoints,
            orchestrator,
        }
    }

    pub fn assert_converged(&self) {
        assert_eq!(self.a.snapshot(), self.b.snapshot(), "stores diverged");
    }

    /// Saved checkpoint of one shard, if any.
    pub fn checkpoint(&self, direction: Direction, shard: u32) -> Option<i64> {
        self.checkpoints
            .snapshot()
            .get(&CheckpointKey::new(direction, shard))
            .map(|c| c.timestamp)
    }
}

// =============================================================================
// Store wrappers
// =============================================================================

/// Remembers every op written through it.
pub struct RecordingStore {
    pub inner: Arc<InMemoryStore>,
    pub written: Mutex<Vec<WriteOp>>,
}

impl RecordingStore {
    pub fn new(inner: Arc<InMemoryStore>) -> Self {
        Self {
            inner,
            written: Mutex::new(Vec::new()),
        }
    }

    pub fn writes_for(&self, id: &str) -> Vec<i64> {
        self.written
            .lock()
            .iter()
            .filter(|op| op.id() == id)
            .map(WriteOp::version)
            .collect()
    }
}

#[async_trait]
impl SyncStore for RecordingStore {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn scan_page(
        &self,
        slice: ScanSlice,
        cursor: Option<&ScanCursor>,
        limit: usize,
    ) -> Result<ScanPage, StorageError> {
        self.inner.scan_page(slice, cursor, limit).await
    }

    async fn read_changes(
        &self,
        key: ShardKey,
        window: TimeWindow,
        after: Option<&ChangeCursor>,
        limit: usize,
    ) -> Result<ChangePage, StorageError> {
        self.inner.read_changes(key, window, after, limit).await
    }

    async fn fetch(&self, ids: &[String]) -> Result<Vec<Document>, StorageError> {
        self.inner.fetch(ids).await
    }

    async fn write_batch(&self, ops: &[WriteOp]) -> Result<Vec<WriteOutcome>, StorageError> {
        self.written.lock().extend(ops.iter().cloned());
        self.inner.write_batch(ops).await
    }
}

/// Injects failures into an in-memory store.
pub struct FailingStore {
    pub inner: Arc<InMemoryStore>,
    /// Successful `write_batch` calls left before every call fails in transit
    pub writes_before_outage: AtomicUsize,
    /// The next N `write_batch` calls fail in transit, later ones succeed
    pub refuse_next: AtomicUsize,
    /// `read_changes` on this cluster shard fails in transit
    pub broken_shard: Mutex<Option<u32>>,
    /// Next N record writes lose a compare-and-set race
    pub conflicts: AtomicUsize,
    /// Records with this id always fail at record level
    pub poison: Mutex<Option<String>>,
    pub write_calls: AtomicUsize,
}

impl FailingStore {
    pub fn new(inner: Arc<InMemoryStore>) -> Self {
        Self {
            inner,
            writes_before_outage: AtomicUsize::new(usize::MAX),
            refuse_next: AtomicUsize::new(0),
            broken_shard: Mutex::new(None),
            conflicts: AtomicUsize::new(0),
            poison: Mutex::new(None),
            write_calls: AtomicUsize::new(0),
        }
    }

    /// Fail every write after `n` successful ones.
    pub fn fail_writes_after(&self, n: usize) {
        self.writes_before_outage.store(n, Ordering::SeqCst);
    }

    pub fn heal(&self) {
        self.writes_before_outage.store(usize::MAX, Ordering::SeqCst);
        self.refuse_next.store(0, Ordering::SeqCst);
        *self.broken_shard.lock() = None;
        *self.poison.lock() = None;
        self.conflicts.store(0, Ordering::SeqCst);
    }
}

#[async_trait]
impl SyncStore for FailingStore {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn scan_page(
        &self,
        slice: ScanSlice,
        cursor: Option<&ScanCursor>,
        limit: usize,
    ) -> Result<ScanPage, StorageError> {
        self.inner.scan_page(slice, cursor, limit).await
    }

    async fn read_changes(
        &self,
        key: ShardKey,
        window: TimeWindow,
        after: Option<&ChangeCursor>,
        limit: usize,
    ) -> Result<ChangePage, StorageError> {
        if *self.broken_shard.lock() == Some(key.cluster_shard) {
            return Err(StorageError::Transient(format!("shard {} unreachable", key.cluster_shard)));
        }
        self.inner.read_changes(key, window, after, limit).await
    }

    async fn fetch(&self, ids: &[String]) -> Result<Vec<Document>, StorageError> {
        self.inner.fetch(ids).await
    }

    async fn write_batch(&self, ops: &[WriteOp]) -> Result<Vec<WriteOutcome>, StorageError> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        let allowed = self
            .writes_before_outage
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let refused = self
            .refuse_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if !allowed || refused {
            return Err(StorageError::Transient("connection refused".into()));
        }

        let poison = self.poison.lock().clone();
        let mut outcomes = Vec::with_capacity(ops.len());
        for op in ops {
            if poison.as_deref() == Some(op.id()) {
                outcomes.push(WriteOutcome::Failed("mapper_parsing_exception".into()));
                continue;
            }
            let lost_race = self
                .conflicts
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if lost_race {
                outcomes.push(WriteOutcome::RejectedConflict);
                continue;
            }
            let mut applied = self.inner.write_batch(std::slice::from_ref(op)).await?;
            outcomes.push(applied.pop().unwrap_or(WriteOutcome::Failed("no outcome".into())));
        }
        Ok(outcomes)
    }
}

/// Parks the first full-scan call until released.
pub struct GatedStore {
    pub inner: Arc<InMemoryStore>,
    pub armed: AtomicBool,
    pub entered: Notify,
    pub release: Notify,
}

impl GatedStore {
    pub fn new(inner: Arc<InMemoryStore>) -> Self {
        Self {
            inner,
            armed: AtomicBool::new(true),
            entered: Notify::new(),
            release: Notify::new(),
        }
    }
}

#[async_trait]
impl SyncStore for GatedStore {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn scan_page(
        &self,
        slice: ScanSlice,
        cursor: Option<&ScanCursor>,
        limit: usize,
    ) -> Result<ScanPage, StorageError> {
        if self.armed.swap(false, Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }
        self.inner.scan_page(slice, cursor, limit).await
    }

    async fn read_changes(
        &self,
        key: ShardKey,
        window: TimeWindow,
        after: Option<&ChangeCursor>,
        limit: usize,
    ) -> Result<ChangePage, StorageError> {
        self.inner.read_changes(key, window, after, limit).await
    }

    async fn fetch(&self, ids: &[String]) -> Result<Vec<Document>, StorageError> {
        self.inner.fetch(ids).await
    }

    async fn write_batch(&self, ops: &[WriteOp]) -> Result<Vec<WriteOutcome>, StorageError> {
        self.inner.write_batch(ops).await
    }
}

/// Cancels `token` once `write_batch` has been called `after` times.
pub struct InterruptingStore {
    pub inner: Arc<InMemoryStore>,
    pub token: CancellationToken,
    pub after: AtomicUsize,
    pub written: Mutex<Vec<WriteOp>>,
}

impl InterruptingStore {
    pub fn new(inner: Arc<InMemoryStore>, token: CancellationToken, after: usize) -> Self {
        Self {
            inner,
            token,
            after: AtomicUsize::new(after),
            written: Mutex::new(Vec::new()),
        }
    }

    pub fn written_ids(&self) -> Vec<String> {
        self.written.lock().iter().map(|op| op.id().to_string()).collect()
    }
}

#[async_trait]
impl SyncStore for InterruptingStore {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn scan_page(
        &self,
        slice: ScanSlice,
        cursor: Option<&ScanCursor>,
        limit: usize,
    ) -> Result<ScanPage, StorageError> {
        self.inner.scan_page(slice, cursor, limit).await
    }

    async fn read_changes(
        &self,
        key: ShardKey,
        window: TimeWindow,
        after: Option<&ChangeCursor>,
        limit: usize,
    ) -> Result<ChangePage, StorageError> {
        self.inner.read_changes(key, window, after, limit).await
    }

    async fn fetch(&self, ids: &[String]) -> Result<Vec<Document>, StorageError> {
        self.inner.fetch(ids).await
    }

    async fn write_batch(&self, ops: &[WriteOp]) -> Result<Vec<WriteOutcome>, StorageError> {
        self.written.lock().extend(ops.iter().cloned());
        let outcomes = self.inner.write_batch(ops).await;
        let last = self
            .after
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .ok();
        if last == Some(1) {
            self.token.cancel();
        }
        outcomes
    }
}

// =============================================================================
// Checkpoint store wrappers
// =============================================================================

/// Checkpoint store that fails transiently, hangs, or parks `clear` until released.
pub struct FaultyCheckpoints {
    pub inner: Arc<MemoryCheckpointStore>,
    /// The next N loads and saves fail in transit
    pub fail_next: AtomicUsize,
    /// Every load and save blocks forever
    pub hang: AtomicBool,
    pub gate_clear: AtomicBool,
    pub clear_entered: Notify,
    pub clear_release: Notify,
    pub calls: AtomicUsize,
}

impl FaultyCheckpoints {
    pub fn new(inner: Arc<MemoryCheckpointStore>) -> Self {
        Self {
            inner,
            fail_next: AtomicUsize::new(0),
            hang: AtomicBool::new(false),
            gate_clear: AtomicBool::new(false),
            clear_entered: Notify::new(),
            clear_release: Notify::new(),
            calls: AtomicUsize::new(0),
        }
    }

    async fn fault(&self) -> Result<(), StorageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let failing = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StorageError::Transient("checkpoint database unreachable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for FaultyCheckpoints {
    async fn load(&self, key: CheckpointKey) -> Result<Option<Checkpoint>, StorageError> {
        self.fault().await?;
        self.inner.load(key).await
    }

    async fn load_range(
        &self,
        direction: Direction,
        shards: Range<u32>,
    ) -> Result<BTreeMap<u32, Checkpoint>, StorageError> {
        self.fault().await?;
        self.inner.load_range(direction, shards).await
    }

    async fn save(&self, key: CheckpointKey, timestamp: i64) -> Result<(), StorageError> {
        self.fault().await?;
        self.inner.save(key, timestamp).await
    }

    async fn clear(&self) -> Result<(), StorageError> {
        if self.gate_clear.swap(false, Ordering::SeqCst) {
            self.clear_entered.notify_one();
            self.clear_release.notified().await;
        }
        self.inner.clear().await
    }
}
