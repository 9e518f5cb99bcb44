//! One (direction, worker) pipeline: mode selection, full and incremental passes,
//! checkpoint advancement.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::batching::hybrid_batcher::BatchConfig;
use crate::changelog::{now_millis, ShardRange, TimeWindow};
use crate::checkpoint::{CheckpointKey, CheckpointStore};
use crate::metrics;
use crate::reconciler::{Action, Candidate, Reconciler};
use crate::resilience::retry::{retry_store_call, RetryConfig};
use crate::scanner::{Resolved, ScanError, StoreScanner};
use crate::storage::traits::{ScanSlice, StorageError, SyncStore};
use crate::writer::{BatchWriter, FlushReport, PendingWrite};

use super::types::{PassMode, PassReport, PipelineId, PipelineState, SyncError};

/// Everything a pipeline needs, resolved from config by the orchestrator.
pub(super) struct PipelineSettings {
    pub id: PipelineId,
    pub source: Arc<dyn SyncStore>,
    pub target: Arc<dyn SyncStore>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub reconciler: Reconciler,
    pub shards: ShardRange,
    pub slice: ScanSlice,
    pub cluster_shards: u32,
    pub batch: BatchConfig,
    pub retry: RetryConfig,
    pub max_conflict_retries: u32,
    pub changelog_ttl: Duration,
    /// How far behind the wall clock a pass window ends
    pub scan_lag: Duration,
}

pub(super) struct Pipeline {
    settings: PipelineSettings,
    scanner: StoreScanner,
    state: watch::Sender<PipelineState>,
}

impl Pipeline {
    pub fn new(settings: PipelineSettings) -> Self {
        let scanner = StoreScanner::new(
            settings.source.clone(),
            settings.reconciler.schema().clone(),
            settings.retry.clone(),
            settings.batch.docs_per_batch,
        );
        let (state, _) = watch::channel(PipelineState::Idle);
        Self {
            settings,
            scanner,
            state,
        }
    }

    pub fn id(&self) -> PipelineId {
        self.settings.id
    }

    pub fn shards(&self) -> ShardRange {
        self.settings.shards
    }

    pub fn state(&self) -> PipelineState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<PipelineState> {
        self.state.subscribe()
    }

    pub fn set_state(&self, state: PipelineState) {
        self.state.send_replace(state);
        metrics::set_pipeline_state(self.direction(), self.settings.id.worker, state.as_u8());
    }

    fn direction(&self) -> &'static str {
        self.settings.id.direction.as_str()
    }

    fn source_error(&self, err: ScanError) -> SyncError {
        metrics::record_store_error(self.settings.source.name(), err.operation);
        SyncError::StoreUnavailable {
            store: self.settings.source.name().to_string(),
            operation: err.operation,
            source: err.source,
        }
    }

    fn target_error(&self, source: StorageError) -> SyncError {
        metrics::record_store_error(self.settings.target.name(), "write_batch");
        SyncError::StoreUnavailable {
            store: self.settings.target.name().to_string(),
            operation: "write_batch",
            source,
        }
    }

    fn writer(&self) -> BatchWriter {
        BatchWriter::new(
            self.settings.target.clone(),
            self.direction(),
            self.settings.batch.clone(),
            self.settings.retry.clone(),
            self.settings.max_conflict_retries,
        )
    }

    /// Run one pass. The pipeline ends in `Idle` on success or cancellation, `Failed` otherwise.
    #[tracing::instrument(skip_all, fields(pipeline = %self.settings.id, shards = %self.settings.shards))]
    pub async fn run_pass(&self, cancel: &CancellationToken) -> Result<PassReport, SyncError> {
        let started = Instant::now();
        self.set_state(PipelineState::Scanning);

        let result = match self.select_mode().await {
            Ok((PassMode::Full, _)) => self.full_pass(cancel).await,
            Ok((PassMode::Incremental, checkpoints)) => self.incremental_pass(checkpoints, cancel).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(mut report) => {
                report.elapsed = started.elapsed();
                let outcome = if report.cancelled { "cancelled" } else { "ok" };
                metrics::record_pass(self.direction(), report.mode.as_str(), outcome, report.elapsed);
                metrics::record_malformed(self.direction(), report.malformed);
                if let Some(checkpoint) = report.checkpoint {
                    metrics::set_checkpoint(self.direction(), self.settings.id.worker, checkpoint);
                }
                info!(
                    mode = %report.mode,
                    candidates = report.candidates,
                    applied = report.applied,
                    stale = report.stale,
                    failed = report.failed + report.lagging,
                    malformed = report.malformed,
                    cancelled = report.cancelled,
                    "Pass complete: {} successful or up to date, {} failed",
                    report.applied + report.stale,
                    report.failed + report.lagging
                );
                self.set_state(PipelineState::Idle);
                Ok(report)
            }
            Err(e) => {
                metrics::record_pass(self.direction(), "unknown", "failed", started.elapsed());
                error!(error = %e, "Pass failed");
                self.set_state(PipelineState::Failed);
                Err(e)
            }
        }
    }

    /// Full pass if any shard of this direction lacks a usable checkpoint.
    ///
    /// The decision covers the whole direction, not just the owned shards: a
    /// worker's full scan only covers its own slice of identities, so every
    /// worker must rescan before any shard can skip ahead.
    async fn select_mode(&self) -> Result<(PassMode, BTreeMap<u32, i64>), SyncError> {
        let direction = self.settings.id.direction;
        let checkpoints = &self.settings.checkpoints;
        let all = retry_store_call("checkpoint_load", &self.settings.retry, || {
            checkpoints.load_range(direction, 0..self.settings.cluster_shards)
        })
        .await
        .map_err(SyncError::Checkpoint)?;

        if all.len() < self.settings.cluster_shards as usize {
            info!(
                missing = self.settings.cluster_shards as usize - all.len(),
                "Shards without checkpoint, running full sync"
            );
            return Ok((PassMode::Full, BTreeMap::new()));
        }

        let ttl_ms = i64::try_from(self.settings.changelog_ttl.as_millis()).unwrap_or(i64::MAX);
        let horizon = now_millis().saturating_sub(ttl_ms);
        if let Some((shard, checkpoint)) = all.iter().find(|(_, c)| c.timestamp < horizon) {
            let gap = SyncError::ChangeLogGap {
                shard: *shard,
                checkpoint: checkpoint.timestamp,
                horizon,
            };
            warn!(error = %gap, "Falling back to full sync");
            metrics::record_changelog_gap(self.direction());
            return Ok((PassMode::Full, BTreeMap::new()));
        }

        let owned = self
            .settings
            .shards
            .shards()
            .filter_map(|shard| all.get(&shard).map(|c| (shard, c.timestamp)))
            .collect();
        Ok((PassMode::Incremental, owned))
    }

    async fn full_pass(&self, cancel: &CancellationToken) -> Result<PassReport, SyncError> {
        let scan_start = self.pass_upper_bound();
        let mut report = PassReport::new(self.settings.id, PassMode::Full, scan_start);
        let mut writer = self.writer();
        let mut scan = self.scanner.full(self.settings.slice, None);
        info!(slice = self.settings.slice.index, of = self.settings.slice.count, "Starting full pass");

        loop {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            let page = scan.next_page().await.map_err(|e| self.source_error(e))?;
            let Some(documents) = page else {
                break;
            };
            report.candidates += documents.len();

            for document in documents {
                self.push_candidate(&mut writer, &mut report, Candidate::Present(document), None)
                    .await?;
            }

            self.set_state(PipelineState::Flushing);
            let flushed = writer.flush().await.map_err(|e| self.target_error(e))?;
            report.absorb(&flushed);
            self.set_state(PipelineState::Scanning);
        }

        if report.is_clean() {
            self.set_state(PipelineState::Checkpointing);
            for shard in self.settings.shards.shards() {
                self.save_checkpoint(shard, scan_start).await?;
            }
            report.checkpoint = Some(scan_start);
        } else if !report.cancelled {
            warn!(failed = report.failed, "Full pass had record failures, checkpoints not advanced");
        }
        Ok(report)
    }

    async fn incremental_pass(
        &self,
        previous: BTreeMap<u32, i64>,
        cancel: &CancellationToken,
    ) -> Result<PassReport, SyncError> {
        let scan_start = self.pass_upper_bound();
        let mut report = PassReport::new(self.settings.id, PassMode::Incremental, scan_start);

        let windows: Vec<(u32, TimeWindow)> = previous
            .iter()
            .map(|(shard, checkpoint)| (*shard, TimeWindow::new(*checkpoint, scan_start)))
            .collect();
        let Some(set) = self
            .scanner
            .collect_changes(&windows, cancel)
            .await
            .map_err(|e| self.source_error(e))?
        else {
            report.cancelled = true;
            return Ok(report);
        };
        report.change_entries = set.entries_read;
        report.malformed += set.malformed;
        report.candidates = set.changes.len();
        metrics::record_changes_read(self.direction(), set.entries_read, set.changes.len());
        debug!(entries = set.entries_read, identities = set.changes.len(), "Change-log collapsed");

        let mut writer = self.writer();
        // Lowest first_seen of anything that did not make it this pass
        let mut held_back: Option<i64> = None;
        let chunk_size = self.settings.batch.docs_per_batch.max(1);
        let chunks: Vec<_> = set.changes.chunks(chunk_size).collect();

        for (index, chunk) in chunks.iter().enumerate() {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            for resolved in self.scanner.resolve(chunk).await.map_err(|e| self.source_error(e))? {
                match resolved {
                    Resolved::Lagging { change, found } => {
                        debug!(id = %change.id, expected = change.version, found, "Source lags its change-log");
                        report.lagging += 1;
                        held_back = min_some(held_back, change.first_seen);
                    }
                    Resolved::Candidate { change, candidate } => {
                        if let Some(flush) = self
                            .push_candidate(&mut writer, &mut report, candidate, Some(change.first_seen))
                            .await?
                        {
                            held_back = min_failed(held_back, &flush);
                        }
                    }
                }
            }

            self.set_state(PipelineState::Flushing);
            let flushed = writer.flush().await.map_err(|e| self.target_error(e))?;
            report.absorb(&flushed);
            held_back = min_failed(held_back, &flushed);

            self.set_state(PipelineState::Checkpointing);
            let next_unflushed = chunks.get(index + 1).and_then(|c| c.first()).map(|c| c.first_seen);
            let target = safe_checkpoint(scan_start, held_back, next_unflushed);
            report.checkpoint = Some(self.advance(&previous, target).await?);
            self.set_state(PipelineState::Scanning);
        }

        if chunks.is_empty() && !report.cancelled {
            // Nothing changed in the window
            self.set_state(PipelineState::Checkpointing);
            report.checkpoint = Some(self.advance(&previous, scan_start).await?);
        }
        Ok(report)
    }

    /// Reconcile one candidate into the writer. Returns the report of any flush it triggered.
    async fn push_candidate(
        &self,
        writer: &mut BatchWriter,
        report: &mut PassReport,
        candidate: Candidate,
        first_seen: Option<i64>,
    ) -> Result<Option<FlushReport>, SyncError> {
        match self.settings.reconciler.reconcile(candidate) {
            Action::Write(op) => {
                let flushed = writer
                    .push(PendingWrite::new(op, first_seen))
                    .await
                    .map_err(|e| self.target_error(e))?;
                if let Some(ref flush) = flushed {
                    report.absorb(flush);
                }
                Ok(flushed)
            }
            Action::Skip(malformed) => {
                debug!(reason = %malformed, "Skipping malformed record");
                report.malformed += 1;
                Ok(None)
            }
        }
    }

    /// Raise every owned shard to `max(previous, target)`; returns the lowest resulting value.
    async fn advance(&self, previous: &BTreeMap<u32, i64>, target: i64) -> Result<i64, SyncError> {
        let mut lowest = i64::MAX;
        for (shard, prev) in previous {
            let value = (*prev).max(target);
            if value > *prev {
                self.save_checkpoint(*shard, value).await?;
            }
            lowest = lowest.min(value);
        }
        Ok(lowest)
    }

    async fn save_checkpoint(&self, shard: u32, timestamp: i64) -> Result<(), SyncError> {
        let key = CheckpointKey::new(self.settings.id.direction, shard);
        let checkpoints = &self.settings.checkpoints;
        retry_store_call("checkpoint_save", &self.settings.retry, || checkpoints.save(key, timestamp))
            .await
            .map_err(SyncError::Checkpoint)
    }

    /// Upper bound of a pass window. Entries stamped within the last `scan_lag`
    /// may not be visible to change-log reads yet.
    fn pass_upper_bound(&self) -> i64 {
        let lag_ms = i64::try_from(self.settings.scan_lag.as_millis()).unwrap_or(i64::MAX).max(1);
        now_millis().saturating_sub(lag_ms)
    }
}

/// Highest checkpoint that still re-reads everything not yet safely applied.
fn safe_checkpoint(scan_start: i64, held_back: Option<i64>, next_unflushed: Option<i64>) -> i64 {
    [held_back, next_unflushed]
        .into_iter()
        .flatten()
        .map(|ts| ts - 1)
        .fold(scan_start, i64::min)
}

fn min_some(current: Option<i64>, candidate: i64) -> Option<i64> {
    Some(current.map_or(candidate, |c| c.min(candidate)))
}

fn min_failed(current: Option<i64>, flush: &FlushReport) -> Option<i64> {
    flush
        .failed
        .iter()
        .filter_map(|f| f.first_seen)
        .fold(current, min_some)
}
