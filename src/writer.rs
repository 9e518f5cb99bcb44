//! Batch Writer.
//!
//! Buffers reconciled writes in a [`HybridBatcher`] and flushes them to the
//! destination as one bulk request of independent conditional writes.
//!
//! Failure handling per flush:
//!
//! - whole request fails in transit: retried with backoff via
//!   [`retry_store_call`]; once exhausted the error escalates to the pipeline
//! - `RejectedConflict`: a fresh conditional write is re-issued, bounded by
//!   `max_conflict_retries`
//! - `Failed` for a single record: re-issued with backoff, bounded by the
//!   retry attempt budget; then reported in [`FlushReport::failed`]
//! - `RejectedStale`: counted, never retried

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::batching::hybrid_batcher::{BatchConfig, FlushBatch, HybridBatcher, SizedItem};
use crate::metrics;
use crate::resilience::retry::{retry_store_call, RetryConfig};
use crate::storage::traits::{StorageError, SyncStore, WriteOp, WriteOutcome};

/// A reconciled write waiting to be flushed.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingWrite {
    pub op: WriteOp,
    /// Earliest change-log timestamp behind this write (incremental passes only)
    pub first_seen: Option<i64>,
}

impl PendingWrite {
    #[must_use]
    pub fn new(op: WriteOp, first_seen: Option<i64>) -> Self {
        Self { op, first_seen }
    }
}

impl SizedItem for PendingWrite {
    fn size_bytes(&self) -> usize {
        self.op.approx_size()
    }
}

/// A write that could not be applied within its retry budget.
#[derive(Debug, Clone, PartialEq)]
pub struct FailedWrite {
    pub op: WriteOp,
    pub first_seen: Option<i64>,
    pub reason: String,
}

/// Tally of one or more flushes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlushReport {
    pub applied: usize,
    pub stale: usize,
    pub conflicts_retried: usize,
    pub failed: Vec<FailedWrite>,
    pub batches: usize,
}

impl FlushReport {
    /// Writes that are now reflected on the destination (applied or already newer there).
    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.applied + self.stale
    }

    pub fn merge(&mut self, other: FlushReport) {
        self.applied += other.applied;
        self.stale += other.stale;
        self.conflicts_retried += other.conflicts_retried;
        self.failed.extend(other.failed);
        self.batches += other.batches;
    }
}

struct InFlight {
    write: PendingWrite,
    attempts: usize,
    conflicts: u32,
}

pub struct BatchWriter {
    store: Arc<dyn SyncStore>,
    direction: &'static str,
    batcher: HybridBatcher<PendingWrite>,
    retry: RetryConfig,
    max_conflict_retries: u32,
}

impl BatchWriter {
    pub fn new(
        store: Arc<dyn SyncStore>,
        direction: &'static str,
        batch: BatchConfig,
        retry: RetryConfig,
        max_conflict_retries: u32,
    ) -> Self {
        Self {
            store,
            direction,
            batcher: HybridBatcher::new(batch),
            retry,
            max_conflict_retries,
        }
    }

    /// Buffer a write; flushes when the count or size threshold is reached.
    pub async fn push(&mut self, write: PendingWrite) -> Result<Option<FlushReport>, StorageError> {
        self.batcher.add(write);
        match self.batcher.take_if_ready() {
            Some(batch) => self.flush_batch(batch).await.map(Some),
            None => Ok(None),
        }
    }

    /// Flush whatever is buffered.
    pub async fn flush(&mut self) -> Result<FlushReport, StorageError> {
        match self.batcher.force_flush() {
            Some(batch) => self.flush_batch(batch).await,
            None => Ok(FlushReport::default()),
        }
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.batcher.len()
    }

    async fn flush_batch(&self, batch: FlushBatch<PendingWrite>) -> Result<FlushReport, StorageError> {
        let _timer = metrics::LatencyTimer::new(self.direction, "flush");
        metrics::record_batch_size(self.direction, batch.items.len());
        metrics::record_batch_bytes(self.direction, batch.total_bytes);

        let record_attempts = self.retry.max_retries.unwrap_or(3).max(1);
        let mut report = FlushReport {
            batches: 1,
            ..FlushReport::default()
        };
        let mut in_flight: Vec<InFlight> = batch
            .items
            .into_iter()
            .map(|write| InFlight {
                write,
                attempts: 0,
                conflicts: 0,
            })
            .collect();
        let mut delay = self.retry.initial_delay;

        while !in_flight.is_empty() {
            let ops: Vec<WriteOp> = in_flight.iter().map(|f| f.write.op.clone()).collect();
            let store = &self.store;
            let outcomes = retry_store_call("write_batch", &self.retry, || store.write_batch(&ops)).await?;
            if outcomes.len() != ops.len() {
                return Err(StorageError::Backend(format!(
                    "{} returned {} outcomes for {} writes",
                    self.store.name(),
                    outcomes.len(),
                    ops.len()
                )));
            }

            let mut again = Vec::new();
            for (mut item, outcome) in in_flight.into_iter().zip(outcomes) {
                metrics::record_write_outcome(self.direction, outcome.label());
                match outcome {
                    WriteOutcome::Applied => report.applied += 1,
                    WriteOutcome::RejectedStale => report.stale += 1,
                    WriteOutcome::RejectedConflict if item.conflicts < self.max_conflict_retries => {
                        item.conflicts += 1;
                        report.conflicts_retried += 1;
                        again.push(item);
                    }
                    WriteOutcome::RejectedConflict => report.failed.push(FailedWrite {
                        op: item.write.op,
                        first_seen: item.write.first_seen,
                        reason: "conditional write kept conflicting".to_string(),
                    }),
                    WriteOutcome::Failed(reason) => {
                        item.attempts += 1;
                        if item.attempts < record_attempts {
                            debug!(id = item.write.op.id(), %reason, "Record write failed, will retry");
                            again.push(item);
                        } else {
                            warn!(id = item.write.op.id(), %reason, "Record write failed, giving up for this pass");
                            report.failed.push(FailedWrite {
                                op: item.write.op,
                                first_seen: item.write.first_seen,
                                reason,
                            });
                        }
                    }
                }
            }

            if !again.is_empty() {
                sleep(delay).await;
                delay = delay.mul_f64(self.retry.factor).min(self.retry.max_delay.max(Duration::from_millis(1)));
            }
            in_flight = again;
        }

        info!(
            direction = self.direction,
            store = self.store.name(),
            "{} successful or up to date, {} failed",
            report.succeeded(),
            report.failed.len()
        );
        Ok(report)
    }
}
