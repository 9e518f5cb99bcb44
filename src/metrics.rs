// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for sync-bridge.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The embedding process is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `sync_bridge_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//! - `_bytes` suffix for size histograms
//!
//! # Labels
//! - `direction`: a_to_b, b_to_a
//! - `mode`: full, incremental
//! - `outcome`: applied, stale, conflict, failed (writes); ok, failed, cancelled (passes)

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record the outcome of one conditional write
pub fn record_write_outcome(direction: &'static str, outcome: &'static str) {
    counter!(
        "sync_bridge_writes_total",
        "direction" => direction,
        "outcome" => outcome
    )
    .increment(1);
}

/// Record batch size
pub fn record_batch_size(direction: &'static str, count: usize) {
    histogram!(
        "sync_bridge_batch_size",
        "direction" => direction
    )
    .record(count as f64);
}

/// Record batch bytes
pub fn record_batch_bytes(direction: &'static str, bytes: usize) {
    histogram!(
        "sync_bridge_batch_bytes",
        "direction" => direction
    )
    .record(bytes as f64);
}

/// Record operation latency
pub fn record_latency(direction: &'static str, operation: &'static str, duration: Duration) {
    histogram!(
        "sync_bridge_operation_seconds",
        "direction" => direction,
        "operation" => operation
    )
    .record(duration.as_secs_f64());
}

/// Record a finished pass
pub fn record_pass(direction: &'static str, mode: &'static str, outcome: &'static str, duration: Duration) {
    counter!(
        "sync_bridge_passes_total",
        "direction" => direction,
        "mode" => mode,
        "outcome" => outcome
    )
    .increment(1);
    histogram!(
        "sync_bridge_pass_seconds",
        "direction" => direction,
        "mode" => mode
    )
    .record(duration.as_secs_f64());
}

/// Record records skipped as malformed
pub fn record_malformed(direction: &'static str, count: usize) {
    if count == 0 {
        return;
    }
    counter!(
        "sync_bridge_malformed_records_total",
        "direction" => direction
    )
    .increment(count as u64);
}

/// Record change-log entries read and what they collapsed to
pub fn record_changes_read(direction: &'static str, entries: usize, collapsed: usize) {
    counter!("sync_bridge_changelog_entries_total", "direction" => direction).increment(entries as u64);
    counter!("sync_bridge_changelog_collapsed_total", "direction" => direction).increment(collapsed as u64);
}

/// Record a change-log gap that forced a full pass
pub fn record_changelog_gap(direction: &'static str) {
    counter!(
        "sync_bridge_changelog_gaps_total",
        "direction" => direction
    )
    .increment(1);
}

/// Record a store call that failed after retries
pub fn record_store_error(store: &str, operation: &'static str) {
    counter!(
        "sync_bridge_store_errors_total",
        "store" => store.to_string(),
        "operation" => operation
    )
    .increment(1);
}

/// Set pipeline state (0 = Idle, 1 = Scanning, 2 = Flushing, 3 = Checkpointing, 4 = Failed)
pub fn set_pipeline_state(direction: &'static str, worker: u32, state: u8) {
    gauge!(
        "sync_bridge_pipeline_state",
        "direction" => direction,
        "worker" => worker.to_string()
    )
    .set(f64::from(state));
}

/// Set the lowest checkpoint a pipeline holds (epoch millis)
pub fn set_checkpoint(direction: &'static str, worker: u32, timestamp_ms: i64) {
    gauge!(
        "sync_bridge_checkpoint_timestamp_ms",
        "direction" => direction,
        "worker" => worker.to_string()
    )
    .set(timestamp_ms as f64);
}

/// A timing guard that records latency on drop
pub struct LatencyTimer {
    direction: &'static str,
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(direction: &'static str, operation: &'static str) -> Self {
        Self {
            direction,
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.direction, self.operation, self.start.elapsed());
    }
}

/// Convenience macro for timing operations
#[macro_export]
macro_rules! time_operation {
    ($direction:expr, $op:expr) => {
        $crate::metrics::LatencyTimer::new($direction, $op)
    };
}
