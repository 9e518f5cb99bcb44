// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync orchestrator.
//!
//! The [`SyncOrchestrator`] owns one pipeline per (direction, worker slot):
//!
//! ```text
//!             worker 0        worker 1   ...   worker W-1
//! a_to_b   [shards 0..k)   [shards k..2k)     [...)   scan slice w/W of A → write B
//! b_to_a   [shards 0..k)   [shards k..2k)     [...)   scan slice w/W of B → write A
//! ```
//!
//! Shards are assigned statically at construction. Pipelines share nothing
//! but the checkpoint store, whose keys they never overlap on.
//!
//! # Lifecycle
//!
//! ```text
//! Idle → Scanning → Flushing → Checkpointing → Idle
//!                                            ↘ Failed (retried next interval)
//! ```
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use sync_bridge::{InMemoryStore, MemoryCheckpointStore, SyncConfig, SyncOrchestrator};
//! use sync_bridge::record::Record;
//! use tokio_util::sync::CancellationToken;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let config = SyncConfig { workers: 1, cluster_shards: 4, ..SyncConfig::default() };
//! let a = Arc::new(InMemoryStore::new("a", config.schema(), config.cluster_shards));
//! let b = Arc::new(InMemoryStore::new("b", config.schema(), config.cluster_shards));
//! a.write_local(Record::new("user.1", 1), sync_bridge::changelog::now_millis() - 10);
//!
//! let orchestrator = SyncOrchestrator::new(
//!     config, a.clone(), b.clone(), Arc::new(MemoryCheckpointStore::new()),
//! ).unwrap();
//!
//! let summary = orchestrator.sync_once(&CancellationToken::new()).await;
//! assert_eq!(summary.exit_code(), 0);
//! assert_eq!(b.get("user.1").map(|r| r.version), Some(1));
//! # }
//! ```

mod lifecycle;
mod pipeline;
mod types;

pub use types::{Direction, PassMode, PassReport, PipelineId, PipelineState, RunSummary, SyncError};

use std::sync::Arc;

use tokio::sync::{watch, RwLock};
use tracing::info;

use crate::changelog::partition_shards;
use crate::checkpoint::CheckpointStore;
use crate::config::SyncConfig;
use crate::reconciler::Reconciler;
use crate::storage::traits::{ScanSlice, SyncStore};

use pipeline::{Pipeline, PipelineSettings};

/// Runs the Full-Sync and Incremental-Sync pipelines of both directions.
pub struct SyncOrchestrator {
    config: SyncConfig,
    checkpoints: Arc<dyn CheckpointStore>,
    pipelines: Vec<Arc<Pipeline>>,
    /// Passes hold it shared; `reset` needs it exclusively
    run_lock: Arc<RwLock<()>>,
}

impl SyncOrchestrator {
    /// Build the pipelines. Fails on invalid configuration without touching any store.
    pub fn new(
        config: SyncConfig,
        store_a: Arc<dyn SyncStore>,
        store_b: Arc<dyn SyncStore>,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Result<Self, SyncError> {
        config.validate()?;

        let reconciler = Reconciler::new(config.schema());
        let ranges = partition_shards(config.cluster_shards, config.workers);
        let mut pipelines = Vec::with_capacity(ranges.len() * 2);

        for direction in Direction::ALL {
            let (source, target) = match direction {
                Direction::AToB => (store_a.clone(), store_b.clone()),
                Direction::BToA => (store_b.clone(), store_a.clone()),
            };
            for (worker, shards) in (0u32..).zip(ranges.iter().copied()) {
                pipelines.push(Arc::new(Pipeline::new(PipelineSettings {
                    id: PipelineId { direction, worker },
                    source: source.clone(),
                    target: target.clone(),
                    checkpoints: checkpoints.clone(),
                    reconciler: reconciler.clone(),
                    shards,
                    slice: ScanSlice::new(worker, config.workers),
                    cluster_shards: config.cluster_shards,
                    batch: config.batch_config(),
                    retry: config.retry_config(),
                    max_conflict_retries: config.retry.max_conflict_retries,
                    changelog_ttl: config.changelog_ttl(),
                    scan_lag: config.scan_lag(),
                })));
            }
        }

        info!(
            workers = config.workers,
            cluster_shards = config.cluster_shards,
            pipelines = pipelines.len(),
            "Sync orchestrator created"
        );

        Ok(Self {
            config,
            checkpoints,
            pipelines,
            run_lock: Arc::new(RwLock::new(())),
        })
    }

    #[must_use]
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    #[must_use]
    pub fn pipeline_ids(&self) -> Vec<PipelineId> {
        self.pipelines.iter().map(|p| p.id()).collect()
    }

    /// Current state of every pipeline.
    #[must_use]
    pub fn pipeline_states(&self) -> Vec<(PipelineId, PipelineState)> {
        self.pipelines.iter().map(|p| (p.id(), p.state())).collect()
    }

    /// Watch one pipeline's state transitions.
    #[must_use]
    pub fn state_receiver(&self, id: PipelineId) -> Option<watch::Receiver<PipelineState>> {
        self.pipelines.iter().find(|p| p.id() == id).map(|p| p.subscribe())
    }

    /// No pass is running anywhere.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.run_lock.try_write().is_ok()
    }
}
