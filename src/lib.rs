//! # Sync Bridge
//!
//! Keeps a wide-column store (A) and a document index (B) eventually
//! consistent, in both directions, without coordinating application writers.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────┐                 ┌────────────────────────────┐
//! │  Store A (wide-column)     │                 │  Store B (document index)  │
//! │  • records table           │                 │  • records index           │
//! │  • sharded change-log      │                 │  • sharded change-log      │
//! └─────────────┬──────────────┘                 └──────────────┬─────────────┘
//!               │  scan / read_changes                 scan / read_changes  │
//!               ▼                                                           ▼
//! ┌────────────────────────────┐                 ┌────────────────────────────┐
//! │  a_to_b pipelines (× W)    │                 │  b_to_a pipelines (× W)    │
//! │  Scanner → Reconciler      │                 │  Scanner → Reconciler      │
//! │    → BatchWriter ──────────┼──► write B      │    → BatchWriter ──────────┼──► write A
//! └─────────────┬──────────────┘                 └──────────────┬─────────────┘
//!               │             ┌──────────────────────┐          │
//!               └────────────►│  Checkpoint store    │◄─────────┘
//!                             │  (direction, shard)  │
//!                             └──────────────────────┘
//! ```
//!
//! Every write is conditional on the destination holding a strictly older
//! version, so any interleaving of application writes and sync passes
//! converges on the highest version per identity.
//!
//! A pipeline runs a **full** pass (scan everything) when its direction has
//! no usable checkpoints, and **incremental** passes (read the change-log
//! window since the last checkpoint) otherwise.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sync_bridge::{checkpoint, storage, SyncConfig, SyncOrchestrator};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = SyncConfig::load("sync.yaml")?;
//! storage::check_adapters(&config)?;
//!
//! let a = storage::connect_a(&config).await?;
//! let b = storage::connect_b(&config).await?;
//! let checkpoints = checkpoint::open(&config.checkpoint.url).await?;
//!
//! let orchestrator = SyncOrchestrator::new(config, a, b, checkpoints)?;
//! let summary = orchestrator.sync_once(&CancellationToken::new()).await;
//! std::process::exit(summary.exit_code());
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`coordinator`]: the [`SyncOrchestrator`] and its per-(direction, worker) pipelines
//! - [`changelog`]: change-log partitioning, windows and collapse
//! - [`scanner`]: full-scan and change-log readers over a [`SyncStore`]
//! - [`reconciler`]: turns candidates into conditional write operations
//! - [`writer`]: batched, retried writes into the destination
//! - [`checkpoint`]: per-(direction, shard) progress, in memory or SQL
//! - [`storage`]: store adapters (in-memory, Elasticsearch, Cassandra)
//! - [`resilience`]: retry with backoff and per-call timeouts

pub mod batching;
pub mod changelog;
pub mod checkpoint;
pub mod config;
pub mod coordinator;
pub mod metrics;
pub mod reconciler;
pub mod record;
pub mod resilience;
pub mod scanner;
pub mod storage;
pub mod writer;

pub use batching::hybrid_batcher::{BatchConfig, FlushBatch, FlushReason, HybridBatcher, SizedItem};
pub use changelog::{ChangeLogEntry, ShardKey, TimeWindow};
pub use checkpoint::{CheckpointKey, CheckpointStore, MemoryCheckpointStore, SqlCheckpointStore};
pub use config::{ConfigError, SyncConfig};
pub use coordinator::{
    Direction, PassMode, PassReport, PipelineId, PipelineState, RunSummary, SyncError, SyncOrchestrator,
};
pub use metrics::LatencyTimer;
pub use record::{Document, FieldValue, Record, RecordSchema};
pub use resilience::retry::RetryConfig;
pub use storage::memory::InMemoryStore;
pub use storage::traits::{StorageError, SyncStore, WriteOp, WriteOutcome};
