//! Run modes: one cycle, forever, reset.

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::pipeline::Pipeline;
use super::{PipelineState, RunSummary, SyncError, SyncOrchestrator};

impl SyncOrchestrator {
    /// One pass of every pipeline, both directions concurrently.
    ///
    /// Failures are collected per pipeline; siblings always run to completion.
    #[tracing::instrument(skip_all)]
    pub async fn sync_once(&self, cancel: &CancellationToken) -> RunSummary {
        let started = Instant::now();
        let _running = self.run_lock.clone().read_owned().await;

        let handles: Vec<_> = self
            .pipelines
            .iter()
            .map(|pipeline| {
                let pipeline = Arc::clone(pipeline);
                let cancel = cancel.clone();
                (pipeline.id(), tokio::spawn(async move { pipeline.run_pass(&cancel).await }))
            })
            .collect();

        let mut summary = RunSummary::default();
        for (id, handle) in handles {
            match handle.await {
                Ok(Ok(report)) => summary.passes.push(report),
                Ok(Err(e)) => summary.failures.push((id, e)),
                Err(join) => {
                    error!(pipeline = %id, error = %join, "Pipeline task aborted");
                    summary.failures.push((id, SyncError::Aborted(join.to_string())));
                }
            }
        }
        summary.elapsed = started.elapsed();

        info!(
            applied = summary.applied(),
            failed_records = summary.failed_records(),
            failed_pipelines = summary.failures.len(),
            "Took {:.3} seconds",
            summary.elapsed.as_secs_f64()
        );
        summary
    }

    /// Run every pipeline in its own loop until `cancel` fires.
    ///
    /// Each pipeline sleeps `interval` after its own pass; a failed pipeline
    /// is retried on its next interval while the others keep going.
    #[tracing::instrument(skip_all)]
    pub async fn sync_forever(&self, cancel: &CancellationToken) {
        let interval = self.config.pass_interval();
        info!(?interval, pipelines = self.pipelines.len(), "Starting continuous sync");

        let handles: Vec<_> = self
            .pipelines
            .iter()
            .map(|pipeline| {
                let pipeline = Arc::clone(pipeline);
                let run_lock = Arc::clone(&self.run_lock);
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    loop {
                        if cancel.is_cancelled() {
                            break;
                        }
                        run_one(&pipeline, &run_lock, &cancel).await;

                        match interval {
                            Some(pause) => {
                                tokio::select! {
                                    _ = cancel.cancelled() => break,
                                    _ = tokio::time::sleep(pause) => {}
                                }
                            }
                            None => tokio::task::yield_now().await,
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Pipeline loop aborted");
            }
        }
        info!("Continuous sync stopped");
    }

    /// Delete every checkpoint so the next pass of each pipeline is a full sync.
    ///
    /// Only allowed while every pipeline is idle.
    pub async fn reset(&self) -> Result<(), SyncError> {
        let _exclusive = self.run_lock.try_write().map_err(|_| SyncError::NotIdle)?;
        // Held until the clear completes; a pass queued behind it sees no checkpoints at all
        self.checkpoints.clear().await.map_err(SyncError::Checkpoint)?;
        for pipeline in &self.pipelines {
            pipeline.set_state(PipelineState::Idle);
        }
        info!("Checkpoints reset; next pass will be a full sync");
        Ok(())
    }
}

async fn run_one(pipeline: &Pipeline, run_lock: &Arc<tokio::sync::RwLock<()>>, cancel: &CancellationToken) {
    let _running = run_lock.read().await;
    match pipeline.run_pass(cancel).await {
        Ok(report) if report.cancelled => info!(pipeline = %pipeline.id(), "Pass cancelled"),
        Ok(_) => {}
        Err(e) => warn!(
            pipeline = %pipeline.id(),
            shards = %pipeline.shards(),
            error = %e,
            "Pipeline failed, retrying next interval"
        ),
    }
}
