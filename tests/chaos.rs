//! Chaos tests: store outages, broken change-log partitions, lost
//! compare-and-set races and poisoned records.
//!
//! Every scenario injects failures through a [`FailingStore`] wrapper, then
//! heals it and checks the system converges without losing anything.
//!
//! Run with: `cargo test --test chaos`

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use common::{
    eventually, record, settle, test_config, within, write_now, FailingStore, FaultyCheckpoints, Harness,
};
use sync_bridge::changelog::{now_millis, ChangeLogWriter};
use sync_bridge::config::RetrySettings;
use sync_bridge::{Direction, MemoryCheckpointStore, PassMode, PipelineId, PipelineState, SyncConfig, SyncError};

/// Harness whose store B goes through a [`FailingStore`].
fn with_failing_b(config: SyncConfig) -> (Harness, Arc<FailingStore>) {
    let a = common::memory_store("a", &config);
    let b = common::memory_store("b", &config);
    let failing = Arc::new(FailingStore::new(b.clone()));
    let h = Harness::with_stores(config, a.clone(), b, a, failing.clone());
    (h, failing)
}

/// Harness whose store A goes through a [`FailingStore`].
fn with_failing_a(config: SyncConfig) -> (Harness, Arc<FailingStore>) {
    let a = common::memory_store("a", &config);
    let b = common::memory_store("b", &config);
    let failing = Arc::new(FailingStore::new(a.clone()));
    let h = Harness::with_stores(config, a, b.clone(), failing.clone(), b);
    (h, failing)
}

// =============================================================================
// Destination outage
// =============================================================================

#[tokio::test]
async fn test_destination_outage_fails_pipeline_then_resumes() {
    let (h, failing_b) = with_failing_b(test_config(1, 2));
    let past = now_millis() - 1_000;
    for i in 0..10 {
        h.a.write_local(record(&format!("r{i:02}"), 1, "x"), past);
    }

    // Batches of 3: two land, then B goes away
    failing_b.fail_writes_after(2);
    let summary = h.orchestrator.sync_once(&CancellationToken::new()).await;

    assert_eq!(summary.exit_code(), 1);
    let (failed, err) = &summary.failures[0];
    assert_eq!(failed.direction, Direction::AToB);
    assert!(matches!(err, SyncError::StoreUnavailable { operation: "write_batch", .. }));
    assert_eq!(h.b.len(), 6);
    assert_eq!(
        h.orchestrator.pipeline_states().iter().find(|(id, _)| id.direction == Direction::AToB).map(|(_, s)| *s),
        Some(PipelineState::Failed)
    );
    // Nothing checkpointed for the failed direction
    assert!(h.checkpoints.snapshot().keys().all(|k| k.direction == Direction::BToA));

    failing_b.heal();
    let summary = h.orchestrator.sync_once(&CancellationToken::new()).await;
    assert_eq!(summary.exit_code(), 0);
    assert_eq!(h.b.len(), 10);
    h.assert_converged();
}

#[tokio::test]
async fn test_transient_write_errors_are_retried_within_a_pass() {
    let (h, failing_b) = with_failing_b(test_config(1, 2));
    h.orchestrator.sync_once(&CancellationToken::new()).await;

    write_now(&h.a, record("x", 1, "x"));
    settle().await;
    // Two refused calls; the third attempt of the retry budget lands
    failing_b.refuse_next.store(2, Ordering::SeqCst);
    let summary = h.orchestrator.sync_once(&CancellationToken::new()).await;

    assert_eq!(summary.exit_code(), 0);
    assert_eq!(h.b.get("x").map(|r| r.version), Some(1));
}

// =============================================================================
// Shard independence
// =============================================================================

#[tokio::test]
async fn test_broken_shard_does_not_block_other_workers() {
    let (h, failing_a) = with_failing_a(test_config(2, 4));
    h.orchestrator.sync_once(&CancellationToken::new()).await;

    // Worker 0 owns shards [0, 2), worker 1 owns [2, 4)
    h.a.write_local_in_shard(record("on.zero", 1, "x"), 0, now_millis());
    h.a.write_local_in_shard(record("on.three", 1, "y"), 3, now_millis());
    settle().await;
    *failing_a.broken_shard.lock() = Some(0);

    let summary = h.orchestrator.sync_once(&CancellationToken::new()).await;

    assert_eq!(summary.exit_code(), 1);
    let failed: Vec<PipelineId> = summary.failures.iter().map(|(id, _)| *id).collect();
    assert_eq!(
        failed,
        vec![PipelineId {
            direction: Direction::AToB,
            worker: 0
        }]
    );
    assert!(h.b.get("on.zero").is_none());
    assert_eq!(h.b.get("on.three").map(|r| r.version), Some(1));

    failing_a.heal();
    settle().await;
    let summary = h.orchestrator.sync_once(&CancellationToken::new()).await;
    assert_eq!(summary.exit_code(), 0);
    assert_eq!(h.b.get("on.zero").map(|r| r.version), Some(1));
    h.assert_converged();
}

// =============================================================================
// Record-level failures
// =============================================================================

#[tokio::test]
async fn test_lost_cas_races_are_retried() {
    let (h, failing_b) = with_failing_b(test_config(1, 2));
    h.orchestrator.sync_once(&CancellationToken::new()).await;

    write_now(&h.a, record("contended", 1, "x"));
    settle().await;
    failing_b.conflicts.store(2, Ordering::SeqCst);

    let summary = h.orchestrator.sync_once(&CancellationToken::new()).await;

    assert_eq!(summary.exit_code(), 0);
    let retried: usize = summary.passes.iter().map(|p| p.conflicts_retried).sum();
    assert_eq!(retried, 2);
    assert_eq!(h.b.get("contended").map(|r| r.version), Some(1));
}

#[tokio::test]
async fn test_poisoned_record_holds_checkpoint_back() {
    let (h, failing_b) = with_failing_b(test_config(1, 2));
    h.orchestrator.sync_once(&CancellationToken::new()).await;

    let poisoned_at = now_millis();
    h.a.write_local(record("poison", 1, "x"), poisoned_at);
    write_now(&h.a, record("fine", 1, "y"));
    settle().await;
    *failing_b.poison.lock() = Some("poison".to_string());

    let summary = h.orchestrator.sync_once(&CancellationToken::new()).await;

    let a_to_b = summary
        .passes
        .iter()
        .find(|p| p.pipeline.direction == Direction::AToB)
        .expect("a_to_b pass");
    assert_eq!(a_to_b.failed, 1);
    assert!(!a_to_b.is_clean());
    assert_eq!(h.b.get("fine").map(|r| r.version), Some(1));
    assert!(h.b.get("poison").is_none());
    for (key, checkpoint) in h.checkpoints.snapshot() {
        if key.direction == Direction::AToB {
            assert!(checkpoint.timestamp < poisoned_at, "{key} skipped past the failed record");
        }
    }

    // Once the record is accepted, the next pass re-reads and delivers it
    failing_b.heal();
    settle().await;
    let summary = h.orchestrator.sync_once(&CancellationToken::new()).await;
    assert_eq!(summary.exit_code(), 0);
    assert_eq!(h.b.get("poison").map(|r| r.version), Some(1));
    h.assert_converged();
}

#[tokio::test]
async fn test_malformed_source_documents_are_skipped() {
    let config = test_config(1, 2);
    let h = Harness::new(config);
    let past = now_millis() - 1_000;

    let mut broken = sync_bridge::Document::new();
    broken.insert("id".into(), sync_bridge::FieldValue::Str("broken".into()));
    broken.insert("version".into(), sync_bridge::FieldValue::Str("not a number".into()));
    h.a.insert_raw("broken", broken, past);
    h.a.write_local(record("ok", 1, "x"), past);

    let summary = h.orchestrator.sync_once(&CancellationToken::new()).await;

    assert_eq!(summary.exit_code(), 0);
    let malformed: usize = summary.passes.iter().map(|p| p.malformed).sum();
    assert_eq!(malformed, 1);
    assert!(h.b.get("ok").is_some());
    assert_eq!(h.b.version_of("broken"), None);
}

#[tokio::test]
async fn test_malformed_change_log_page_does_not_end_the_shard() {
    // Change-log pages hold 3 entries
    let h = Harness::new(test_config(1, 1));
    h.orchestrator.sync_once(&CancellationToken::new()).await;

    let at = now_millis();
    let changelog = ChangeLogWriter::new(1);
    for i in 0..3 {
        h.a.append_change(changelog.entry_in(0, &format!("bad.{i}"), -1, at));
    }
    h.a.write_local_in_shard(record("good", 1, "x"), 0, at + 1);
    tokio::time::sleep(Duration::from_millis(5)).await;

    let summary = h.orchestrator.sync_once(&CancellationToken::new()).await;

    assert_eq!(summary.exit_code(), 0);
    let malformed: usize = summary.passes.iter().map(|p| p.malformed).sum();
    assert_eq!(malformed, 3);
    assert_eq!(h.b.version_of("good"), Some(1));
    h.assert_converged();
}

// =============================================================================
// Checkpoint store outage
// =============================================================================

fn with_faulty_checkpoints(config: SyncConfig) -> (Harness, Arc<FaultyCheckpoints>) {
    let a = common::memory_store("a", &config);
    let b = common::memory_store("b", &config);
    let inner = Arc::new(MemoryCheckpointStore::new());
    let faulty = Arc::new(FaultyCheckpoints::new(inner.clone()));
    let h = Harness::with_checkpoints(config, a.clone(), b.clone(), a, b, inner, faulty.clone());
    (h, faulty)
}

#[tokio::test]
async fn test_transient_checkpoint_errors_are_retried() {
    let (h, faulty) = with_faulty_checkpoints(test_config(1, 2));
    h.a.write_local(record("x", 1, "x"), now_millis() - 1_000);
    // max_attempts is 3, so two failures fit in any single call's budget
    faulty.fail_next.store(2, Ordering::SeqCst);

    let summary = h.orchestrator.sync_once(&CancellationToken::new()).await;

    assert_eq!(summary.exit_code(), 0);
    assert_eq!(faulty.fail_next.load(Ordering::SeqCst), 0);
    assert_eq!(h.checkpoints.len(), 4);
    h.assert_converged();
}

#[tokio::test]
async fn test_hanging_checkpoint_store_times_out() {
    let config = SyncConfig {
        retry: RetrySettings {
            max_attempts: 2,
            initial_delay_ms: 1,
            max_delay_ms: 5,
            call_timeout_ms: 50,
            max_conflict_retries: 3,
        },
        ..test_config(1, 2)
    };
    let (h, faulty) = with_faulty_checkpoints(config);
    faulty.hang.store(true, Ordering::SeqCst);

    let summary = within(
        Duration::from_secs(5),
        "sync against a hanging checkpoint store",
        h.orchestrator.sync_once(&CancellationToken::new()),
    )
    .await;

    assert_eq!(summary.exit_code(), 1);
    assert_eq!(summary.failures.len(), 2);
    assert!(summary.failures.iter().all(|(_, e)| matches!(e, SyncError::Checkpoint(_))));
    assert!(h.orchestrator.pipeline_states().iter().all(|(_, s)| *s == PipelineState::Failed));

    faulty.hang.store(false, Ordering::SeqCst);
    let summary = h.orchestrator.sync_once(&CancellationToken::new()).await;
    assert_eq!(summary.exit_code(), 0);
    assert!(summary.passes.iter().all(|p| p.mode == PassMode::Full));
}

// =============================================================================
// Continuous sync
// =============================================================================

fn looping(config: SyncConfig) -> SyncConfig {
    SyncConfig { interval: 0.02, ..config }
}

#[tokio::test]
async fn test_sync_forever_keeps_both_directions_flowing_until_cancelled() {
    let h = Harness::new(looping(test_config(1, 2)));
    let cancel = CancellationToken::new();
    let orchestrator = h.orchestrator.clone();
    let token = cancel.clone();
    let running = tokio::spawn(async move { orchestrator.sync_forever(&token).await });

    write_now(&h.a, record("live", 1, "x"));
    eventually(Duration::from_secs(5), "A's write to reach B", || h.b.version_of("live") == Some(1)).await;
    write_now(&h.b, record("live", 2, "y"));
    eventually(Duration::from_secs(5), "B's update to reach A", || h.a.version_of("live") == Some(2)).await;

    cancel.cancel();
    within(Duration::from_secs(5), "sync_forever shutdown", running).await.unwrap();
    assert!(h.orchestrator.is_idle());
    h.assert_converged();
}

#[tokio::test]
async fn test_sync_forever_retries_a_failed_pipeline_while_others_run() {
    let (h, failing_b) = with_failing_b(looping(test_config(1, 2)));
    let past = now_millis() - 1_000;
    h.a.write_local(record("stuck", 1, "x"), past);
    h.b.write_local(record("flows", 1, "y"), past);
    failing_b.fail_writes_after(0);

    let cancel = CancellationToken::new();
    let orchestrator = h.orchestrator.clone();
    let token = cancel.clone();
    let running = tokio::spawn(async move { orchestrator.sync_forever(&token).await });

    // One pass spends 3 write attempts on B; more means the loop came back for it
    eventually(Duration::from_secs(5), "a second a_to_b pass", || {
        failing_b.write_calls.load(Ordering::SeqCst) > 3
    })
    .await;
    eventually(Duration::from_secs(5), "b_to_a to keep running", || h.a.version_of("flows") == Some(1)).await;
    assert_eq!(h.b.version_of("stuck"), None);

    failing_b.heal();
    eventually(Duration::from_secs(5), "A's write to reach B after healing", || {
        h.b.version_of("stuck") == Some(1)
    })
    .await;

    cancel.cancel();
    within(Duration::from_secs(5), "sync_forever shutdown", running).await.unwrap();
    h.assert_converged();
}
