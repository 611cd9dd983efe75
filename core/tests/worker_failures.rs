//! Failure accounting as seen through the worker rather than the store.

mod common;

use bingo_sim_core::{
    buffer::ResultBuffer,
    cache::SnapshotCache,
    cancel::CancelFlag,
    config::PipelineConfig,
    distribution::{BatchMessage, MessageBroker, SqliteBroker},
    finalize::BatchFinalizer,
    snapshot::{EventSnapshot, ScheduledSession, WeeklySchedule},
    store::SimStore,
    types::{BatchStatus, RunStatus},
    worker::{run_distributed_worker, BatchWorker},
};
use common::{seed_batch, seed_batch_with, TempDb};
use std::sync::Arc;
use std::time::Duration;

fn worker(store: &SimStore, buffer: &Arc<ResultBuffer>, config: &PipelineConfig) -> BatchWorker {
    let cache = Arc::new(SnapshotCache::new(
        config.snapshot_cache_ttl(),
        config.snapshot_cache_capacity,
    ));
    BatchWorker::new(store.clone(), cache, Arc::clone(buffer), config, CancelFlag::new())
}

fn buffer(store: &SimStore, config: &PipelineConfig) -> Arc<ResultBuffer> {
    Arc::new(ResultBuffer::new(store.clone(), BatchFinalizer::new(store.clone()), config))
}

/// Remove the stored snapshot so every later load fails with a
/// retryable error.
fn drop_snapshot(db: &TempDb, batch_id: &str) {
    let admin = rusqlite::Connection::open(&db.path).expect("admin connection");
    admin.busy_timeout(Duration::from_secs(10)).expect("busy timeout");
    let removed = admin
        .execute("DELETE FROM event_snapshot WHERE batch_id = ?1", [batch_id])
        .expect("delete snapshot");
    assert_eq!(removed, 1);
}

#[test]
fn transient_failures_retry_until_the_run_fails() {
    let db = TempDb::new("worker-retry");
    let store = db.store();
    let config = PipelineConfig::default_test();
    let (batch_id, run_ids) = seed_batch(&store, 3);
    let buffer = buffer(&store, &config);

    let healthy = worker(&store, &buffer, &config);
    let report = healthy
        .handle(&BatchMessage::new(vec![run_ids[0].clone(), run_ids[2].clone()]))
        .expect("handle");
    assert_eq!(report.completed, 2);
    buffer.flush().expect("flush");

    // A fresh cache forces the load that now fails.
    drop_snapshot(&db, &batch_id);
    let broken = worker(&store, &buffer, &config);
    let message = BatchMessage::new(vec![run_ids[1].clone()]);

    for attempt in 1..config.max_run_attempts {
        let report = broken.handle(&message).expect("handle");
        assert_eq!(report.claimed, 1);
        assert_eq!(report.retrying, vec![run_ids[1].clone()]);
        assert_eq!(report.failed, 0);
        let run = store.get_run(&run_ids[1]).expect("run");
        assert_eq!(run.status, RunStatus::Pending);
        assert_eq!(run.attempt_count, attempt);
        assert_eq!(store.get_batch(&batch_id).expect("batch").status, BatchStatus::Running);
    }

    let report = broken.handle(&message).expect("handle");
    assert!(report.retrying.is_empty());
    assert_eq!(report.failed, 1);

    let run = store.get_run(&run_ids[1]).expect("run");
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.attempt_count, config.max_run_attempts);
    assert!(run.last_error.is_some());

    let batch = store.get_batch(&batch_id).expect("batch");
    assert_eq!(batch.status, BatchStatus::Error);
    let message = batch.error_message.expect("error message");
    assert!(message.contains("1 of 3"), "{message}");
    let aggregates = store.aggregates_for_batch(&batch_id).expect("aggregates");
    assert!(!aggregates.is_empty());
    assert!(aggregates.iter().all(|a| a.run_count == 2));
}

#[test]
fn distributed_worker_redelivers_until_the_run_fails() {
    let db = TempDb::new("worker-nack");
    let store = db.store();
    let config = PipelineConfig::default_test();
    let (batch_id, run_ids) = seed_batch(&store, 1);
    drop_snapshot(&db, &batch_id);

    let broker = SqliteBroker::new(store.clone(), Duration::from_millis(config.visibility_timeout_ms));
    broker
        .publish(&batch_id, &BatchMessage::new(run_ids.clone()))
        .expect("publish");

    let buffer = buffer(&store, &config);
    let worker = worker(&store, &buffer, &config);
    let stats = run_distributed_worker(
        &worker,
        &broker,
        config.max_in_flight,
        config.poll_interval(),
        true,
        &CancelFlag::new(),
    )
    .expect("worker loop");

    // Every retryable attempt came back through a nack.
    assert_eq!(stats.messages, u64::from(config.max_run_attempts));
    assert_eq!(stats.runs_failed, 1);
    assert_eq!(stats.runs_completed, 0);
    assert!(broker.receive(1).expect("receive").is_empty());

    let run = store.get_run(&run_ids[0]).expect("run");
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.attempt_count, config.max_run_attempts);
    assert_eq!(store.get_batch(&batch_id).expect("batch").status, BatchStatus::Error);
}

#[test]
fn runs_that_cannot_progress_fail_on_the_first_attempt() {
    let db = TempDb::new("worker-stuck");
    let store = db.store();
    let config = PipelineConfig::default_test();

    let mut snapshot = EventSnapshot::default_test();
    let never = WeeklySchedule {
        sessions: vec![ScheduledSession {
            day_of_week: 2,
            start_minute_of_day: 600,
            duration_minutes: 0,
        }],
    };
    for team in &mut snapshot.teams {
        for player in &mut team.players {
            player.schedule = Some(never.clone());
        }
    }
    let (batch_id, run_ids) = seed_batch_with(&store, 1, &snapshot);

    let buffer = buffer(&store, &config);
    let report = worker(&store, &buffer, &config)
        .handle(&BatchMessage::new(run_ids.clone()))
        .expect("handle");
    assert!(report.retrying.is_empty());
    assert_eq!(report.failed, 1);

    let run = store.get_run(&run_ids[0]).expect("run");
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.attempt_count, 1);
    let error = run.last_error.expect("last error");
    assert!(error.contains("No progress"), "{error}");

    let batch = store.get_batch(&batch_id).expect("batch");
    assert_eq!(batch.status, BatchStatus::Error);
    assert!(batch.error_message.is_some_and(|m| m.contains("1 of 1")));
}
