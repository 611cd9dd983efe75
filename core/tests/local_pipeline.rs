//! End-to-end local batches: queue, consumers, buffer, finalizer.

mod common;

use bingo_sim_core::{
    cancel::CancelFlag,
    catalog::JsonCatalog,
    config::PipelineConfig,
    engine::SimEngine,
    error::SimError,
    pipeline::BatchOrchestrator,
    seed::derive_run_seed,
    snapshot::EventSnapshot,
    types::{BatchStatus, ExecutionMode, RunStatus},
};
use common::memory_store;

#[test]
fn local_batch_completes_with_replayable_results() {
    let store = memory_store();
    let catalog = JsonCatalog::default_test();
    let orchestrator = BatchOrchestrator::new(store.clone(), &catalog, PipelineConfig::default_test());

    let summary = orchestrator
        .run_local_batch("evt-test", 6, Some("LOCAL"), &CancelFlag::new())
        .expect("local batch");

    assert_eq!(summary.batch.status, BatchStatus::Completed);
    assert_eq!(summary.batch.execution_mode, ExecutionMode::Local);
    assert_eq!(summary.batch.seed, "LOCAL");
    assert_eq!(summary.counts.completed, 6);
    assert_eq!(summary.counts.total(), 6);
    assert!(summary.batch.error_message.is_none());

    assert_eq!(summary.aggregates.len(), 2);
    let win_rate: f64 = summary.aggregates.iter().map(|a| a.win_rate).sum();
    assert!((win_rate - 1.0).abs() < 1e-9, "win rates sum to {win_rate}");
    for agg in &summary.aggregates {
        assert_eq!(agg.run_count, 6);
        assert!(agg.min_points as f64 <= agg.mean_points && agg.mean_points <= agg.max_points as f64);
    }

    // Every stored run replays from its seed alone.
    let json = EventSnapshot::default_test().to_json().expect("snapshot");
    for run in store.runs_for_batch(&summary.batch.id).expect("runs") {
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.seed, derive_run_seed("LOCAL", run.run_index));
        let stored = store.results_for_run(&run.id).expect("stored results");
        let direct = SimEngine::execute(&json, &run.seed).expect("direct run");
        assert_eq!(stored, direct, "run {} diverged", run.run_index);
    }
}

#[test]
fn empty_batch_is_completed_immediately() {
    let store = memory_store();
    let catalog = JsonCatalog::default_test();
    let orchestrator = BatchOrchestrator::new(store, &catalog, PipelineConfig::default_test());

    let summary = orchestrator
        .run_local_batch("evt-test", 0, None, &CancelFlag::new())
        .expect("empty batch");
    assert_eq!(summary.batch.status, BatchStatus::Completed);
    assert!(summary.aggregates.is_empty());
    assert!(!summary.batch.seed.is_empty(), "a seed is generated when none is given");
}

#[test]
fn unknown_event_fails_before_anything_is_stored() {
    let store = memory_store();
    let catalog = JsonCatalog::default_test();
    let orchestrator = BatchOrchestrator::new(store.clone(), &catalog, PipelineConfig::default_test());

    let err = orchestrator
        .run_local_batch("evt-missing", 3, None, &CancelFlag::new())
        .unwrap_err();
    assert!(matches!(err, SimError::EventNotFound { .. }), "got {err:?}");
    assert!(store.non_terminal_batches().expect("batches").is_empty());
}
