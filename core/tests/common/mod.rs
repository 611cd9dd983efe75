//! Shared fixtures for the pipeline tests.

#![allow(dead_code)]

use bingo_sim_core::{
    seed::derive_run_seed,
    snapshot::EventSnapshot,
    store::{NewBatch, NewRun, SimStore},
    types::{BatchId, ExecutionMode, RunId},
};

/// A database file under the temp dir, removed (with its WAL files) on drop.
pub struct TempDb {
    pub path: String,
}

impl TempDb {
    pub fn new(tag: &str) -> Self {
        let path = std::env::temp_dir()
            .join(format!("bingo-{tag}-{}.db", uuid::Uuid::new_v4()))
            .to_string_lossy()
            .into_owned();
        Self { path }
    }

    pub fn store(&self) -> SimStore {
        init_logging();
        let store = SimStore::open(&self.path).expect("open db");
        store.migrate().expect("migrate");
        store
    }
}

impl Drop for TempDb {
    fn drop(&mut self) {
        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{}{suffix}", self.path));
        }
    }
}

/// Route `log` output through the test harness; set RUST_LOG to see it.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn memory_store() -> SimStore {
    init_logging();
    let store = SimStore::in_memory().expect("open in-memory db");
    store.migrate().expect("migrate");
    store
}

/// Store a running batch of the standard test event with `runs` runs.
pub fn seed_batch(store: &SimStore, runs: u32) -> (BatchId, Vec<RunId>) {
    seed_batch_with(store, runs, &EventSnapshot::default_test())
}

pub fn seed_batch_with(store: &SimStore, runs: u32, snapshot: &EventSnapshot) -> (BatchId, Vec<RunId>) {
    let batch_id = uuid::Uuid::new_v4().to_string();
    let batch = NewBatch {
        id: batch_id.clone(),
        event_id: "evt-test".into(),
        run_count: runs,
        seed: "FIXTURE".into(),
        execution_mode: ExecutionMode::Local,
    };
    let new_runs: Vec<NewRun> = (0..runs)
        .map(|i| NewRun {
            id: uuid::Uuid::new_v4().to_string(),
            run_index: i,
            seed: derive_run_seed("FIXTURE", i),
        })
        .collect();
    let snapshot = snapshot.to_json().expect("snapshot json");
    store.create_batch(&batch, &snapshot, &new_runs).expect("create batch");
    store.mark_batch_running(&batch_id).expect("mark running");
    (batch_id, new_runs.into_iter().map(|r| r.id).collect())
}
