//! Buffered result persistence.
//!
//! RULE: The lock guards only the in-memory list. Writes happen after the
//! lock is released, on a handle from `reopen`, so `add` never waits on
//! another thread's I/O. A flush commits results and Completed status in
//! one transaction, then offers every batch it touched to the finalizer.

use crate::{
    cancel::CancelFlag,
    config::PipelineConfig,
    error::{SimError, SimResult},
    finalize::BatchFinalizer,
    metrics::{LogPhaseRecorder, PhaseRecorder},
    store::{CompletedRun, SimStore},
};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

struct BufferState {
    pending: Vec<CompletedRun>,
    last_flush: Instant,
}

pub struct ResultBuffer {
    store: SimStore,
    finalizer: BatchFinalizer,
    batch_size: usize,
    flush_interval: Duration,
    state: Mutex<BufferState>,
    phases: Arc<dyn PhaseRecorder>,
}

impl ResultBuffer {
    pub fn new(store: SimStore, finalizer: BatchFinalizer, config: &PipelineConfig) -> Self {
        Self {
            store,
            finalizer,
            batch_size: config.result_batch_size.max(1),
            flush_interval: config.flush_interval(),
            state: Mutex::new(BufferState {
                pending: Vec::new(),
                last_flush: Instant::now(),
            }),
            phases: Arc::new(LogPhaseRecorder::new()),
        }
    }

    pub fn with_phase_recorder(mut self, phases: Arc<dyn PhaseRecorder>) -> Self {
        self.phases = phases;
        self
    }

    fn lock(&self) -> SimResult<std::sync::MutexGuard<'_, BufferState>> {
        self.state
            .lock()
            .map_err(|_| SimError::Other(anyhow::anyhow!("result buffer lock poisoned")))
    }

    /// Buffer one finished run; flush when the size or age threshold trips.
    pub fn add(&self, run: CompletedRun) -> SimResult<()> {
        let drained = {
            let mut state = self.lock()?;
            state.pending.push(run);
            let due = state.pending.len() >= self.batch_size
                || state.last_flush.elapsed() >= self.flush_interval;
            if due {
                state.last_flush = Instant::now();
                std::mem::take(&mut state.pending)
            } else {
                Vec::new()
            }
        };
        if !drained.is_empty() {
            self.write(drained)?;
        }
        Ok(())
    }

    /// Write everything buffered. Returns the number of runs written.
    pub fn flush(&self) -> SimResult<usize> {
        let drained = {
            let mut state = self.lock()?;
            state.last_flush = Instant::now();
            std::mem::take(&mut state.pending)
        };
        if drained.is_empty() {
            return Ok(0);
        }
        self.write(drained)
    }

    pub fn len(&self) -> usize {
        self.state.lock().map(|s| s.pending.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn write(&self, runs: Vec<CompletedRun>) -> SimResult<usize> {
        let started = Instant::now();
        let store = self.store.reopen()?;
        if let Err(e) = store.persist_results(&runs) {
            // Nothing was committed; keep the runs for the next attempt.
            log::warn!("flush of {} runs failed: {e}", runs.len());
            if let Ok(mut state) = self.state.lock() {
                state.pending.extend(runs);
            }
            return Err(e);
        }
        let count = runs.len();
        self.phases.record("flush", started.elapsed(), count as u64);
        log::debug!("flushed {count} runs");

        let batches: BTreeSet<&str> = runs.iter().map(|r| r.batch_id.as_str()).collect();
        for batch_id in batches {
            self.finalizer.try_finalize(batch_id)?;
        }
        Ok(count)
    }

    /// Periodic sweep so a trickle of runs that never reaches the size
    /// threshold still gets written. Flushes once more on exit.
    pub fn run_sweeper(&self, interval: Duration, stop: &CancelFlag) {
        while stop.sleep(interval) {
            if let Err(e) = self.flush() {
                log::warn!("buffer sweep failed: {e}");
            }
        }
        if let Err(e) = self.flush() {
            log::warn!("final buffer flush failed: {e}");
        }
    }

    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration, stop: CancelFlag) -> JoinHandle<()> {
        std::thread::spawn(move || self.run_sweeper(interval, &stop))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::TeamRunResult;
    use crate::store::{NewBatch, NewRun};
    use crate::types::{ExecutionMode, RunStatus};
    use std::collections::BTreeMap;

    fn setup(runs: u32) -> (SimStore, Vec<String>) {
        let store = SimStore::in_memory().unwrap();
        store.migrate().unwrap();
        let new_runs: Vec<NewRun> = (0..runs)
            .map(|i| NewRun {
                id: format!("run-{i}"),
                run_index: i,
                seed: format!("S_{i}"),
            })
            .collect();
        let batch = NewBatch {
            id: "batch".into(),
            event_id: "event".into(),
            run_count: runs,
            seed: "S".into(),
            execution_mode: ExecutionMode::Local,
        };
        store.create_batch(&batch, "{}", &new_runs).unwrap();
        let ids: Vec<String> = new_runs.into_iter().map(|r| r.id).collect();
        store.claim_runs(&ids).unwrap();
        (store, ids)
    }

    fn completed(run_id: &str) -> CompletedRun {
        CompletedRun {
            run_id: run_id.into(),
            batch_id: "batch".into(),
            is_retry: false,
            results: vec![TeamRunResult {
                team_id: "t".into(),
                team_name: "T".into(),
                total_points: 3,
                tiles_completed: 2,
                row_reached: 0,
                is_winner: true,
                row_unlock_times: BTreeMap::from([(0, 0)]),
                tile_completion_times: BTreeMap::new(),
            }],
        }
    }

    fn config(batch_size: usize) -> PipelineConfig {
        PipelineConfig {
            result_batch_size: batch_size,
            flush_interval_ms: 60_000,
            ..PipelineConfig::default_test()
        }
    }

    #[test]
    fn size_threshold_triggers_flush() {
        let (store, ids) = setup(3);
        let buffer = ResultBuffer::new(store.clone(), BatchFinalizer::new(store.clone()), &config(2));
        buffer.add(completed(&ids[0])).unwrap();
        assert_eq!(buffer.len(), 1);
        assert_eq!(store.get_run(&ids[0]).unwrap().status, RunStatus::Running);
        buffer.add(completed(&ids[1])).unwrap();
        assert!(buffer.is_empty());
        assert_eq!(store.get_run(&ids[0]).unwrap().status, RunStatus::Completed);
        assert_eq!(store.results_for_run(&ids[1]).unwrap().len(), 1);
    }

    #[test]
    fn final_flush_finalizes_the_batch() {
        let (store, ids) = setup(2);
        let buffer = ResultBuffer::new(store.clone(), BatchFinalizer::new(store.clone()), &config(10));
        for id in &ids {
            buffer.add(completed(id)).unwrap();
        }
        assert_eq!(buffer.flush().unwrap(), 2);
        let batch = store.get_batch("batch").unwrap();
        assert_eq!(batch.status, crate::types::BatchStatus::Completed);
        assert_eq!(store.aggregates_for_batch("batch").unwrap()[0].win_rate, 1.0);
    }

    #[test]
    fn retry_overwrites_earlier_results() {
        let (store, ids) = setup(1);
        let buffer = ResultBuffer::new(store.clone(), BatchFinalizer::new(store.clone()), &config(1));
        buffer.add(completed(&ids[0])).unwrap();
        let mut again = completed(&ids[0]);
        again.is_retry = true;
        again.results[0].total_points = 9;
        buffer.add(again).unwrap();
        let stored = store.results_for_run(&ids[0]).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].total_points, 9);
    }
}
