//! Batch orchestration: create a batch, publish its runs, and (in local
//! mode) drive it to a terminal status inside this process.
//!
//! EXECUTION ORDER for a local batch:
//!   1. Consumers and the buffer sweeper start.
//!   2. The snapshot is assembled, the batch stored, runs published.
//!   3. Consumers claim and execute; the buffer flushes and finalizes.
//!   4. The driver polls until the batch is terminal, then stops the
//!      background threads and returns the summary.

use crate::{
    assembly::SnapshotAssembler,
    buffer::ResultBuffer,
    cache::SnapshotCache,
    cancel::CancelFlag,
    catalog::EventCatalog,
    config::PipelineConfig,
    distribution::{BatchMessage, LocalQueue, WorkPublisher},
    error::{SimError, SimResult},
    finalize::BatchFinalizer,
    seed::{derive_run_seed, generate_batch_seed},
    store::{BatchRow, NewBatch, NewRun, RunStatusCounts, SimStore, TeamAggregate},
    types::{BatchId, ExecutionMode, RunId},
    worker::BatchWorker,
};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub struct StartedBatch {
    pub batch_id: BatchId,
    pub seed: String,
    pub run_ids: Vec<RunId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchSummary {
    pub batch: BatchRow,
    pub counts: RunStatusCounts,
    pub aggregates: Vec<TeamAggregate>,
}

pub struct BatchOrchestrator<'c> {
    store: SimStore,
    catalog: &'c dyn EventCatalog,
    config: PipelineConfig,
}

impl<'c> BatchOrchestrator<'c> {
    pub fn new(store: SimStore, catalog: &'c dyn EventCatalog, config: PipelineConfig) -> Self {
        Self {
            store,
            catalog,
            config,
        }
    }

    /// Assemble and store the batch with its snapshot and runs, mark it
    /// running, and publish every run id.
    pub fn start_batch(
        &self,
        event_id: &str,
        run_count: u32,
        seed: Option<&str>,
        mode: ExecutionMode,
        publisher: &dyn WorkPublisher,
    ) -> SimResult<StartedBatch> {
        let (_, snapshot_json) = SnapshotAssembler::new(self.catalog).assemble_json(event_id)?;

        let seed = seed
            .map(str::to_string)
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(generate_batch_seed);
        let batch = NewBatch {
            id: Uuid::new_v4().to_string(),
            event_id: event_id.to_string(),
            run_count,
            seed: seed.clone(),
            execution_mode: mode,
        };
        let runs: Vec<NewRun> = (0..run_count)
            .map(|i| NewRun {
                id: Uuid::new_v4().to_string(),
                run_index: i,
                seed: derive_run_seed(&seed, i),
            })
            .collect();

        self.store.create_batch(&batch, &snapshot_json, &runs)?;
        self.store.mark_batch_running(&batch.id)?;
        let run_ids: Vec<RunId> = runs.into_iter().map(|r| r.id).collect();
        publisher.publish(&batch.id, &run_ids)?;
        log::info!(
            "batch {} started: event={event_id} runs={run_count} seed={seed} mode={}",
            batch.id,
            mode.as_str()
        );

        if run_count == 0 {
            BatchFinalizer::new(self.store.clone()).try_finalize(&batch.id)?;
        }
        Ok(StartedBatch {
            batch_id: batch.id,
            seed,
            run_ids,
        })
    }

    /// Run a whole batch in this process and block until it is terminal.
    pub fn run_local_batch(
        &self,
        event_id: &str,
        run_count: u32,
        seed: Option<&str>,
        cancel: &CancelFlag,
    ) -> SimResult<BatchSummary> {
        let queue = LocalQueue::bounded(self.config.queue_capacity);
        let cache = Arc::new(SnapshotCache::new(
            self.config.snapshot_cache_ttl(),
            self.config.snapshot_cache_capacity,
        ));
        let finalizer = BatchFinalizer::new(self.store.clone());
        let buffer = Arc::new(ResultBuffer::new(
            self.store.clone(),
            finalizer.clone(),
            &self.config,
        ));
        let worker = BatchWorker::new(
            self.store.clone(),
            cache,
            Arc::clone(&buffer),
            &self.config,
            cancel.clone(),
        );
        let stop = CancelFlag::new();

        let outcome = std::thread::scope(|s| {
            for _ in 0..self.config.consumer_count.max(1) {
                let receiver = queue.receiver();
                let (worker, stop) = (&worker, &stop);
                s.spawn(move || self.consume_local(worker, receiver, stop, cancel));
            }
            {
                let (buffer, stop) = (&buffer, &stop);
                let interval = self.config.sweep_interval();
                s.spawn(move || buffer.run_sweeper(interval, stop));
            }

            let outcome = self
                .start_batch(event_id, run_count, seed, ExecutionMode::Local, &queue)
                .and_then(|started| self.await_terminal(&started.batch_id, &finalizer, cancel));
            stop.cancel();
            outcome
        });

        let batch_id = outcome?;
        buffer.flush()?;
        self.batch_summary(&batch_id)
    }

    fn consume_local(
        &self,
        worker: &BatchWorker,
        receiver: Receiver<BatchMessage>,
        stop: &CancelFlag,
        cancel: &CancelFlag,
    ) {
        let poll = self.config.poll_interval();
        while !stop.is_cancelled() && !cancel.is_cancelled() {
            let message = match receiver.recv_timeout(poll) {
                Ok(message) => message,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };
            // Retries run straight away on this consumer.
            let mut next = Some(message);
            while let Some(message) = next.take() {
                match worker.handle(&message) {
                    Ok(report) if !report.retrying.is_empty() => {
                        next = Some(BatchMessage::new(report.retrying));
                    }
                    Ok(_) => {}
                    Err(SimError::Cancelled) => return,
                    Err(e) => log::warn!("local consumer failed on {:?}: {e}", message.run_ids),
                }
            }
        }
    }

    /// Poll until the batch is terminal, nudging the finalizer each time.
    fn await_terminal(
        &self,
        batch_id: &str,
        finalizer: &BatchFinalizer,
        cancel: &CancelFlag,
    ) -> SimResult<BatchId> {
        loop {
            finalizer.try_finalize(batch_id)?;
            if self.store.get_batch(batch_id)?.status.is_terminal() {
                return Ok(batch_id.to_string());
            }
            if !cancel.sleep(self.config.poll_interval()) {
                return Err(SimError::Cancelled);
            }
        }
    }

    pub fn batch_progress(&self, batch_id: &str) -> SimResult<RunStatusCounts> {
        self.store.get_batch(batch_id)?;
        self.store.run_status_counts(batch_id)
    }

    pub fn batch_summary(&self, batch_id: &str) -> SimResult<BatchSummary> {
        Ok(BatchSummary {
            batch: self.store.get_batch(batch_id)?,
            counts: self.store.run_status_counts(batch_id)?,
            aggregates: self.store.aggregates_for_batch(batch_id)?,
        })
    }
}
