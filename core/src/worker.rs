//! Worker: claim runs, execute them, hand the results to the buffer.
//!
//! RULE: A run is executed only by the worker whose claim moved it from
//! Pending to Running. Failures are recorded through the attempt counter;
//! they never escape `handle` as errors unless the store itself fails.

use crate::{
    buffer::ResultBuffer,
    cache::SnapshotCache,
    cancel::CancelFlag,
    config::PipelineConfig,
    distribution::{BatchMessage, Delivery, MessageBroker, WorkerFilter},
    engine::SimEngine,
    error::{SimError, SimResult},
    finalize::BatchFinalizer,
    metrics::{timed, LogPhaseRecorder, LogSimulationMetrics, PhaseRecorder, SimulationMetrics},
    progress::TeamRunResult,
    store::{CompletedRun, RunRow, SimStore},
    types::{RunId, RunStatus},
};
use std::sync::Arc;
use std::time::Duration;

/// What one message turned into.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandleReport {
    /// Addressed to another worker index and dropped unclaimed.
    pub dropped: bool,
    pub claimed: usize,
    pub completed: usize,
    /// Runs that failed and went back to Pending.
    pub retrying: Vec<RunId>,
    /// Runs that failed for good.
    pub failed: usize,
}

pub struct BatchWorker {
    store: SimStore,
    cache: Arc<SnapshotCache>,
    buffer: Arc<ResultBuffer>,
    finalizer: BatchFinalizer,
    filter: WorkerFilter,
    max_run_attempts: u32,
    cancel: CancelFlag,
    metrics: Arc<dyn SimulationMetrics>,
    phases: Arc<dyn PhaseRecorder>,
}

impl BatchWorker {
    pub fn new(
        store: SimStore,
        cache: Arc<SnapshotCache>,
        buffer: Arc<ResultBuffer>,
        config: &PipelineConfig,
        cancel: CancelFlag,
    ) -> Self {
        Self {
            finalizer: BatchFinalizer::new(store.clone()),
            store,
            cache,
            buffer,
            filter: WorkerFilter::new(config.worker_index),
            max_run_attempts: config.max_run_attempts,
            cancel,
            metrics: Arc::new(LogSimulationMetrics::new()),
            phases: Arc::new(LogPhaseRecorder::new()),
        }
    }

    pub fn with_observers(
        mut self,
        metrics: Arc<dyn SimulationMetrics>,
        phases: Arc<dyn PhaseRecorder>,
    ) -> Self {
        self.finalizer = self.finalizer.with_metrics(Arc::clone(&metrics));
        self.metrics = metrics;
        self.phases = phases;
        self
    }

    pub fn handle(&self, message: &BatchMessage) -> SimResult<HandleReport> {
        let mut report = HandleReport::default();
        if !self.filter.accepts(message) {
            log::warn!(
                "dropping message for worker {:?} ({} runs)",
                message.worker_index,
                message.run_ids.len()
            );
            report.dropped = true;
            return Ok(report);
        }

        let claimed = timed(self.phases.as_ref(), "claim", message.run_ids.len() as u64, || {
            self.store.claim_runs(&message.run_ids)
        })?;
        report.claimed = claimed.len();
        log::debug!("claimed {} of {} runs", claimed.len(), message.run_ids.len());

        for (i, run) in claimed.iter().enumerate() {
            if self.cancel.is_cancelled() {
                self.release(&claimed[i..])?;
                return Err(SimError::Cancelled);
            }
            match self.execute(run) {
                Ok(results) => {
                    self.buffer.add(CompletedRun {
                        run_id: run.id.clone(),
                        batch_id: run.batch_id.clone(),
                        is_retry: run.is_retry(),
                        results,
                    })?;
                    self.metrics.run_completed(&run.batch_id);
                    report.completed += 1;
                }
                Err(SimError::Cancelled) => {
                    self.release(&claimed[i..])?;
                    return Err(SimError::Cancelled);
                }
                Err(e) => self.record_failure(run, &e, &mut report)?,
            }
        }
        Ok(report)
    }

    fn execute(&self, run: &RunRow) -> SimResult<Vec<TeamRunResult>> {
        let snapshot = self.cache.get_or_load(&self.store, &run.batch_id)?;
        timed(self.phases.as_ref(), "execute", 1, || {
            SimEngine::execute_snapshot(&snapshot, &run.seed, &self.cancel)
        })
    }

    fn record_failure(&self, run: &RunRow, error: &SimError, report: &mut HandleReport) -> SimResult<()> {
        let permanent = error.is_permanent();
        let status = self.store.record_run_failure(
            &run.id,
            &error.to_string(),
            self.max_run_attempts,
            permanent,
        )?;
        log::warn!(
            "run {} (batch {}) attempt {} failed: {error}",
            run.id,
            run.batch_id,
            run.attempt_count + 1
        );
        if status == RunStatus::Pending {
            self.metrics.run_retried(&run.batch_id);
            report.retrying.push(run.id.clone());
        } else {
            self.metrics.run_failed(&run.batch_id, status == RunStatus::Failed);
            report.failed += 1;
            // The failed run may have been the batch's last open run.
            self.finalizer.try_finalize(&run.batch_id)?;
        }
        Ok(())
    }

    fn release(&self, runs: &[RunRow]) -> SimResult<()> {
        let ids: Vec<RunId> = runs.iter().map(|r| r.id.clone()).collect();
        let released = self.store.release_runs(&ids)?;
        log::info!("cancelled: released {released} claimed runs");
        Ok(())
    }
}

// ── Distributed loop ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub messages: u64,
    pub dropped: u64,
    pub runs_completed: u64,
    pub runs_failed: u64,
}

/// Lease messages from the broker until cancelled, or until the broker
/// comes back empty when `drain` is set. Leased messages are processed
/// concurrently, at most `max_in_flight` at a time.
pub fn run_distributed_worker(
    worker: &BatchWorker,
    broker: &dyn MessageBroker,
    max_in_flight: u32,
    poll_interval: Duration,
    drain: bool,
    cancel: &CancelFlag,
) -> SimResult<WorkerStats> {
    let mut stats = WorkerStats::default();
    while !cancel.is_cancelled() {
        let deliveries = broker.receive(max_in_flight.max(1))?;
        if deliveries.is_empty() {
            if drain || !cancel.sleep(poll_interval) {
                break;
            }
            continue;
        }

        let outcomes: Vec<(Delivery, SimResult<HandleReport>)> = std::thread::scope(|s| {
            let handles: Vec<_> = deliveries
                .into_iter()
                .map(|d| s.spawn(move || {
                    let outcome = worker.handle(&d.message);
                    (d, outcome)
                }))
                .collect();
            handles
                .into_iter()
                .filter_map(|h| h.join().ok())
                .collect()
        });

        for (delivery, outcome) in outcomes {
            stats.messages += 1;
            match outcome {
                Ok(report) => {
                    stats.runs_completed += report.completed as u64;
                    stats.runs_failed += report.failed as u64;
                    if report.dropped {
                        stats.dropped += 1;
                    }
                    if report.retrying.is_empty() {
                        broker.ack(&delivery)?;
                    } else {
                        broker.nack(&delivery)?;
                    }
                }
                Err(e) => {
                    if !matches!(e, SimError::Cancelled) {
                        log::warn!("message {} failed: {e}", delivery.id);
                    }
                    broker.nack(&delivery)?;
                }
            }
        }
    }
    Ok(stats)
}
