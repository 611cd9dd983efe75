//! Observability collaborators.
//!
//! RULE: Recording never fails and never blocks on I/O. Callers fire and
//! forget; implementations aggregate in memory and log through `log`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Timing of named pipeline phases (claim, execute, flush, finalize, ...).
pub trait PhaseRecorder: Send + Sync {
    fn record(&self, phase: &str, elapsed: Duration, count: u64);
}

/// Run and batch counters.
pub trait SimulationMetrics: Send + Sync {
    fn run_completed(&self, batch_id: &str);
    fn run_failed(&self, batch_id: &str, permanent: bool);
    fn run_retried(&self, batch_id: &str);
    fn batch_finished(&self, batch_id: &str, elapsed: Duration);
}

/// Times a closure and records it under `phase`.
pub fn timed<T>(recorder: &dyn PhaseRecorder, phase: &str, count: u64, f: impl FnOnce() -> T) -> T {
    let started = Instant::now();
    let out = f();
    recorder.record(phase, started.elapsed(), count);
    out
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PhaseTotals {
    pub calls: u64,
    pub items: u64,
    pub total_ms: u64,
}

#[derive(Debug, Default)]
pub struct LogPhaseRecorder {
    totals: Mutex<BTreeMap<String, PhaseTotals>>,
}

impl LogPhaseRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn totals(&self) -> BTreeMap<String, PhaseTotals> {
        self.totals.lock().map(|t| t.clone()).unwrap_or_default()
    }
}

impl PhaseRecorder for LogPhaseRecorder {
    fn record(&self, phase: &str, elapsed: Duration, count: u64) {
        let ms = elapsed.as_millis() as u64;
        log::debug!("phase={phase} elapsed_ms={ms} count={count}");
        if let Ok(mut totals) = self.totals.lock() {
            let entry = totals.entry(phase.to_string()).or_default();
            entry.calls += 1;
            entry.items += count;
            entry.total_ms += ms;
        }
    }
}

#[derive(Debug, Default)]
pub struct LogSimulationMetrics {
    completed: AtomicU64,
    failed: AtomicU64,
    failed_permanently: AtomicU64,
    retried: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub completed: u64,
    pub failed: u64,
    pub failed_permanently: u64,
    pub retried: u64,
}

impl LogSimulationMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            failed_permanently: self.failed_permanently.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
        }
    }
}

impl SimulationMetrics for LogSimulationMetrics {
    fn run_completed(&self, _batch_id: &str) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    fn run_failed(&self, batch_id: &str, permanent: bool) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        if permanent {
            self.failed_permanently.fetch_add(1, Ordering::Relaxed);
            log::warn!("batch {batch_id}: run failed permanently");
        }
    }

    fn run_retried(&self, _batch_id: &str) {
        self.retried.fetch_add(1, Ordering::Relaxed);
    }

    fn batch_finished(&self, batch_id: &str, elapsed: Duration) {
        log::info!(
            "batch {batch_id} finished in {:.1}s (completed={} failed={} retried={})",
            elapsed.as_secs_f64(),
            self.completed.load(Ordering::Relaxed),
            self.failed.load(Ordering::Relaxed),
            self.retried.load(Ordering::Relaxed),
        );
    }
}
