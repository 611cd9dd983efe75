//! Batch finalization.
//!
//! RULE: The batch status transition is the only decision point. The
//! aggregates commit in the same transaction as the winning status change;
//! every other caller returns `false` and does nothing else. Safe to call
//! from every flush, every worker and the periodic scanner.

use crate::{
    cancel::CancelFlag,
    error::SimResult,
    metrics::{LogSimulationMetrics, SimulationMetrics},
    progress::TeamRunResult,
    store::{SimStore, TeamAggregate},
    types::{BatchStatus, RunId},
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

#[derive(Clone)]
pub struct BatchFinalizer {
    store: SimStore,
    metrics: Arc<dyn SimulationMetrics>,
}

impl BatchFinalizer {
    pub fn new(store: SimStore) -> Self {
        Self {
            store,
            metrics: Arc::new(LogSimulationMetrics::new()),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn SimulationMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// `Ok(true)` only for the caller that moved the batch to a terminal
    /// status. Runs still pending or running mean "not yet".
    pub fn try_finalize(&self, batch_id: &str) -> SimResult<bool> {
        let counts = self.store.run_status_counts(batch_id)?;
        if !counts.all_terminal() {
            return Ok(false);
        }

        let (status, message) = if counts.failed > 0 {
            (
                BatchStatus::Error,
                Some(format!(
                    "{} of {} runs failed permanently",
                    counts.failed,
                    counts.total()
                )),
            )
        } else {
            (BatchStatus::Completed, None)
        };
        // Aggregates are computed first so the status change and their
        // write commit together.
        let results = self.store.results_for_batch(batch_id)?;
        let aggregates = compute_aggregates(&results);
        if !self
            .store
            .finalize_batch(batch_id, status, message.as_deref(), &aggregates)?
        {
            return Ok(false);
        }

        let batch = self.store.get_batch(batch_id)?;
        let elapsed = batch_elapsed(&batch.created_at, batch.completed_at.as_deref());
        self.metrics.batch_finished(batch_id, elapsed);
        log::info!(
            "batch {batch_id} finalized as {} ({} completed, {} failed)",
            status.as_str(),
            counts.completed,
            counts.failed
        );
        Ok(true)
    }
}

fn batch_elapsed(created_at: &str, completed_at: Option<&str>) -> Duration {
    let parse = |s: &str| chrono::DateTime::parse_from_rfc3339(s).ok();
    match (parse(created_at), completed_at.and_then(parse)) {
        (Some(start), Some(end)) => (end - start).to_std().unwrap_or_default(),
        _ => Duration::ZERO,
    }
}

/// Per-team statistics in first-seen team order.
pub fn compute_aggregates(results: &[(RunId, TeamRunResult)]) -> Vec<TeamAggregate> {
    #[derive(Default)]
    struct Acc {
        name: String,
        points: Vec<u32>,
        tiles: Vec<u32>,
        rows: Vec<u32>,
        wins: u32,
    }

    let mut order: Vec<String> = Vec::new();
    let mut by_team: BTreeMap<String, Acc> = BTreeMap::new();
    for (_, r) in results {
        let acc = by_team.entry(r.team_id.clone()).or_insert_with(|| {
            order.push(r.team_id.clone());
            Acc {
                name: r.team_name.clone(),
                ..Acc::default()
            }
        });
        acc.points.push(r.total_points);
        acc.tiles.push(r.tiles_completed);
        acc.rows.push(r.row_reached);
        if r.is_winner {
            acc.wins += 1;
        }
    }

    fn mean(values: &[u32]) -> f64 {
        if values.is_empty() {
            0.0
        } else {
            values.iter().map(|&v| v as f64).sum::<f64>() / values.len() as f64
        }
    }
    let min = |v: &[u32]| v.iter().copied().min().unwrap_or(0);
    let max = |v: &[u32]| v.iter().copied().max().unwrap_or(0);

    order
        .iter()
        .filter_map(|team_id| {
            let acc = by_team.get(team_id)?;
            let runs = acc.points.len() as u32;
            Some(TeamAggregate {
                team_id: team_id.clone(),
                team_name: acc.name.clone(),
                mean_points: mean(&acc.points),
                min_points: min(&acc.points),
                max_points: max(&acc.points),
                mean_tiles: mean(&acc.tiles),
                min_tiles: min(&acc.tiles),
                max_tiles: max(&acc.tiles),
                mean_row_reached: mean(&acc.rows),
                min_row_reached: min(&acc.rows),
                max_row_reached: max(&acc.rows),
                win_rate: if runs == 0 { 0.0 } else { acc.wins as f64 / runs as f64 },
                run_count: runs,
            })
        })
        .collect()
}

// ── Scanner ────────────────────────────────────────────────────

/// Periodically offers every non-terminal batch to the finalizer. Catches
/// batches whose last run failed permanently instead of completing.
pub struct FinalizerScanner {
    finalizer: BatchFinalizer,
    store: SimStore,
    interval: Duration,
}

impl FinalizerScanner {
    pub fn new(store: SimStore, finalizer: BatchFinalizer, interval: Duration) -> Self {
        Self {
            finalizer,
            store,
            interval,
        }
    }

    /// One pass. Returns how many batches this pass finalized.
    pub fn scan_once(&self) -> SimResult<usize> {
        let mut finalized = 0;
        for batch_id in self.store.non_terminal_batches()? {
            if self.finalizer.try_finalize(&batch_id)? {
                finalized += 1;
            }
        }
        Ok(finalized)
    }

    /// Scan until cancelled. Errors are logged and the loop keeps going.
    pub fn run(&self, cancel: &CancelFlag) {
        while cancel.sleep(self.interval) {
            match self.scan_once() {
                Ok(0) => {}
                Ok(n) => log::debug!("finalizer scanner closed {n} batches"),
                Err(e) => log::warn!("finalizer scan failed: {e}"),
            }
        }
    }

    pub fn spawn(self, cancel: CancelFlag) -> JoinHandle<()> {
        std::thread::spawn(move || self.run(&cancel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(team: &str, points: u32, winner: bool) -> TeamRunResult {
        TeamRunResult {
            team_id: team.into(),
            team_name: team.to_uppercase(),
            total_points: points,
            tiles_completed: points / 2,
            row_reached: 1,
            is_winner: winner,
            row_unlock_times: BTreeMap::new(),
            tile_completion_times: BTreeMap::new(),
        }
    }

    #[test]
    fn aggregates_cover_each_team() {
        let results = vec![
            ("r0".to_string(), result("b", 10, true)),
            ("r0".to_string(), result("a", 4, false)),
            ("r1".to_string(), result("b", 2, false)),
            ("r1".to_string(), result("a", 8, true)),
        ];
        let aggregates = compute_aggregates(&results);
        assert_eq!(aggregates.len(), 2);
        assert_eq!(aggregates[0].team_id, "b");
        assert_eq!(aggregates[0].mean_points, 6.0);
        assert_eq!(aggregates[0].min_points, 2);
        assert_eq!(aggregates[0].max_points, 10);
        assert_eq!(aggregates[0].win_rate, 0.5);
        assert_eq!(aggregates[1].run_count, 2);
    }
}
