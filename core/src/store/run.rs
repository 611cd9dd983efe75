//! Run lifecycle queries: claim, failure accounting, status counts.

use super::{now_rfc3339, SimStore};
use crate::{
    error::{SimError, SimResult},
    types::{BatchId, RunId, RunStatus},
};
use rusqlite::{params, OptionalExtension, Row, TransactionBehavior};

#[derive(Debug, Clone)]
pub struct NewRun {
    pub id: RunId,
    pub run_index: u32,
    pub seed: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunRow {
    pub id: RunId,
    pub batch_id: BatchId,
    pub run_index: u32,
    pub seed: String,
    pub status: RunStatus,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

impl RunRow {
    /// A run that failed before has results that must be overwritten.
    pub fn is_retry(&self) -> bool {
        self.attempt_count > 0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStatusCounts {
    pub pending: u32,
    pub running: u32,
    pub completed: u32,
    pub failed: u32,
}

impl RunStatusCounts {
    pub fn total(&self) -> u32 {
        self.pending + self.running + self.completed + self.failed
    }

    pub fn all_terminal(&self) -> bool {
        self.pending == 0 && self.running == 0
    }
}

const RUN_COLUMNS: &str = "id, batch_id, run_index, seed, status, attempt_count,
                           last_error, started_at, completed_at";

fn run_from_row(r: &Row<'_>) -> rusqlite::Result<RunRow> {
    Ok(RunRow {
        id: r.get(0)?,
        batch_id: r.get(1)?,
        run_index: r.get(2)?,
        seed: r.get(3)?,
        status: r.get(4)?,
        attempt_count: r.get(5)?,
        last_error: r.get(6)?,
        started_at: r.get(7)?,
        completed_at: r.get(8)?,
    })
}

impl SimStore {
    /// Move every still-pending run among `run_ids` to Running and return
    /// only those. Ids claimed elsewhere, finished, or unknown are skipped.
    pub fn claim_runs(&self, run_ids: &[RunId]) -> SimResult<Vec<RunRow>> {
        let now = now_rfc3339();
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut claimed = Vec::new();
        {
            let mut update = tx.prepare(
                "UPDATE simulation_run SET status = 'running', started_at = ?2
                 WHERE id = ?1 AND status = 'pending'",
            )?;
            let mut select = tx.prepare(&format!(
                "SELECT {RUN_COLUMNS} FROM simulation_run WHERE id = ?1"
            ))?;
            for run_id in run_ids {
                if update.execute(params![run_id, now])? == 1 {
                    claimed.push(select.query_row(params![run_id], run_from_row)?);
                }
            }
        }
        tx.commit()?;
        Ok(claimed)
    }

    /// Count a failed attempt. At `max_attempts` (or immediately when
    /// `permanent`) the run becomes terminal Failed; otherwise it goes back
    /// to Pending. Returns the run's resulting status.
    pub fn record_run_failure(
        &self,
        run_id: &str,
        error: &str,
        max_attempts: u32,
        permanent: bool,
    ) -> SimResult<RunStatus> {
        let now = now_rfc3339();
        let conn = self.conn()?;
        // SET expressions all see the pre-update attempt_count.
        conn.execute(
            "UPDATE simulation_run
             SET attempt_count = attempt_count + 1,
                 last_error    = ?2,
                 status        = CASE WHEN ?4 = 1 OR attempt_count + 1 >= ?3
                                      THEN 'failed' ELSE 'pending' END,
                 completed_at  = CASE WHEN ?4 = 1 OR attempt_count + 1 >= ?3
                                      THEN ?5 ELSE NULL END
             WHERE id = ?1 AND status NOT IN ('completed', 'failed')",
            params![run_id, error, max_attempts, permanent, now],
        )?;
        conn.query_row(
            "SELECT status FROM simulation_run WHERE id = ?1",
            params![run_id],
            |r| r.get(0),
        )
        .optional()?
        .ok_or_else(|| SimError::RunNotFound {
            run_id: run_id.to_string(),
        })
    }

    /// Hand claimed runs back without counting an attempt (shutdown path).
    pub fn release_runs(&self, run_ids: &[RunId]) -> SimResult<usize> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "UPDATE simulation_run SET status = 'pending', started_at = NULL
             WHERE id = ?1 AND status = 'running'",
        )?;
        let mut released = 0;
        for run_id in run_ids {
            released += stmt.execute(params![run_id])?;
        }
        Ok(released)
    }

    pub fn get_run(&self, run_id: &str) -> SimResult<RunRow> {
        self.conn()?
            .query_row(
                &format!("SELECT {RUN_COLUMNS} FROM simulation_run WHERE id = ?1"),
                params![run_id],
                run_from_row,
            )
            .optional()?
            .ok_or_else(|| SimError::RunNotFound {
                run_id: run_id.to_string(),
            })
    }

    pub fn runs_for_batch(&self, batch_id: &str) -> SimResult<Vec<RunRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM simulation_run
             WHERE batch_id = ?1 ORDER BY run_index ASC"
        ))?;
        let rows = stmt
            .query_map(params![batch_id], run_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn run_status_counts(&self, batch_id: &str) -> SimResult<RunStatusCounts> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT status, COUNT(*) FROM simulation_run
             WHERE batch_id = ?1 GROUP BY status",
        )?;
        let rows = stmt.query_map(params![batch_id], |r| {
            Ok((r.get::<_, RunStatus>(0)?, r.get::<_, u32>(1)?))
        })?;
        let mut counts = RunStatusCounts::default();
        for row in rows {
            let (status, n) = row?;
            match status {
                RunStatus::Pending   => counts.pending = n,
                RunStatus::Running   => counts.running = n,
                RunStatus::Completed => counts.completed = n,
                RunStatus::Failed    => counts.failed = n,
            }
        }
        Ok(counts)
    }
}
