//! Batch, snapshot and aggregate queries.

use super::{now_rfc3339, run::NewRun, SimStore};
use crate::{
    error::{SimError, SimResult},
    types::{BatchId, BatchStatus, ExecutionMode},
};
use rusqlite::{params, OptionalExtension, TransactionBehavior};

#[derive(Debug, Clone)]
pub struct NewBatch {
    pub id: BatchId,
    pub event_id: String,
    pub run_count: u32,
    pub seed: String,
    pub execution_mode: ExecutionMode,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchRow {
    pub id: BatchId,
    pub event_id: String,
    pub run_count: u32,
    pub seed: String,
    pub execution_mode: ExecutionMode,
    pub status: BatchStatus,
    pub error_message: Option<String>,
    pub created_at: String,
    pub completed_at: Option<String>,
}

/// Per-team statistics over every completed run of a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct TeamAggregate {
    pub team_id: String,
    pub team_name: String,
    pub mean_points: f64,
    pub min_points: u32,
    pub max_points: u32,
    pub mean_tiles: f64,
    pub min_tiles: u32,
    pub max_tiles: u32,
    pub mean_row_reached: f64,
    pub min_row_reached: u32,
    pub max_row_reached: u32,
    pub win_rate: f64,
    pub run_count: u32,
}

impl SimStore {
    // ── Batch ──────────────────────────────────────────────────

    /// Batch row, frozen snapshot and every run row, in one transaction.
    pub fn create_batch(
        &self,
        batch: &NewBatch,
        snapshot_json: &str,
        runs: &[NewRun],
    ) -> SimResult<()> {
        let now = now_rfc3339();
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT INTO simulation_batch
                (id, event_id, run_count, seed, execution_mode, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                batch.id,
                batch.event_id,
                batch.run_count,
                batch.seed,
                batch.execution_mode,
                BatchStatus::Pending,
                now,
            ],
        )?;
        tx.execute(
            "INSERT INTO event_snapshot (id, batch_id, config_json, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![uuid::Uuid::new_v4().to_string(), batch.id, snapshot_json, now],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO simulation_run
                    (id, batch_id, run_index, seed, status, attempt_count, created_at)
                 VALUES (?1, ?2, ?3, ?4, 'pending', 0, ?5)",
            )?;
            for run in runs {
                stmt.execute(params![run.id, batch.id, run.run_index, run.seed, now])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_batch(&self, batch_id: &str) -> SimResult<BatchRow> {
        self.conn()?
            .query_row(
                "SELECT id, event_id, run_count, seed, execution_mode, status,
                        error_message, created_at, completed_at
                 FROM simulation_batch WHERE id = ?1",
                params![batch_id],
                |r| {
                    Ok(BatchRow {
                        id: r.get(0)?,
                        event_id: r.get(1)?,
                        run_count: r.get(2)?,
                        seed: r.get(3)?,
                        execution_mode: r.get(4)?,
                        status: r.get(5)?,
                        error_message: r.get(6)?,
                        created_at: r.get(7)?,
                        completed_at: r.get(8)?,
                    })
                },
            )
            .optional()?
            .ok_or_else(|| SimError::BatchNotFound {
                batch_id: batch_id.to_string(),
            })
    }

    /// Pending → Running. Returns false when the batch already moved on.
    pub fn mark_batch_running(&self, batch_id: &str) -> SimResult<bool> {
        let changed = self.conn()?.execute(
            "UPDATE simulation_batch SET status = 'running'
             WHERE id = ?1 AND status = 'pending'",
            params![batch_id],
        )?;
        Ok(changed == 1)
    }

    /// Close a non-terminal batch and store its aggregates in one
    /// transaction. Exactly one concurrent caller sees `true`; everyone
    /// else finds the batch already terminal. On error nothing changes and
    /// the batch stays open for the next attempt.
    pub fn finalize_batch(
        &self,
        batch_id: &str,
        to: BatchStatus,
        error_message: Option<&str>,
        aggregates: &[TeamAggregate],
    ) -> SimResult<bool> {
        let completed_at = now_rfc3339();
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let changed = tx.execute(
            "UPDATE simulation_batch
             SET status = ?2, error_message = ?3, completed_at = ?4
             WHERE id = ?1 AND status IN ('pending', 'running')",
            params![batch_id, to, error_message, completed_at],
        )?;
        if changed == 0 {
            return Ok(false);
        }

        tx.execute(
            "DELETE FROM batch_team_aggregate WHERE batch_id = ?1",
            params![batch_id],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO batch_team_aggregate
                    (batch_id, team_id, team_name,
                     mean_points, min_points, max_points,
                     mean_tiles, min_tiles, max_tiles,
                     mean_row_reached, min_row_reached, max_row_reached,
                     win_rate, run_count)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            )?;
            for a in aggregates {
                stmt.execute(params![
                    batch_id,
                    a.team_id,
                    a.team_name,
                    a.mean_points,
                    a.min_points,
                    a.max_points,
                    a.mean_tiles,
                    a.min_tiles,
                    a.max_tiles,
                    a.mean_row_reached,
                    a.min_row_reached,
                    a.max_row_reached,
                    a.win_rate,
                    a.run_count,
                ])?;
            }
        }
        tx.commit()?;
        Ok(true)
    }

    /// Ids of every batch not yet completed or errored, oldest first.
    pub fn non_terminal_batches(&self) -> SimResult<Vec<BatchId>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id FROM simulation_batch
             WHERE status IN ('pending', 'running')
             ORDER BY created_at ASC, id ASC",
        )?;
        let ids = stmt
            .query_map([], |r| r.get(0))?
            .collect::<Result<Vec<BatchId>, _>>()?;
        Ok(ids)
    }

    // ── Snapshot ───────────────────────────────────────────────

    pub fn load_snapshot_json(&self, batch_id: &str) -> SimResult<String> {
        self.conn()?
            .query_row(
                "SELECT config_json FROM event_snapshot WHERE batch_id = ?1",
                params![batch_id],
                |r| r.get(0),
            )
            .optional()?
            .ok_or_else(|| SimError::SnapshotNotFound {
                batch_id: batch_id.to_string(),
            })
    }

    // ── Aggregates ─────────────────────────────────────────────

    pub fn aggregates_for_batch(&self, batch_id: &str) -> SimResult<Vec<TeamAggregate>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT team_id, team_name,
                    mean_points, min_points, max_points,
                    mean_tiles, min_tiles, max_tiles,
                    mean_row_reached, min_row_reached, max_row_reached,
                    win_rate, run_count
             FROM batch_team_aggregate WHERE batch_id = ?1
             ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![batch_id], |r| {
            Ok(TeamAggregate {
                team_id: r.get(0)?,
                team_name: r.get(1)?,
                mean_points: r.get(2)?,
                min_points: r.get(3)?,
                max_points: r.get(4)?,
                mean_tiles: r.get(5)?,
                min_tiles: r.get(6)?,
                max_tiles: r.get(7)?,
                mean_row_reached: r.get(8)?,
                min_row_reached: r.get(9)?,
                max_row_reached: r.get(10)?,
                win_rate: r.get(11)?,
                run_count: r.get(12)?,
            })
        })?;
        let mut result = Vec::new();
        for r in rows {
            result.push(r?);
        }
        Ok(result)
    }
}
