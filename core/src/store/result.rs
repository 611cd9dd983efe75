//! Team run result persistence.

use super::{now_rfc3339, SimStore};
use crate::{
    error::SimResult,
    progress::TeamRunResult,
    types::{BatchId, RunId},
};
use rusqlite::{params, TransactionBehavior};

/// One finished run waiting in the result buffer.
#[derive(Debug, Clone)]
pub struct CompletedRun {
    pub run_id: RunId,
    pub batch_id: BatchId,
    /// Earlier attempts may have left rows behind.
    pub is_retry: bool,
    pub results: Vec<TeamRunResult>,
}

impl SimStore {
    /// Results and Completed status land together or not at all.
    pub fn persist_results(&self, runs: &[CompletedRun]) -> SimResult<()> {
        if runs.is_empty() {
            return Ok(());
        }
        let now = now_rfc3339();
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        {
            let mut delete = tx.prepare("DELETE FROM team_run_result WHERE run_id = ?1")?;
            for run in runs.iter().filter(|r| r.is_retry) {
                delete.execute(params![run.run_id])?;
            }

            let mut insert = tx.prepare(
                "INSERT INTO team_run_result
                    (run_id, team_id, team_name, total_points, tiles_completed,
                     row_reached, is_winner, row_unlock_times_json, tile_completion_times_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )?;
            for run in runs {
                for team in &run.results {
                    insert.execute(params![
                        run.run_id,
                        team.team_id,
                        team.team_name,
                        team.total_points,
                        team.tiles_completed,
                        team.row_reached,
                        team.is_winner,
                        serde_json::to_string(&team.row_unlock_times)?,
                        serde_json::to_string(&team.tile_completion_times)?,
                    ])?;
                }
            }

            let mut complete = tx.prepare(
                "UPDATE simulation_run SET status = 'completed', completed_at = ?2
                 WHERE id = ?1",
            )?;
            for run in runs {
                complete.execute(params![run.run_id, now])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Every stored result of a batch as (run id, team result), in run order.
    pub fn results_for_batch(&self, batch_id: &str) -> SimResult<Vec<(RunId, TeamRunResult)>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT r.run_id, r.team_id, r.team_name, r.total_points, r.tiles_completed,
                    r.row_reached, r.is_winner, r.row_unlock_times_json,
                    r.tile_completion_times_json
             FROM team_run_result r
             JOIN simulation_run s ON s.id = r.run_id
             WHERE s.batch_id = ?1
             ORDER BY s.run_index ASC, r.id ASC",
        )?;
        let rows = stmt.query_map(params![batch_id], |r| {
            Ok((
                r.get::<_, RunId>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, u32>(3)?,
                r.get::<_, u32>(4)?,
                r.get::<_, u32>(5)?,
                r.get::<_, bool>(6)?,
                r.get::<_, String>(7)?,
                r.get::<_, String>(8)?,
            ))
        })?;
        let mut result = Vec::new();
        for row in rows {
            let (run_id, team_id, team_name, points, tiles, row_reached, winner, unlocks, completions) =
                row?;
            result.push((
                run_id,
                TeamRunResult {
                    team_id,
                    team_name,
                    total_points: points,
                    tiles_completed: tiles,
                    row_reached,
                    is_winner: winner,
                    row_unlock_times: serde_json::from_str(&unlocks)?,
                    tile_completion_times: serde_json::from_str(&completions)?,
                },
            ));
        }
        Ok(result)
    }

    pub fn results_for_run(&self, run_id: &str) -> SimResult<Vec<TeamRunResult>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT team_id, team_name, total_points, tiles_completed, row_reached,
                    is_winner, row_unlock_times_json, tile_completion_times_json
             FROM team_run_result WHERE run_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![run_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, u32>(2)?,
                r.get::<_, u32>(3)?,
                r.get::<_, u32>(4)?,
                r.get::<_, bool>(5)?,
                r.get::<_, String>(6)?,
                r.get::<_, String>(7)?,
            ))
        })?;
        let mut result = Vec::new();
        for row in rows {
            let (team_id, team_name, points, tiles, row_reached, winner, unlocks, completions) = row?;
            result.push(TeamRunResult {
                team_id,
                team_name,
                total_points: points,
                tiles_completed: tiles,
                row_reached,
                is_winner: winner,
                row_unlock_times: serde_json::from_str(&unlocks)?,
                tile_completion_times: serde_json::from_str(&completions)?,
            });
        }
        Ok(result)
    }
}
