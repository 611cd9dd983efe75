//! Per-run, per-team progress tracking.
//!
//! RULE: TeamProgress owns its collections. Callers mutate it only through
//! `apply_grant`, which keeps the row-unlock invariant:
//!   - row 0 is unlocked at t=0
//!   - row N>0 unlocks once completed points in row N-1 reach the threshold
//!   - a row's unlock time is recorded once, the first time it is reachable

use crate::{
    snapshot::{EventSnapshot, TeamSnapshot, TileSnapshot},
    strategy::TileCandidate,
    types::SimSeconds,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Summary of one team's run. This is the only part of a run that persists.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TeamRunResult {
    pub team_id: String,
    pub team_name: String,
    pub total_points: u32,
    pub tiles_completed: u32,
    pub row_reached: u32,
    pub is_winner: bool,
    /// Row index → first unlock, in simulated seconds.
    pub row_unlock_times: BTreeMap<u32, SimSeconds>,
    /// Tile key → completion, in simulated seconds.
    pub tile_completion_times: BTreeMap<String, SimSeconds>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrantApplied {
    pub tile_completed: bool,
    pub rows_unlocked: Vec<u32>,
}

#[derive(Debug, Clone)]
pub struct TeamProgress {
    unlock_points_required: u32,
    tile_progress: BTreeMap<String, u32>,
    completed: BTreeSet<String>,
    row_points: Vec<u32>,
    row_unlock_times: BTreeMap<u32, SimSeconds>,
    tile_completion_times: BTreeMap<String, SimSeconds>,
    total_points: u32,
}

impl TeamProgress {
    pub fn new(snapshot: &EventSnapshot) -> Self {
        let mut progress = Self {
            unlock_points_required: snapshot.unlock_points_required_per_row,
            tile_progress: BTreeMap::new(),
            completed: BTreeSet::new(),
            row_points: vec![0; snapshot.rows.len()],
            row_unlock_times: BTreeMap::new(),
            tile_completion_times: BTreeMap::new(),
            total_points: 0,
        };
        if !snapshot.rows.is_empty() {
            progress.row_unlock_times.insert(0, 0);
            progress.recompute_unlocks(0);
        }
        progress
    }

    pub fn is_row_unlocked(&self, row_index: u32) -> bool {
        self.row_unlock_times.contains_key(&row_index)
    }

    pub fn is_completed(&self, tile_key: &str) -> bool {
        self.completed.contains(tile_key)
    }

    pub fn progress_of(&self, tile_key: &str) -> u32 {
        self.tile_progress.get(tile_key).copied().unwrap_or(0)
    }

    pub fn total_points(&self) -> u32 {
        self.total_points
    }

    pub fn row_unlock_time(&self, row_index: u32) -> Option<SimSeconds> {
        self.row_unlock_times.get(&row_index).copied()
    }

    pub fn highest_unlocked_row(&self) -> u32 {
        self.row_unlock_times.keys().next_back().copied().unwrap_or(0)
    }

    /// Unlocked tiles that are not yet complete, in snapshot order.
    pub fn open_tiles<'a>(&self, snapshot: &'a EventSnapshot) -> Vec<TileCandidate<'a>> {
        snapshot
            .rows
            .iter()
            .filter(|row| self.is_row_unlocked(row.index))
            .flat_map(|row| {
                row.tiles.iter().map(move |tile| TileCandidate {
                    row_index: row.index,
                    tile,
                })
            })
            .filter(|c| !self.is_completed(&c.tile.key))
            .collect()
    }

    /// Open tiles that accept `drop_key`.
    pub fn eligible_tiles<'a>(
        &self,
        snapshot: &'a EventSnapshot,
        drop_key: &str,
    ) -> Vec<TileCandidate<'a>> {
        self.open_tiles(snapshot)
            .into_iter()
            .filter(|c| c.tile.accepts_drop_key(drop_key))
            .collect()
    }

    /// Add `units` to a tile. Completing it records the time and may unlock rows.
    pub fn apply_grant(
        &mut self,
        row_index: u32,
        tile: &TileSnapshot,
        units: u32,
        now: SimSeconds,
    ) -> GrantApplied {
        let mut applied = GrantApplied {
            tile_completed: false,
            rows_unlocked: Vec::new(),
        };
        if self.is_completed(&tile.key) || !self.is_row_unlocked(row_index) {
            return applied;
        }

        let entry = self.tile_progress.entry(tile.key.clone()).or_insert(0);
        *entry = entry.saturating_add(units).min(tile.required_count);
        if *entry < tile.required_count {
            return applied;
        }

        self.completed.insert(tile.key.clone());
        self.tile_completion_times.entry(tile.key.clone()).or_insert(now);
        if let Some(points) = self.row_points.get_mut(row_index as usize) {
            *points += tile.points;
        }
        self.total_points += tile.points;
        applied.tile_completed = true;
        applied.rows_unlocked = self.recompute_unlocks(now);
        applied
    }

    fn recompute_unlocks(&mut self, now: SimSeconds) -> Vec<u32> {
        let mut unlocked = Vec::new();
        for n in 1..self.row_points.len() as u32 {
            if self.is_row_unlocked(n) {
                continue;
            }
            let previous_open = self.is_row_unlocked(n - 1);
            let previous_points = self.row_points[(n - 1) as usize];
            if previous_open && previous_points >= self.unlock_points_required {
                self.row_unlock_times.insert(n, now);
                unlocked.push(n);
            } else {
                break;
            }
        }
        unlocked
    }

    pub fn summary(&self, team: &TeamSnapshot) -> TeamRunResult {
        TeamRunResult {
            team_id: team.team_id.clone(),
            team_name: team.team_name.clone(),
            total_points: self.total_points,
            tiles_completed: self.completed.len() as u32,
            row_reached: self.highest_unlocked_row(),
            is_winner: false,
            row_unlock_times: self.row_unlock_times.clone(),
            tile_completion_times: self.tile_completion_times.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot_with_threshold(threshold: u32) -> EventSnapshot {
        let mut snapshot = EventSnapshot::default_test();
        snapshot.unlock_points_required_per_row = threshold;
        snapshot
    }

    fn complete(progress: &mut TeamProgress, snapshot: &EventSnapshot, key: &str, now: u64) -> GrantApplied {
        let (row, tile) = snapshot.tile(key).expect("tile exists");
        progress.apply_grant(row.index, tile, tile.required_count, now)
    }

    #[test]
    fn row_zero_starts_unlocked() {
        let snapshot = snapshot_with_threshold(5);
        let progress = TeamProgress::new(&snapshot);
        assert_eq!(progress.row_unlock_time(0), Some(0));
        assert!(!progress.is_row_unlocked(1));
    }

    #[test]
    fn one_and_four_points_unlock_next_row() {
        let snapshot = snapshot_with_threshold(5);
        let mut progress = TeamProgress::new(&snapshot);
        complete(&mut progress, &snapshot, "r0-t1", 100);
        let applied = complete(&mut progress, &snapshot, "r0-t4", 250);
        assert_eq!(applied.rows_unlocked, vec![1]);
        assert_eq!(progress.row_unlock_time(1), Some(250));
    }

    #[test]
    fn one_and_two_points_do_not_unlock() {
        let snapshot = snapshot_with_threshold(5);
        let mut progress = TeamProgress::new(&snapshot);
        complete(&mut progress, &snapshot, "r0-t1", 100);
        let applied = complete(&mut progress, &snapshot, "r0-t2", 200);
        assert!(applied.tile_completed);
        assert!(applied.rows_unlocked.is_empty());
        assert!(!progress.is_row_unlocked(1));
        assert_eq!(progress.total_points(), 3);
    }

    #[test]
    fn partial_grants_accumulate_and_cap() {
        let snapshot = snapshot_with_threshold(5);
        let mut progress = TeamProgress::new(&snapshot);
        let (row, tile) = snapshot.tile("r0-t3").unwrap();
        let first = progress.apply_grant(row.index, tile, 1, 10);
        assert!(!first.tile_completed);
        let second = progress.apply_grant(row.index, tile, 50, 20);
        assert!(second.tile_completed);
        assert_eq!(progress.progress_of("r0-t3"), tile.required_count);
        // Completed tiles ignore further grants.
        let third = progress.apply_grant(row.index, tile, 1, 30);
        assert!(!third.tile_completed);
        assert_eq!(progress.summary(&snapshot.teams[0]).tile_completion_times["r0-t3"], 20);
    }

    #[test]
    fn locked_rows_do_not_accept_progress() {
        let snapshot = snapshot_with_threshold(5);
        let mut progress = TeamProgress::new(&snapshot);
        let applied = complete(&mut progress, &snapshot, "r1-t4", 10);
        assert!(!applied.tile_completed);
        assert_eq!(progress.total_points(), 0);
    }

    #[test]
    fn zero_threshold_unlocks_every_row_at_start() {
        let snapshot = snapshot_with_threshold(0);
        let progress = TeamProgress::new(&snapshot);
        for row in &snapshot.rows {
            assert_eq!(progress.row_unlock_time(row.index), Some(0));
        }
    }
}
