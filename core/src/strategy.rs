//! Team strategy trait and the built-in policies.
//!
//! RULE: Every team strategy implements TeamStrategy.
//! A strategy only chooses; it never mutates progress. The engine asks it
//! (i) which eligible tile absorbs a progress grant and (ii) which task an
//! idle player should start next. Both answers must be deterministic for
//! identical inputs.

use crate::{
    error::{SimError, SimResult},
    snapshot::{ActivitySnapshot, TileActivityRule, TileSnapshot},
    types::EntityId,
};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// A tile the strategy may choose, with the fields ordering depends on.
#[derive(Debug, Clone, Copy)]
pub struct TileCandidate<'a> {
    pub row_index: u32,
    pub tile: &'a TileSnapshot,
}

impl TileCandidate<'_> {
    pub fn key(&self) -> &str {
        &self.tile.key
    }

    pub fn points(&self) -> u32 {
        self.tile.points
    }
}

/// `'c` borrows the caller's scratch data, `'a` the snapshot.
pub struct GrantContext<'c, 'a> {
    pub drop_key: &'c str,
    pub units: u32,
    /// Unlocked, incomplete tiles that accept `drop_key`.
    pub eligible: &'c [TileCandidate<'a>],
    pub params: Option<&'c serde_json::Value>,
}

pub struct TaskContext<'c, 'a> {
    /// Unlocked, incomplete tiles, in no particular order.
    pub open_tiles: &'c [TileCandidate<'a>],
    pub activities: &'a BTreeMap<EntityId, ActivitySnapshot>,
    pub capabilities: &'c [String],
    pub params: Option<&'c serde_json::Value>,
}

#[derive(Debug, Clone, Copy)]
pub struct TaskChoice<'a> {
    pub tile_key: &'a str,
    pub activity: &'a ActivitySnapshot,
    pub rule: &'a TileActivityRule,
}

/// The contract every team strategy must fulfill.
pub trait TeamStrategy: Send + Sync {
    /// Stable key as stored on the team.
    fn key(&self) -> &'static str;

    /// Total preference order over tiles; `Less` is preferred.
    fn tile_order(&self, a: &TileCandidate<'_>, b: &TileCandidate<'_>) -> Ordering;

    /// Pick the single tile that absorbs a whole grant.
    /// `None` when nothing is eligible; the grant is dropped.
    fn select_target_tile_for_grant<'a>(&self, ctx: &GrantContext<'_, 'a>) -> Option<&'a str> {
        ctx.eligible
            .iter()
            .min_by(|a, b| self.tile_order(a, b))
            .map(|c| {
                let tile: &'a TileSnapshot = c.tile;
                tile.key.as_str()
            })
    }

    /// First rule, scanning tiles in preference order, whose requirements the
    /// player meets and whose activity has at least one attempt.
    fn select_task_for_player<'a>(&self, ctx: &TaskContext<'_, 'a>) -> Option<TaskChoice<'a>> {
        let mut ordered: Vec<TileCandidate<'a>> = ctx.open_tiles.to_vec();
        ordered.sort_by(|a, b| self.tile_order(a, b));

        for candidate in ordered {
            let tile: &'a TileSnapshot = candidate.tile;
            for rule in &tile.allowed_activities {
                let meets = rule
                    .requirements
                    .iter()
                    .all(|req| ctx.capabilities.iter().any(|c| c == req));
                if !meets {
                    continue;
                }
                let Some(activity) = ctx.activities.get(&rule.activity_definition_id) else {
                    continue;
                };
                if activity.attempts.is_empty() {
                    continue;
                }
                return Some(TaskChoice {
                    tile_key: &tile.key,
                    activity,
                    rule,
                });
            }
        }
        None
    }
}

/// Complete rows in order: lowest row, then cheapest tile.
pub struct RowRush;

impl TeamStrategy for RowRush {
    fn key(&self) -> &'static str { "RowRush" }

    fn tile_order(&self, a: &TileCandidate<'_>, b: &TileCandidate<'_>) -> Ordering {
        a.row_index
            .cmp(&b.row_index)
            .then(a.points().cmp(&b.points()))
            .then_with(|| a.key().cmp(b.key()))
    }
}

/// Maximize points: most valuable tile first, earliest row on ties.
pub struct GreedyPoints;

impl TeamStrategy for GreedyPoints {
    fn key(&self) -> &'static str { "GreedyPoints" }

    fn tile_order(&self, a: &TileCandidate<'_>, b: &TileCandidate<'_>) -> Ordering {
        b.points()
            .cmp(&a.points())
            .then(a.row_index.cmp(&b.row_index))
            .then_with(|| a.key().cmp(b.key()))
    }
}

static ROW_RUSH: RowRush = RowRush;
static GREEDY_POINTS: GreedyPoints = GreedyPoints;

/// Resolve a stored strategy key. Unknown keys are a configuration error.
pub fn strategy_for_key(key: &str) -> SimResult<&'static dyn TeamStrategy> {
    match key.trim().to_ascii_lowercase().as_str() {
        "rowrush" => Ok(&ROW_RUSH),
        "greedypoints" => Ok(&GREEDY_POINTS),
        other => Err(SimError::invalid(format!("unknown strategy key '{other}'"))),
    }
}
