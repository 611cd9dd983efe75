//! Snapshot serialization. The frozen event configuration, to and from JSON.
//!
//! A snapshot is assembled once per batch, persisted verbatim, and replayed
//! by every run of the batch. It is plain data: the engine never mutates it.
//!
//! RULE: Every path that produces an `EventSnapshot` from stored bytes goes
//! through `from_json`, which re-validates. Collections are always present;
//! an empty list is the "no data" encoding, `null` is rejected.

use crate::{
    error::{SimError, SimResult},
    strategy::strategy_for_key,
    types::{EntityId, SimSeconds},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

pub const TILES_PER_ROW: usize = 4;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct EventSnapshot {
    pub event_id: EntityId,
    pub event_name: String,
    pub duration_seconds: SimSeconds,
    /// RFC 3339; validated on load.
    pub event_start_time_utc: Option<String>,
    pub unlock_points_required_per_row: u32,
    pub rows: Vec<RowSnapshot>,
    pub activities_by_id: BTreeMap<EntityId, ActivitySnapshot>,
    pub teams: Vec<TeamSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct RowSnapshot {
    pub index: u32,
    pub tiles: Vec<TileSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct TileSnapshot {
    pub key: String,
    pub name: String,
    pub points: u32,
    pub required_count: u32,
    pub allowed_activities: Vec<TileActivityRule>,
}

impl TileSnapshot {
    pub fn accepts_drop_key(&self, drop_key: &str) -> bool {
        self.allowed_activities
            .iter()
            .any(|rule| rule.accepted_drop_keys.iter().any(|k| k == drop_key))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct TileActivityRule {
    pub activity_definition_id: EntityId,
    pub accepted_drop_keys: Vec<String>,
    /// Capability keys the acting player must all hold.
    pub requirements: Vec<String>,
    pub modifiers: Vec<CapabilityModifier>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct CapabilityModifier {
    pub capability_key: String,
    pub time_multiplier: Option<f64>,
    pub probability_multiplier: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct ActivitySnapshot {
    pub id: EntityId,
    pub key: String,
    pub name: String,
    pub mode_support: Option<ModeSupport>,
    pub attempts: Vec<AttemptSnapshot>,
    pub group_scaling_bands: Vec<GroupSizeBand>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct ModeSupport {
    pub supports_solo: bool,
    pub supports_group: bool,
    pub min_group_size: u32,
    pub max_group_size: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RollScope {
    PerPlayer,
    PerGroup,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct AttemptSnapshot {
    pub key: String,
    pub roll_scope: RollScope,
    pub baseline_time_seconds: u32,
    pub variance_seconds: u32,
    pub outcomes: Vec<OutcomeSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct OutcomeSnapshot {
    pub key: String,
    pub weight: u32,
    pub grants: Vec<ProgressGrant>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct ProgressGrant {
    pub drop_key: String,
    pub units: GrantUnits,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "Kind")]
pub enum GrantUnits {
    Fixed {
        #[serde(rename = "Units")]
        units: u32,
    },
    Range {
        #[serde(rename = "Min")]
        min: u32,
        #[serde(rename = "Max")]
        max: u32,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct GroupSizeBand {
    pub min_size: u32,
    pub max_size: u32,
    pub time_multiplier: f64,
    pub probability_multiplier: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct TeamSnapshot {
    pub team_id: EntityId,
    pub team_name: String,
    pub strategy_key: String,
    pub strategy_params: Option<serde_json::Value>,
    pub players: Vec<PlayerSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct PlayerSnapshot {
    pub player_id: EntityId,
    pub name: String,
    pub skill_time_multiplier: f64,
    pub capabilities: Vec<String>,
    pub schedule: Option<WeeklySchedule>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct WeeklySchedule {
    pub sessions: Vec<ScheduledSession>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct ScheduledSession {
    /// 0 = Sunday … 6 = Saturday.
    pub day_of_week: u8,
    pub start_minute_of_day: u32,
    pub duration_minutes: u32,
}

impl EventSnapshot {
    /// Reconstruct from the stored representation. Always validates.
    pub fn from_json(json: &str) -> SimResult<Self> {
        let snapshot: EventSnapshot = serde_json::from_str(json)
            .map_err(|e| SimError::invalid(format!("snapshot JSON is malformed: {e}")))?;
        snapshot.validate()?;
        Ok(snapshot)
    }

    pub fn to_json(&self) -> SimResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn start_time(&self) -> SimResult<DateTime<Utc>> {
        let raw = self
            .event_start_time_utc
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| SimError::invalid("event start time is missing"))?;
        DateTime::parse_from_rfc3339(raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| SimError::invalid(format!("event start time '{raw}' is unparseable: {e}")))
    }

    pub fn tile(&self, key: &str) -> Option<(&RowSnapshot, &TileSnapshot)> {
        self.rows
            .iter()
            .find_map(|row| row.tiles.iter().find(|t| t.key == key).map(|t| (row, t)))
    }

    /// Structural checks run before any simulation work.
    pub fn validate(&self) -> SimResult<()> {
        self.start_time()?;

        if self.teams.is_empty() {
            return Err(SimError::invalid("snapshot has no teams"));
        }
        for team in &self.teams {
            if team.strategy_key.trim().is_empty() {
                return Err(SimError::invalid(format!(
                    "team '{}' has an empty strategy key",
                    team.team_id
                )));
            }
            strategy_for_key(&team.strategy_key)?;
            for player in &team.players {
                if player.schedule.is_none() {
                    return Err(SimError::invalid(format!(
                        "player '{}' on team '{}' has no schedule",
                        player.player_id, team.team_id
                    )));
                }
                if !(player.skill_time_multiplier.is_finite() && player.skill_time_multiplier > 0.0) {
                    return Err(SimError::invalid(format!(
                        "player '{}' has a non-positive skill multiplier",
                        player.player_id
                    )));
                }
            }
        }

        for (id, activity) in &self.activities_by_id {
            validate_activity(id, activity)?;
        }

        let mut seen_keys: HashSet<&str> = HashSet::new();
        for (position, row) in self.rows.iter().enumerate() {
            if row.index as usize != position {
                return Err(SimError::invalid(format!(
                    "row at position {position} has index {}",
                    row.index
                )));
            }
            if row.tiles.len() != TILES_PER_ROW {
                return Err(SimError::invalid(format!(
                    "row {} has {} tiles, expected {TILES_PER_ROW}",
                    row.index,
                    row.tiles.len()
                )));
            }
            let mut points: Vec<u32> = row.tiles.iter().map(|t| t.points).collect();
            points.sort_unstable();
            if points != [1, 2, 3, 4] {
                return Err(SimError::invalid(format!(
                    "row {} tile points are {points:?}, expected [1, 2, 3, 4]",
                    row.index
                )));
            }
            for tile in &row.tiles {
                if !seen_keys.insert(tile.key.as_str()) {
                    return Err(SimError::invalid(format!("duplicate tile key '{}'", tile.key)));
                }
                if tile.required_count == 0 {
                    return Err(SimError::invalid(format!(
                        "tile '{}' has a zero required count",
                        tile.key
                    )));
                }
                if tile.allowed_activities.is_empty() {
                    return Err(SimError::invalid(format!(
                        "tile '{}' has no activity rules",
                        tile.key
                    )));
                }
                for rule in &tile.allowed_activities {
                    if !self.activities_by_id.contains_key(&rule.activity_definition_id) {
                        return Err(SimError::invalid(format!(
                            "tile '{}' references unknown activity '{}'",
                            tile.key, rule.activity_definition_id
                        )));
                    }
                    for modifier in &rule.modifiers {
                        let context = || {
                            format!("modifier '{}' on tile '{}'", modifier.capability_key, tile.key)
                        };
                        if let Some(time) = modifier.time_multiplier {
                            check_time_multiplier(time, context)?;
                        }
                        if let Some(probability) = modifier.probability_multiplier {
                            check_probability_multiplier(probability, context)?;
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

fn validate_activity(id: &str, activity: &ActivitySnapshot) -> SimResult<()> {
    let mode = activity
        .mode_support
        .as_ref()
        .ok_or_else(|| SimError::invalid(format!("activity '{id}' has no mode support")))?;
    if mode.supports_group && mode.min_group_size > mode.max_group_size {
        return Err(SimError::invalid(format!(
            "activity '{id}' has min group size above max group size"
        )));
    }
    if activity.attempts.is_empty() {
        return Err(SimError::invalid(format!("activity '{id}' has no attempts")));
    }
    for attempt in &activity.attempts {
        if attempt.outcomes.is_empty() {
            return Err(SimError::invalid(format!(
                "attempt '{}' of activity '{id}' has no outcomes",
                attempt.key
            )));
        }
        for outcome in &attempt.outcomes {
            if outcome.weight == 0 {
                return Err(SimError::invalid(format!(
                    "outcome '{}' of activity '{id}' has zero weight",
                    outcome.key
                )));
            }
            for grant in &outcome.grants {
                let valid = match grant.units {
                    GrantUnits::Fixed { units } => units > 0,
                    GrantUnits::Range { min, max } => min > 0 && min <= max,
                };
                if !valid {
                    return Err(SimError::invalid(format!(
                        "outcome '{}' of activity '{id}' has an invalid grant for '{}'",
                        outcome.key, grant.drop_key
                    )));
                }
            }
        }
    }
    for band in &activity.group_scaling_bands {
        if band.min_size > band.max_size {
            return Err(SimError::invalid(format!(
                "activity '{id}' has a group band with min above max"
            )));
        }
        let context = || format!("group band {}-{} of activity '{id}'", band.min_size, band.max_size);
        check_time_multiplier(band.time_multiplier, context)?;
        check_probability_multiplier(band.probability_multiplier, context)?;
    }
    Ok(())
}

/// Time multipliers scale durations: finite and strictly positive.
fn check_time_multiplier(value: f64, context: impl Fn() -> String) -> SimResult<()> {
    if value.is_finite() && value > 0.0 {
        return Ok(());
    }
    Err(SimError::invalid(format!("{} has time multiplier {value}", context())))
}

/// Probability multipliers scale outcome weights: finite, zero allowed.
fn check_probability_multiplier(value: f64, context: impl Fn() -> String) -> SimResult<()> {
    if value.is_finite() && value >= 0.0 {
        return Ok(());
    }
    Err(SimError::invalid(format!("{} has probability multiplier {value}", context())))
}

// ── Test fixture ───────────────────────────────────────────────────

impl EventSnapshot {
    /// Small, fully valid three-row event with two teams.
    /// Tile keys are `r{row}-t{points}`.
    pub fn default_test() -> Self {
        let activities: BTreeMap<EntityId, ActivitySnapshot> = [
            ActivitySnapshot {
                id: "act-fish".into(),
                key: "fishing".into(),
                name: "Fishing".into(),
                mode_support: Some(ModeSupport {
                    supports_solo: true,
                    supports_group: false,
                    min_group_size: 1,
                    max_group_size: 1,
                }),
                attempts: vec![AttemptSnapshot {
                    key: "cast".into(),
                    roll_scope: RollScope::PerPlayer,
                    baseline_time_seconds: 600,
                    variance_seconds: 120,
                    outcomes: vec![
                        outcome("catch", 3, vec![grant_fixed("fish", 1)]),
                        outcome("miss", 7, vec![]),
                    ],
                }],
                group_scaling_bands: vec![],
            },
            ActivitySnapshot {
                id: "act-mine".into(),
                key: "mining".into(),
                name: "Mining".into(),
                mode_support: Some(ModeSupport {
                    supports_solo: true,
                    supports_group: false,
                    min_group_size: 1,
                    max_group_size: 1,
                }),
                attempts: vec![AttemptSnapshot {
                    key: "swing".into(),
                    roll_scope: RollScope::PerPlayer,
                    baseline_time_seconds: 900,
                    variance_seconds: 0,
                    outcomes: vec![
                        outcome("ore", 1, vec![grant_fixed("ore", 2)]),
                        outcome("dust", 1, vec![]),
                    ],
                }],
                group_scaling_bands: vec![],
            },
            ActivitySnapshot {
                id: "act-raid".into(),
                key: "raid".into(),
                name: "Raid".into(),
                mode_support: Some(ModeSupport {
                    supports_solo: true,
                    supports_group: true,
                    min_group_size: 1,
                    max_group_size: 4,
                }),
                attempts: vec![AttemptSnapshot {
                    key: "clear".into(),
                    roll_scope: RollScope::PerGroup,
                    baseline_time_seconds: 3600,
                    variance_seconds: 600,
                    outcomes: vec![
                        outcome("loot", 2, vec![ProgressGrant {
                            drop_key: "raid_token".into(),
                            units: GrantUnits::Range { min: 1, max: 2 },
                        }]),
                        outcome("nothing", 8, vec![]),
                    ],
                }],
                group_scaling_bands: vec![
                    GroupSizeBand { min_size: 1, max_size: 1, time_multiplier: 1.0, probability_multiplier: 1.0 },
                    GroupSizeBand { min_size: 2, max_size: 4, time_multiplier: 0.75, probability_multiplier: 1.2 },
                ],
            },
        ]
        .into_iter()
        .map(|a| (a.id.clone(), a))
        .collect();

        let rows = (0..3u32)
            .map(|r| RowSnapshot {
                index: r,
                tiles: vec![
                    tile(r, 1, 2 + r, vec![rule("act-fish", "fish", &[], vec![])]),
                    tile(r, 2, 4, vec![rule(
                        "act-mine",
                        "ore",
                        &["pickaxe"],
                        vec![CapabilityModifier {
                            capability_key: "mining_boots".into(),
                            time_multiplier: Some(0.8),
                            probability_multiplier: None,
                        }],
                    )]),
                    tile(r, 3, 2, vec![rule("act-raid", "raid_token", &[], vec![])]),
                    tile(r, 4, 5, vec![
                        rule(
                            "act-raid",
                            "raid_token",
                            &[],
                            vec![CapabilityModifier {
                                capability_key: "raid_veteran".into(),
                                time_multiplier: None,
                                probability_multiplier: Some(1.5),
                            }],
                        ),
                        rule("act-mine", "ore", &["pickaxe"], vec![]),
                    ]),
                ],
            })
            .collect();

        let evenings = WeeklySchedule {
            sessions: (0..7u8)
                .map(|d| ScheduledSession {
                    day_of_week: d,
                    start_minute_of_day: 18 * 60,
                    duration_minutes: 300,
                })
                .collect(),
        };

        EventSnapshot {
            event_id: "evt-test".into(),
            event_name: "Test Bingo".into(),
            duration_seconds: 3 * 24 * 3600,
            event_start_time_utc: Some("2024-01-05T17:00:00Z".into()),
            unlock_points_required_per_row: 5,
            rows,
            activities_by_id: activities,
            teams: vec![
                TeamSnapshot {
                    team_id: "team-a".into(),
                    team_name: "Rushers".into(),
                    strategy_key: "RowRush".into(),
                    strategy_params: None,
                    players: vec![
                        player("p-a1", 1.0, &["pickaxe"], WeeklySchedule::default()),
                        player("p-a2", 1.2, &["raid_veteran"], WeeklySchedule::default()),
                    ],
                },
                TeamSnapshot {
                    team_id: "team-b".into(),
                    team_name: "Greedy".into(),
                    strategy_key: "GreedyPoints".into(),
                    strategy_params: None,
                    players: vec![
                        player("p-b1", 0.9, &["pickaxe", "mining_boots"], WeeklySchedule::default()),
                        player("p-b2", 1.0, &[], evenings),
                    ],
                },
            ],
        }
    }
}

fn outcome(key: &str, weight: u32, grants: Vec<ProgressGrant>) -> OutcomeSnapshot {
    OutcomeSnapshot {
        key: key.into(),
        weight,
        grants,
    }
}

fn grant_fixed(drop_key: &str, units: u32) -> ProgressGrant {
    ProgressGrant {
        drop_key: drop_key.into(),
        units: GrantUnits::Fixed { units },
    }
}

fn rule(activity: &str, drop_key: &str, requirements: &[&str], modifiers: Vec<CapabilityModifier>) -> TileActivityRule {
    TileActivityRule {
        activity_definition_id: activity.into(),
        accepted_drop_keys: vec![drop_key.into()],
        requirements: requirements.iter().map(|s| s.to_string()).collect(),
        modifiers,
    }
}

fn tile(row: u32, points: u32, required_count: u32, rules: Vec<TileActivityRule>) -> TileSnapshot {
    TileSnapshot {
        key: format!("r{row}-t{points}"),
        name: format!("Row {row} / {points} pt"),
        points,
        required_count,
        allowed_activities: rules,
    }
}

fn player(id: &str, skill: f64, capabilities: &[&str], schedule: WeeklySchedule) -> PlayerSnapshot {
    PlayerSnapshot {
        player_id: id.into(),
        name: id.to_uppercase(),
        skill_time_multiplier: skill,
        capabilities: capabilities.iter().map(|s| s.to_string()).collect(),
        schedule: Some(schedule),
    }
}
