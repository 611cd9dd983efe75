//! Event catalog: the normalized definitions a snapshot is assembled from.
//!
//! RULE: The catalog is read-only from the pipeline's point of view.
//! Administration of events, players and teams happens elsewhere; this
//! module only defines the lookups assembly needs plus a JSON-file backed
//! implementation for the runner and tests.

use crate::{
    error::{SimError, SimResult},
    snapshot::{ActivitySnapshot, EventSnapshot, TileActivityRule, WeeklySchedule},
    types::{EntityId, SimSeconds},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct EventDefinition {
    pub id: EntityId,
    pub name: String,
    pub duration_seconds: SimSeconds,
    pub start_time_utc: Option<String>,
    pub unlock_points_required_per_row: u32,
    pub rows: Vec<RowDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct RowDefinition {
    pub index: u32,
    pub tiles: Vec<TileDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct TileDefinition {
    pub key: String,
    pub name: String,
    pub points: u32,
    pub required_count: u32,
    pub rules: Vec<TileActivityRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct PlayerProfile {
    pub id: EntityId,
    pub name: String,
    pub skill_time_multiplier: f64,
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Absent means always online.
    #[serde(default)]
    pub schedule: WeeklySchedule,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct TeamDefinition {
    pub id: EntityId,
    pub event_id: EntityId,
    pub name: String,
    pub strategy_key: String,
    #[serde(default)]
    pub strategy_params: Option<serde_json::Value>,
    pub player_ids: Vec<EntityId>,
}

/// Lookups snapshot assembly resolves against.
pub trait EventCatalog: Send + Sync {
    fn event(&self, event_id: &str) -> SimResult<EventDefinition>;

    /// Activities among `ids` that exist. Unknown ids are left out.
    fn activities(&self, ids: &[EntityId]) -> SimResult<Vec<ActivitySnapshot>>;

    /// Players among `ids` that exist. Unknown ids are left out.
    fn players(&self, ids: &[EntityId]) -> SimResult<Vec<PlayerProfile>>;

    /// Teams entered in the event, in their stored order.
    fn teams(&self, event_id: &str) -> SimResult<Vec<TeamDefinition>>;
}

// ── JSON file catalog ──────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CatalogFile {
    #[serde(default)]
    events: Vec<EventDefinition>,
    #[serde(default)]
    activities: Vec<ActivitySnapshot>,
    #[serde(default)]
    players: Vec<PlayerProfile>,
    #[serde(default)]
    teams: Vec<TeamDefinition>,
}

#[derive(Debug, Clone, Default)]
pub struct JsonCatalog {
    events: BTreeMap<EntityId, EventDefinition>,
    activities: BTreeMap<EntityId, ActivitySnapshot>,
    players: BTreeMap<EntityId, PlayerProfile>,
    teams: Vec<TeamDefinition>,
}

impl JsonCatalog {
    pub fn load(path: &str) -> SimResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn from_json(json: &str) -> SimResult<Self> {
        let file: CatalogFile = serde_json::from_str(json)?;
        Ok(Self {
            events: file.events.into_iter().map(|e| (e.id.clone(), e)).collect(),
            activities: file.activities.into_iter().map(|a| (a.id.clone(), a)).collect(),
            players: file.players.into_iter().map(|p| (p.id.clone(), p)).collect(),
            teams: file.teams,
        })
    }

    pub fn to_json(&self) -> SimResult<String> {
        let file = CatalogFile {
            events: self.events.values().cloned().collect(),
            activities: self.activities.values().cloned().collect(),
            players: self.players.values().cloned().collect(),
            teams: self.teams.clone(),
        };
        Ok(serde_json::to_string_pretty(&file)?)
    }

    /// Decompose a snapshot back into catalog records.
    pub fn from_snapshot(snapshot: &EventSnapshot) -> Self {
        let mut catalog = Self::default();
        catalog.insert_snapshot(snapshot);
        catalog
    }

    pub fn insert_snapshot(&mut self, snapshot: &EventSnapshot) {
        let event = EventDefinition {
            id: snapshot.event_id.clone(),
            name: snapshot.event_name.clone(),
            duration_seconds: snapshot.duration_seconds,
            start_time_utc: snapshot.event_start_time_utc.clone(),
            unlock_points_required_per_row: snapshot.unlock_points_required_per_row,
            rows: snapshot
                .rows
                .iter()
                .map(|row| RowDefinition {
                    index: row.index,
                    tiles: row
                        .tiles
                        .iter()
                        .map(|t| TileDefinition {
                            key: t.key.clone(),
                            name: t.name.clone(),
                            points: t.points,
                            required_count: t.required_count,
                            rules: t.allowed_activities.clone(),
                        })
                        .collect(),
                })
                .collect(),
        };
        self.events.insert(event.id.clone(), event);
        for activity in snapshot.activities_by_id.values() {
            self.activities.insert(activity.id.clone(), activity.clone());
        }
        self.teams.retain(|t| t.event_id != snapshot.event_id);
        for team in &snapshot.teams {
            for player in &team.players {
                self.players.insert(
                    player.player_id.clone(),
                    PlayerProfile {
                        id: player.player_id.clone(),
                        name: player.name.clone(),
                        skill_time_multiplier: player.skill_time_multiplier,
                        capabilities: player.capabilities.clone(),
                        schedule: player.schedule.clone().unwrap_or_default(),
                    },
                );
            }
            self.teams.push(TeamDefinition {
                id: team.team_id.clone(),
                event_id: snapshot.event_id.clone(),
                name: team.team_name.clone(),
                strategy_key: team.strategy_key.clone(),
                strategy_params: team.strategy_params.clone(),
                player_ids: team.players.iter().map(|p| p.player_id.clone()).collect(),
            });
        }
    }

    /// Catalog holding the standard test event.
    pub fn default_test() -> Self {
        Self::from_snapshot(&EventSnapshot::default_test())
    }
}

impl EventCatalog for JsonCatalog {
    fn event(&self, event_id: &str) -> SimResult<EventDefinition> {
        self.events
            .get(event_id)
            .cloned()
            .ok_or_else(|| SimError::EventNotFound {
                event_id: event_id.to_string(),
            })
    }

    fn activities(&self, ids: &[EntityId]) -> SimResult<Vec<ActivitySnapshot>> {
        Ok(ids.iter().filter_map(|id| self.activities.get(id).cloned()).collect())
    }

    fn players(&self, ids: &[EntityId]) -> SimResult<Vec<PlayerProfile>> {
        Ok(ids.iter().filter_map(|id| self.players.get(id).cloned()).collect())
    }

    fn teams(&self, event_id: &str) -> SimResult<Vec<TeamDefinition>> {
        Ok(self
            .teams
            .iter()
            .filter(|t| t.event_id == event_id)
            .cloned()
            .collect())
    }
}
