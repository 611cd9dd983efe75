//! Snapshot assembly: resolve an event against the catalog and freeze it.
//!
//! RULE: Assembly is the only place catalog records become snapshot data.
//! The result is validated before it is returned, so a batch can never be
//! created around a snapshot the engine would reject.

use crate::{
    catalog::EventCatalog,
    error::{SimError, SimResult},
    snapshot::{EventSnapshot, PlayerSnapshot, RowSnapshot, TeamSnapshot, TileSnapshot},
    types::EntityId,
};
use std::collections::{BTreeMap, BTreeSet};

pub struct SnapshotAssembler<'c> {
    catalog: &'c dyn EventCatalog,
}

impl<'c> SnapshotAssembler<'c> {
    pub fn new(catalog: &'c dyn EventCatalog) -> Self {
        Self { catalog }
    }

    pub fn assemble(&self, event_id: &str) -> SimResult<EventSnapshot> {
        let event = self.catalog.event(event_id)?;

        let rows: Vec<RowSnapshot> = event
            .rows
            .into_iter()
            .map(|row| RowSnapshot {
                index: row.index,
                tiles: row
                    .tiles
                    .into_iter()
                    .map(|t| TileSnapshot {
                        key: t.key,
                        name: t.name,
                        points: t.points,
                        required_count: t.required_count,
                        allowed_activities: t.rules,
                    })
                    .collect(),
            })
            .collect();

        // Referenced activity ids, deduplicated. Unknown ids stay unresolved
        // and fail validation below.
        let activity_ids: Vec<EntityId> = rows
            .iter()
            .flat_map(|r| r.tiles.iter())
            .flat_map(|t| t.allowed_activities.iter())
            .map(|rule| rule.activity_definition_id.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let activities_by_id: BTreeMap<_, _> = self
            .catalog
            .activities(&activity_ids)?
            .into_iter()
            .map(|a| (a.id.clone(), a))
            .collect();

        let mut teams = Vec::new();
        for team in self.catalog.teams(event_id)? {
            let profiles = self.catalog.players(&team.player_ids)?;
            let mut players = Vec::with_capacity(team.player_ids.len());
            for player_id in &team.player_ids {
                let profile = profiles.iter().find(|p| &p.id == player_id).ok_or_else(|| {
                    SimError::invalid(format!(
                        "team '{}' references unknown player '{player_id}'",
                        team.id
                    ))
                })?;
                players.push(PlayerSnapshot {
                    player_id: profile.id.clone(),
                    name: profile.name.clone(),
                    skill_time_multiplier: profile.skill_time_multiplier,
                    capabilities: profile.capabilities.clone(),
                    schedule: Some(profile.schedule.clone()),
                });
            }
            teams.push(TeamSnapshot {
                team_id: team.id,
                team_name: team.name,
                strategy_key: team.strategy_key,
                strategy_params: team.strategy_params,
                players,
            });
        }

        let snapshot = EventSnapshot {
            event_id: event.id,
            event_name: event.name,
            duration_seconds: event.duration_seconds,
            event_start_time_utc: event.start_time_utc,
            unlock_points_required_per_row: event.unlock_points_required_per_row,
            rows,
            activities_by_id,
            teams,
        };
        snapshot.validate()?;
        log::debug!(
            "assembled snapshot for event {} ({} rows, {} activities, {} teams)",
            snapshot.event_id,
            snapshot.rows.len(),
            snapshot.activities_by_id.len(),
            snapshot.teams.len()
        );
        Ok(snapshot)
    }

    /// Assemble and serialize once, for storage alongside the batch.
    pub fn assemble_json(&self, event_id: &str) -> SimResult<(EventSnapshot, String)> {
        let snapshot = self.assemble(event_id)?;
        let json = snapshot.to_json()?;
        Ok((snapshot, json))
    }
}
