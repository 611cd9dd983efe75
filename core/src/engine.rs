//! The simulation engine: replays one run of an event from its snapshot.
//!
//! EXECUTION ORDER (fixed, documented, never reordered):
//!   1. Every player on every team is offered a first task, team index
//!      ascending, player index ascending.
//!   2. Events are dequeued in (time, team, player, sequence) order.
//!   3. A completed attempt rolls outcomes, routes each grant through the
//!      team strategy, then every idle player on that team is re-offered work.
//!   4. The loop stops when the queue drains or time passes the event end.
//!
//! RULES:
//!   - All randomness flows through one RunRng, consumed in queue order.
//!   - The snapshot is never mutated; all run state lives in TeamProgress
//!     and the per-player activity slots below.
//!   - Cancellation is checked once per dequeued event.

use crate::{
    cancel::CancelFlag,
    clock::SimClock,
    error::{SimError, SimResult},
    event::{EventKind, EventQueue},
    modifiers::ModifierApplicator,
    progress::{TeamProgress, TeamRunResult},
    rng::RunRng,
    schedule::ScheduleEvaluator,
    snapshot::{
        ActivitySnapshot, EventSnapshot, GrantUnits, OutcomeSnapshot, RollScope, TeamSnapshot,
        TileActivityRule,
    },
    strategy::{strategy_for_key, GrantContext, TaskChoice, TaskContext, TeamStrategy},
    types::SimSeconds,
};

/// Upper clamp for a probability-adjusted outcome weight.
pub const MAX_ADJUSTED_WEIGHT: f64 = 1e9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PlayerActivity {
    /// Online with nothing to do, or waiting for a group.
    Idle,
    Busy,
    /// Offline; a wake event is queued.
    Sleeping,
    /// Next session starts after the event ends.
    Done,
    /// Schedule has no usable session at all.
    Offline,
}

struct PlayerState {
    schedule: ScheduleEvaluator,
    activity: PlayerActivity,
}

struct TeamState<'a> {
    team: &'a TeamSnapshot,
    strategy: &'static dyn TeamStrategy,
    progress: TeamProgress,
    players: Vec<PlayerState>,
}

pub struct SimEngine<'a> {
    snapshot: &'a EventSnapshot,
    clock: SimClock,
    rng: RunRng,
    queue: EventQueue,
    teams: Vec<TeamState<'a>>,
    cancel: CancelFlag,
    events_processed: u64,
}

impl<'a> SimEngine<'a> {
    /// Validate the stored snapshot and replay one run.
    pub fn execute(snapshot_json: &str, run_seed: &str) -> SimResult<Vec<TeamRunResult>> {
        let snapshot = EventSnapshot::from_json(snapshot_json)?;
        SimEngine::execute_snapshot(&snapshot, run_seed, &CancelFlag::new())
    }

    /// Replay one run against an already validated snapshot.
    pub fn execute_snapshot(
        snapshot: &EventSnapshot,
        run_seed: &str,
        cancel: &CancelFlag,
    ) -> SimResult<Vec<TeamRunResult>> {
        SimEngine::new(snapshot, run_seed, cancel.clone())?.run()
    }

    pub fn new(snapshot: &'a EventSnapshot, run_seed: &str, cancel: CancelFlag) -> SimResult<Self> {
        let start = snapshot.start_time()?;
        let teams = snapshot
            .teams
            .iter()
            .map(|team| {
                Ok(TeamState {
                    team,
                    strategy: strategy_for_key(&team.strategy_key)?,
                    progress: TeamProgress::new(snapshot),
                    players: team
                        .players
                        .iter()
                        .map(|p| PlayerState {
                            schedule: p
                                .schedule
                                .as_ref()
                                .map(ScheduleEvaluator::new)
                                .unwrap_or_else(|| ScheduleEvaluator::from_sessions(&[])),
                            activity: PlayerActivity::Idle,
                        })
                        .collect(),
                })
            })
            .collect::<SimResult<Vec<_>>>()?;

        Ok(Self {
            snapshot,
            clock: SimClock::new(start, snapshot.duration_seconds),
            rng: RunRng::from_seed_string(run_seed),
            queue: EventQueue::new(),
            teams,
            cancel,
            events_processed: 0,
        })
    }

    pub fn run(mut self) -> SimResult<Vec<TeamRunResult>> {
        for t in 0..self.teams.len() {
            self.offer_work_to_idle(t);
        }

        let mut reached_end = false;
        while let Some(event) = self.queue.pop() {
            if self.cancel.is_cancelled() {
                return Err(SimError::Cancelled);
            }
            if self.clock.is_past_end(event.time) {
                reached_end = true;
                break;
            }
            self.clock.advance_to(event.time);
            self.events_processed += 1;

            match event.kind {
                EventKind::Wake => {
                    self.teams[event.team].players[event.player].activity = PlayerActivity::Idle;
                    self.try_start(event.team, event.player);
                }
                EventKind::AttemptCompleted {
                    activity_id,
                    attempt_index,
                    tile_key,
                    members,
                } => {
                    self.resolve_attempt(event.team, &activity_id, attempt_index, &tile_key, &members)?;
                    for &m in &members {
                        self.teams[event.team].players[m].activity = PlayerActivity::Idle;
                    }
                    self.offer_work_to_idle(event.team);
                }
            }
        }

        if !reached_end {
            self.check_progress_possible()?;
        }

        log::debug!(
            "run finished at t={}s after {} events",
            self.clock.now,
            self.events_processed
        );
        Ok(self.results())
    }

    fn offer_work_to_idle(&mut self, team_idx: usize) {
        for p in 0..self.teams[team_idx].players.len() {
            if self.teams[team_idx].players[p].activity == PlayerActivity::Idle {
                self.try_start(team_idx, p);
            }
        }
    }

    fn choose_task(&self, team_idx: usize, player_idx: usize) -> Option<TaskChoice<'a>> {
        let snapshot: &'a EventSnapshot = self.snapshot;
        let team = &self.teams[team_idx];
        let team_snapshot: &'a TeamSnapshot = team.team;
        let open_tiles = team.progress.open_tiles(snapshot);
        let ctx = TaskContext {
            open_tiles: &open_tiles,
            activities: &snapshot.activities_by_id,
            capabilities: &team_snapshot.players[player_idx].capabilities,
            params: team_snapshot.strategy_params.as_ref(),
        };
        team.strategy.select_task_for_player(&ctx)
    }

    /// Start the player's next attempt, put them to sleep until their next
    /// session, or leave them idle when nothing is eligible.
    fn try_start(&mut self, team_idx: usize, player_idx: usize) {
        let now = self.clock.now;
        let wall = self.clock.wall_time(now);

        {
            let player = &mut self.teams[team_idx].players[player_idx];
            if !player.schedule.is_online_at(wall) {
                match player.schedule.next_session_start_at_or_after(wall) {
                    None => player.activity = PlayerActivity::Offline,
                    Some(next) => {
                        let t = self.clock.sim_seconds_at(next).max(now + 1);
                        if self.clock.is_past_end(t) {
                            player.activity = PlayerActivity::Done;
                        } else {
                            player.activity = PlayerActivity::Sleeping;
                            self.queue.push(t, team_idx, player_idx, EventKind::Wake);
                        }
                    }
                }
                return;
            }
        }

        let Some(choice) = self.choose_task(team_idx, player_idx) else {
            return;
        };
        let members = self.form_group(team_idx, player_idx, choice.activity);
        let Some(members) = members else {
            return;
        };

        let attempt_index = if choice.activity.attempts.len() > 1 {
            self.rng.next_u64_below(choice.activity.attempts.len() as u64) as usize
        } else {
            0
        };
        let duration = self.attempt_duration(team_idx, &members, choice.activity, attempt_index, choice.rule);

        for &m in &members {
            self.teams[team_idx].players[m].activity = PlayerActivity::Busy;
        }
        self.queue.push(
            now.saturating_add(duration),
            team_idx,
            player_idx,
            EventKind::AttemptCompleted {
                activity_id: choice.activity.id.clone(),
                attempt_index,
                tile_key: choice.tile_key.to_string(),
                members,
            },
        );
    }

    /// Leader first, then idle online teammates who would pick the same
    /// activity, in player order. `None` when a group-only activity cannot
    /// reach its minimum size.
    fn form_group(
        &self,
        team_idx: usize,
        leader: usize,
        activity: &ActivitySnapshot,
    ) -> Option<Vec<usize>> {
        let mut members = vec![leader];
        let Some(mode) = activity.mode_support.as_ref() else {
            return Some(members);
        };
        if !mode.supports_group {
            return Some(members);
        }

        let wall = self.clock.wall_time(self.clock.now);
        let team = &self.teams[team_idx];
        let max_size = mode.max_group_size.max(1) as usize;
        for other in 0..team.players.len() {
            if members.len() >= max_size {
                break;
            }
            if other == leader
                || team.players[other].activity != PlayerActivity::Idle
                || !team.players[other].schedule.is_online_at(wall)
            {
                continue;
            }
            let same_activity = self
                .choose_task(team_idx, other)
                .is_some_and(|c| c.activity.id == activity.id);
            if same_activity {
                members.push(other);
            }
        }

        if !mode.supports_solo && (members.len() as u32) < mode.min_group_size.max(2) {
            return None;
        }
        Some(members)
    }

    /// baseline ± variance, scaled by mean member skill and the combined
    /// time multiplier, floored, at least one second and at most one
    /// second past the event end.
    fn attempt_duration(
        &mut self,
        team_idx: usize,
        members: &[usize],
        activity: &ActivitySnapshot,
        attempt_index: usize,
        rule: &TileActivityRule,
    ) -> SimSeconds {
        let attempt = &activity.attempts[attempt_index];
        let variance = attempt.variance_seconds as i64;
        let jitter = self.rng.range_inclusive(-variance, variance);
        let base = (attempt.baseline_time_seconds as i64 + jitter).max(0) as f64;

        let team = self.teams[team_idx].team;
        let skill = members
            .iter()
            .map(|&m| team.players[m].skill_time_multiplier)
            .sum::<f64>()
            / members.len() as f64;
        let leader = &team.players[members[0]];
        let multipliers = ModifierApplicator::combine(
            &activity.group_scaling_bands,
            members.len() as u32,
            &rule.modifiers,
            &leader.capabilities,
        );

        // Attempts ending after the event never resolve; cap there.
        let scaled = (base * skill * multipliers.time).floor();
        let past_end = self.clock.step_past_end();
        if scaled.is_nan() || scaled < 1.0 {
            1
        } else if scaled >= past_end as f64 {
            past_end
        } else {
            scaled as SimSeconds
        }
    }

    fn resolve_attempt(
        &mut self,
        team_idx: usize,
        activity_id: &str,
        attempt_index: usize,
        tile_key: &str,
        members: &[usize],
    ) -> SimResult<()> {
        let snapshot = self.snapshot;
        let activity = snapshot
            .activities_by_id
            .get(activity_id)
            .ok_or_else(|| SimError::invalid(format!("activity '{activity_id}' vanished")))?;
        let attempt = activity
            .attempts
            .get(attempt_index)
            .ok_or_else(|| SimError::invalid(format!("attempt {attempt_index} of '{activity_id}' missing")))?;

        let modifiers = snapshot
            .tile(tile_key)
            .and_then(|(_, tile)| {
                tile.allowed_activities
                    .iter()
                    .find(|r| r.activity_definition_id == activity_id)
            })
            .map(|r| r.modifiers.as_slice())
            .unwrap_or(&[]);

        let rollers: &[usize] = match attempt.roll_scope {
            RollScope::PerGroup => &members[..1],
            RollScope::PerPlayer => members,
        };
        let team = self.teams[team_idx].team;
        for &roller in rollers {
            let multipliers = ModifierApplicator::combine(
                &activity.group_scaling_bands,
                members.len() as u32,
                modifiers,
                &team.players[roller].capabilities,
            );
            let Some(outcome) = roll_outcome(&attempt.outcomes, multipliers.probability, &mut self.rng)
            else {
                continue;
            };
            for grant in &outcome.grants {
                let units = match grant.units {
                    GrantUnits::Fixed { units } => units,
                    GrantUnits::Range { min, max } => {
                        self.rng.range_inclusive(min as i64, max as i64) as u32
                    }
                };
                self.apply_grant(team_idx, &grant.drop_key, units);
            }
        }
        Ok(())
    }

    fn apply_grant(&mut self, team_idx: usize, drop_key: &str, units: u32) {
        let snapshot: &'a EventSnapshot = self.snapshot;
        let now = self.clock.now;
        let team = &mut self.teams[team_idx];
        let team_snapshot: &'a TeamSnapshot = team.team;

        let target = {
            let eligible = team.progress.eligible_tiles(snapshot, drop_key);
            let ctx = GrantContext {
                drop_key,
                units,
                eligible: &eligible,
                params: team_snapshot.strategy_params.as_ref(),
            };
            team.strategy.select_target_tile_for_grant(&ctx)
        };
        let Some((row, tile)) = target.and_then(|key| snapshot.tile(key)) else {
            return;
        };
        let applied = team.progress.apply_grant(row.index, tile, units, now);
        if !applied.rows_unlocked.is_empty() {
            log::trace!(
                "t={now} team={} unlocked rows {:?}",
                team_snapshot.team_id,
                applied.rows_unlocked
            );
        }
    }

    fn check_progress_possible(&self) -> SimResult<()> {
        let all_offline = self
            .teams
            .iter()
            .flat_map(|t| t.players.iter())
            .all(|p| p.activity == PlayerActivity::Offline);
        let any_players = self.teams.iter().any(|t| !t.players.is_empty());
        let work_left = self
            .teams
            .iter()
            .any(|t| !t.progress.open_tiles(self.snapshot).is_empty());
        if any_players && all_offline && work_left {
            return Err(SimError::NoProgress {
                sim_seconds: self.clock.now,
                reason: "every player is permanently offline with tiles still open".into(),
            });
        }
        Ok(())
    }

    fn results(&self) -> Vec<TeamRunResult> {
        let mut results: Vec<TeamRunResult> = self
            .teams
            .iter()
            .map(|t| t.progress.summary(t.team))
            .collect();
        // Ties go to the first team in snapshot order.
        let best = results.iter().map(|r| r.total_points).max();
        if let Some(best) = best {
            if let Some(winner) = results.iter_mut().find(|r| r.total_points == best) {
                winner.is_winner = true;
            }
        }
        results
    }
}

/// Weighted outcome roll. Outcomes that carry grants have their weight
/// scaled by `probability_multiplier` and clamped to [0, MAX_ADJUSTED_WEIGHT];
/// when the adjusted total is not positive the unscaled weights are used.
pub fn roll_outcome<'o>(
    outcomes: &'o [OutcomeSnapshot],
    probability_multiplier: f64,
    rng: &mut RunRng,
) -> Option<&'o OutcomeSnapshot> {
    if outcomes.is_empty() {
        return None;
    }
    let adjusted: Vec<f64> = outcomes
        .iter()
        .map(|o| {
            let base = o.weight as f64;
            let scaled = if o.grants.is_empty() {
                base
            } else {
                base * probability_multiplier
            };
            if scaled.is_nan() {
                0.0
            } else {
                scaled.clamp(0.0, MAX_ADJUSTED_WEIGHT)
            }
        })
        .collect();
    let adjusted_total: f64 = adjusted.iter().sum();
    let weights: Vec<f64> = if adjusted_total > 0.0 {
        adjusted
    } else {
        outcomes.iter().map(|o| o.weight as f64).collect()
    };
    let total: f64 = weights.iter().sum();

    let mut roll = rng.next_f64() * total;
    for (outcome, weight) in outcomes.iter().zip(&weights) {
        if roll < *weight {
            return Some(outcome);
        }
        roll -= weight;
    }
    outcomes.last()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::ProgressGrant;

    fn outcome(key: &str, weight: u32, with_grant: bool) -> OutcomeSnapshot {
        OutcomeSnapshot {
            key: key.into(),
            weight,
            grants: if with_grant {
                vec![ProgressGrant {
                    drop_key: "x".into(),
                    units: GrantUnits::Fixed { units: 1 },
                }]
            } else {
                vec![]
            },
        }
    }

    #[test]
    fn zero_multiplier_falls_back_to_unscaled_weights() {
        let outcomes = vec![outcome("a", 1, true), outcome("b", 3, true)];
        let mut rng = RunRng::new(11);
        let mut seen_a = 0;
        let mut seen_b = 0;
        for _ in 0..2_000 {
            match roll_outcome(&outcomes, 0.0, &mut rng).unwrap().key.as_str() {
                "a" => seen_a += 1,
                _ => seen_b += 1,
            }
        }
        assert!(seen_a > 300 && seen_b > 1_200, "a={seen_a} b={seen_b}");
    }

    #[test]
    fn zero_multiplier_suppresses_grant_outcomes_when_others_exist() {
        let outcomes = vec![outcome("loot", 5, true), outcome("nothing", 1, false)];
        let mut rng = RunRng::new(3);
        for _ in 0..500 {
            assert_eq!(roll_outcome(&outcomes, 0.0, &mut rng).unwrap().key, "nothing");
        }
    }

    #[test]
    fn huge_multiplier_is_clamped() {
        let outcomes = vec![outcome("loot", 1, true), outcome("nothing", 1, false)];
        let mut rng = RunRng::new(5);
        let picked = roll_outcome(&outcomes, f64::INFINITY, &mut rng).unwrap();
        assert_eq!(picked.key, "loot");
    }

    #[test]
    fn execute_is_deterministic() {
        let json = EventSnapshot::default_test().to_json().unwrap();
        let a = SimEngine::execute(&json, "S_0").unwrap();
        let b = SimEngine::execute(&json, "S_0").unwrap();
        assert_eq!(serde_json::to_string(&a).unwrap(), serde_json::to_string(&b).unwrap());
    }
}
