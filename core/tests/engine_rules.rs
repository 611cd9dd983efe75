//! Engine-level properties that must hold for every run.

use bingo_sim_core::{
    cancel::CancelFlag,
    engine::SimEngine,
    error::SimError,
    seed::derive_run_seed,
    snapshot::{EventSnapshot, ScheduledSession, WeeklySchedule},
};

fn run(snapshot: &EventSnapshot, seed: &str) -> Result<Vec<bingo_sim_core::progress::TeamRunResult>, SimError> {
    SimEngine::execute_snapshot(snapshot, seed, &CancelFlag::new())
}

#[test]
fn row_unlocks_are_contiguous_and_monotonic() {
    let snapshot = EventSnapshot::default_test();
    for i in 0..20 {
        let results = run(&snapshot, &derive_run_seed("MONO", i)).expect("run");
        for team in &results {
            let rows: Vec<u32> = team.row_unlock_times.keys().copied().collect();
            let expected: Vec<u32> = (0..rows.len() as u32).collect();
            assert_eq!(rows, expected, "rows unlocked out of order for {}", team.team_id);
            assert_eq!(team.row_unlock_times[&0], 0);

            let times: Vec<u64> = team.row_unlock_times.values().copied().collect();
            assert!(times.windows(2).all(|w| w[0] <= w[1]), "unlock times went backwards");
            assert_eq!(team.row_reached, *rows.last().expect("row 0"));

            for (key, at) in &team.tile_completion_times {
                assert!(*at <= snapshot.duration_seconds, "{key} completed after the end");
                let (row, _) = snapshot.tile(key).expect("known tile");
                let unlocked = team.row_unlock_times[&row.index];
                assert!(*at >= unlocked, "{key} completed before its row unlocked");
            }

            let points: u32 = team
                .tile_completion_times
                .keys()
                .map(|k| snapshot.tile(k).expect("known tile").1.points)
                .sum();
            assert_eq!(points, team.total_points);
            assert_eq!(team.tiles_completed as usize, team.tile_completion_times.len());
        }
    }
}

#[test]
fn exactly_one_winner_per_run() {
    let snapshot = EventSnapshot::default_test();
    for i in 0..10 {
        let results = run(&snapshot, &derive_run_seed("WIN", i)).expect("run");
        let winners: Vec<_> = results.iter().filter(|r| r.is_winner).collect();
        assert_eq!(winners.len(), 1);
        let best = results.iter().map(|r| r.total_points).max().expect("teams");
        assert_eq!(winners[0].total_points, best);
    }
}

#[test]
fn tied_teams_flag_only_the_first() {
    // No simulated time at all: every team ends on zero points.
    let mut snapshot = EventSnapshot::default_test();
    snapshot.duration_seconds = 0;
    let results = run(&snapshot, "TIE_0").expect("run");
    assert!(results.iter().all(|r| r.total_points == 0));
    assert!(results[0].is_winner);
    assert!(results[1..].iter().all(|r| !r.is_winner));
}

#[test]
fn permanently_offline_players_cannot_make_progress() {
    let mut snapshot = EventSnapshot::default_test();
    let never = WeeklySchedule {
        sessions: vec![ScheduledSession {
            day_of_week: 2,
            start_minute_of_day: 600,
            duration_minutes: 0,
        }],
    };
    for team in &mut snapshot.teams {
        for player in &mut team.players {
            player.schedule = Some(never.clone());
        }
    }
    match run(&snapshot, "STUCK_0") {
        Err(SimError::NoProgress { sim_seconds, .. }) => assert_eq!(sim_seconds, 0),
        other => panic!("expected NoProgress, got {other:?}"),
    }
}

#[test]
fn evening_only_players_do_nothing_before_their_session() {
    let mut snapshot = EventSnapshot::default_test();
    // Start at 09:00 New York on a Friday; sessions run 18:00-23:00 daily.
    snapshot.event_start_time_utc = Some("2024-01-05T14:00:00Z".into());
    snapshot.duration_seconds = 8 * 3600;
    let evenings = WeeklySchedule {
        sessions: (0..7)
            .map(|d| ScheduledSession {
                day_of_week: d,
                start_minute_of_day: 18 * 60,
                duration_minutes: 300,
            })
            .collect(),
    };
    for team in &mut snapshot.teams {
        for player in &mut team.players {
            player.schedule = Some(evenings.clone());
        }
    }
    let results = run(&snapshot, "EVENING_0").expect("run");
    // The first session opens 9 hours in, after the event ends.
    assert!(results.iter().all(|r| r.total_points == 0 && r.tile_completion_times.is_empty()));
}

#[test]
fn cancellation_stops_the_run() {
    let snapshot = EventSnapshot::default_test();
    let cancel = CancelFlag::new();
    cancel.cancel();
    let err = SimEngine::execute_snapshot(&snapshot, "CANCEL_0", &cancel).unwrap_err();
    assert!(matches!(err, SimError::Cancelled));
}

#[test]
fn zero_probability_on_every_outcome_falls_back_to_base_weights() {
    let mut snapshot = EventSnapshot::default_test();
    // Every outcome of the fishing attempt now carries a grant, and holders
    // of "angler" get a zero probability multiplier on row-0 fishing.
    let fish = snapshot.activities_by_id.get_mut("act-fish").expect("fishing activity");
    for outcome in &mut fish.attempts[0].outcomes {
        outcome.grants = vec![bingo_sim_core::snapshot::ProgressGrant {
            drop_key: "fish".into(),
            units: bingo_sim_core::snapshot::GrantUnits::Fixed { units: 1 },
        }];
    }
    for team in &mut snapshot.teams {
        for player in &mut team.players {
            player.capabilities.push("angler".into());
        }
    }
    let rule = &mut snapshot.rows[0].tiles.iter_mut().find(|t| t.points == 1).expect("1-point tile")
        .allowed_activities[0];
    rule.modifiers.push(bingo_sim_core::snapshot::CapabilityModifier {
        capability_key: "angler".into(),
        time_multiplier: None,
        probability_multiplier: Some(0.0),
    });

    let results = run(&snapshot, "FALLBACK_0").expect("run");
    let key = snapshot.rows[0].tiles.iter().find(|t| t.points == 1).expect("tile").key.clone();
    // RowRush sends both players fishing at t=0; with the unscaled weights
    // every roll grants, so the two first attempts finish the tile.
    let row_rush = &results[0];
    let completed_at = row_rush.tile_completion_times.get(&key).copied();
    assert!(
        completed_at.is_some_and(|t| t <= 864),
        "fishing tile completed at {completed_at:?}"
    );
}

#[test]
fn malformed_snapshot_is_a_configuration_error() {
    let err = SimEngine::execute("{ not json", "BAD_0").unwrap_err();
    assert!(err.is_configuration_error());

    let mut snapshot = EventSnapshot::default_test();
    snapshot.teams.clear();
    let json = serde_json::to_string(&snapshot).expect("serialize");
    let err = SimEngine::execute(&json, "BAD_1").unwrap_err();
    assert!(err.is_configuration_error());
}

#[test]
fn enormous_durations_end_past_the_event_instead_of_overflowing() {
    let mut snapshot = EventSnapshot::default_test();
    // Noon Friday in New York; the only session opens at 13:00, an hour in.
    snapshot.event_start_time_utc = Some("2024-01-05T17:00:00Z".into());
    let friday_afternoon = WeeklySchedule {
        sessions: vec![ScheduledSession {
            day_of_week: 5,
            start_minute_of_day: 13 * 60,
            duration_minutes: 300,
        }],
    };
    for team in &mut snapshot.teams {
        for player in &mut team.players {
            player.skill_time_multiplier = 1e30;
            player.schedule = Some(friday_afternoon.clone());
        }
    }
    snapshot.validate().expect("finite multipliers are valid");

    let results = run(&snapshot, "HUGE_0").expect("run");
    assert!(results.iter().all(|r| r.tile_completion_times.is_empty()));
    assert!(results.iter().all(|r| r.total_points == 0));
}
