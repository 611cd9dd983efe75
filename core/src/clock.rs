//! Simulation clock. Owns simulated time and maps it to wall-clock instants.
//!
//! Simulated time is whole seconds since the event start. Schedules are
//! evaluated against wall time, so every availability check goes through
//! `wall_time`.

use crate::types::SimSeconds;
use chrono::{DateTime, Duration, Utc};

#[derive(Debug, Clone, PartialEq)]
pub struct SimClock {
    pub start:    DateTime<Utc>,
    pub now:      SimSeconds,
    pub duration: SimSeconds,
}

impl SimClock {
    pub fn new(start: DateTime<Utc>, duration: SimSeconds) -> Self {
        Self {
            start,
            now: 0,
            duration,
        }
    }

    /// Move time forward. Time never runs backwards.
    pub fn advance_to(&mut self, t: SimSeconds) -> SimSeconds {
        debug_assert!(t >= self.now, "clock moved backwards: {} -> {t}", self.now);
        self.now = self.now.max(t);
        self.now
    }

    pub fn is_past_end(&self, t: SimSeconds) -> bool {
        t > self.duration
    }

    /// Shortest step from `now` that lands past the end.
    pub fn step_past_end(&self) -> SimSeconds {
        self.duration.saturating_sub(self.now).saturating_add(1)
    }

    pub fn wall_time(&self, t: SimSeconds) -> DateTime<Utc> {
        self.start + Duration::seconds(t as i64)
    }

    /// First simulated second at or after `at`.
    pub fn sim_seconds_at(&self, at: DateTime<Utc>) -> SimSeconds {
        let delta = at - self.start;
        let millis = delta.num_milliseconds();
        if millis <= 0 {
            return 0;
        }
        ((millis + 999) / 1000) as SimSeconds
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn wall_time_round_trips() {
        let start = Utc.with_ymd_and_hms(2024, 1, 5, 17, 0, 0).unwrap();
        let clock = SimClock::new(start, 3600);
        let wall = clock.wall_time(1234);
        assert_eq!(clock.sim_seconds_at(wall), 1234);
        assert_eq!(clock.sim_seconds_at(start - Duration::hours(1)), 0);
        assert!(clock.is_past_end(3601));
        assert!(!clock.is_past_end(3600));
    }
}
