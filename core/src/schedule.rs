//! Weekly availability evaluation.
//!
//! A player's schedule is a list of weekly sessions expressed in the
//! reference timezone (America/New_York). Every query converts the input
//! instant into that zone first, so DST shifts move sessions with the wall
//! clock rather than with UTC.
//!
//! RULE: An empty session list means "always online".

use crate::snapshot::{ScheduledSession, WeeklySchedule};
use chrono::{DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::America::New_York;
use chrono_tz::Tz;

pub const REFERENCE_TZ: Tz = New_York;

const MINUTES_PER_DAY: u32 = 24 * 60;

/// Half-open minute-of-day window `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Window {
    start: u32,
    end: u32,
}

#[derive(Debug, Clone)]
pub struct ScheduleEvaluator {
    always_online: bool,
    /// Index 0 = Sunday.
    days: [Vec<Window>; 7],
}

impl ScheduleEvaluator {
    pub fn new(schedule: &WeeklySchedule) -> Self {
        Self::from_sessions(&schedule.sessions)
    }

    pub fn from_sessions(sessions: &[ScheduledSession]) -> Self {
        let mut days: [Vec<Window>; 7] = Default::default();
        for session in sessions {
            if session.duration_minutes == 0 {
                continue;
            }
            let day = (session.day_of_week % 7) as usize;
            let start = session.start_minute_of_day.min(MINUTES_PER_DAY - 1);
            let end = start + session.duration_minutes.min(MINUTES_PER_DAY);
            if end <= MINUTES_PER_DAY {
                days[day].push(Window { start, end });
            } else {
                // Crosses midnight: split into tonight and tomorrow morning.
                days[day].push(Window { start, end: MINUTES_PER_DAY });
                days[(day + 1) % 7].push(Window { start: 0, end: end - MINUTES_PER_DAY });
            }
        }
        for windows in days.iter_mut() {
            merge_windows(windows);
        }
        Self {
            always_online: sessions.is_empty(),
            days,
        }
    }

    pub fn is_always_online(&self) -> bool {
        self.always_online
    }

    pub fn is_online_at(&self, at: DateTime<Utc>) -> bool {
        if self.always_online {
            return true;
        }
        let local = at.with_timezone(&REFERENCE_TZ);
        let day = local.weekday().num_days_from_sunday() as usize;
        let second = local.num_seconds_from_midnight();
        self.days[day].iter().any(|w| contains(w, second))
    }

    /// End of the session covering `at`, following sessions that continue
    /// across midnight. `None` when offline or always online.
    pub fn current_session_end(&self, at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if self.always_online {
            return None;
        }
        let local = at.with_timezone(&REFERENCE_TZ);
        let mut date = local.date_naive();
        let mut day = local.weekday().num_days_from_sunday() as usize;
        let second = local.num_seconds_from_midnight();
        let mut window = *self.days[day].iter().find(|w| contains(w, second))?;

        for _ in 0..7 {
            if window.end < MINUTES_PER_DAY {
                break;
            }
            let next_day = (day + 1) % 7;
            match self.days[next_day].first() {
                Some(next) if next.start == 0 => {
                    date = date.succ_opt()?;
                    day = next_day;
                    window = *next;
                }
                _ => break,
            }
        }
        Some(local_to_utc(date, window.end))
    }

    /// `at` itself when online, else the start of the next session.
    /// `None` only when the schedule has no usable session at all.
    pub fn next_session_start_at_or_after(&self, at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if self.always_online || self.is_online_at(at) {
            return Some(at);
        }
        let local = at.with_timezone(&REFERENCE_TZ);
        let today = local.date_naive();
        let day = local.weekday().num_days_from_sunday() as usize;
        let second = local.num_seconds_from_midnight();

        for offset in 0..=7usize {
            let windows = &self.days[(day + offset) % 7];
            let date = today + Duration::days(offset as i64);
            let candidate = windows
                .iter()
                .find(|w| offset > 0 || w.start * 60 > second);
            if let Some(w) = candidate {
                return Some(local_to_utc(date, w.start));
            }
        }
        None
    }
}

fn contains(window: &Window, second_of_day: u32) -> bool {
    window.start * 60 <= second_of_day && second_of_day < window.end * 60
}

fn merge_windows(windows: &mut Vec<Window>) {
    windows.sort_by_key(|w| (w.start, w.end));
    let mut merged: Vec<Window> = Vec::with_capacity(windows.len());
    for w in windows.drain(..) {
        match merged.last_mut() {
            Some(last) if w.start <= last.end => last.end = last.end.max(w.end),
            _ => merged.push(w),
        }
    }
    *windows = merged;
}

/// Convert a reference-zone wall time to UTC. Times inside a spring-forward
/// gap resolve to the first valid instant after it.
fn local_to_utc(date: NaiveDate, minute_of_day: u32) -> DateTime<Utc> {
    let midnight = NaiveDateTime::new(date, NaiveTime::MIN);
    let naive = midnight + Duration::minutes(minute_of_day.min(MINUTES_PER_DAY) as i64);
    let mut candidate = naive;
    for _ in 0..4 {
        match REFERENCE_TZ.from_local_datetime(&candidate) {
            LocalResult::Single(t) => return t.with_timezone(&Utc),
            LocalResult::Ambiguous(earliest, _) => return earliest.with_timezone(&Utc),
            LocalResult::None => candidate += Duration::minutes(30),
        }
    }
    Utc.from_utc_datetime(&naive)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(day: u8, start: u32, duration: u32) -> ScheduledSession {
        ScheduledSession {
            day_of_week: day,
            start_minute_of_day: start,
            duration_minutes: duration,
        }
    }

    fn ny(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        REFERENCE_TZ
            .with_ymd_and_hms(y, m, d, h, min, 0)
            .single()
            .expect("valid local time")
            .with_timezone(&Utc)
    }

    #[test]
    fn empty_schedule_is_always_online() {
        let eval = ScheduleEvaluator::from_sessions(&[]);
        let t = ny(2024, 1, 10, 3, 0);
        assert!(eval.is_online_at(t));
        assert_eq!(eval.next_session_start_at_or_after(t), Some(t));
        assert_eq!(eval.current_session_end(t), None);
    }

    #[test]
    fn evaluates_in_reference_timezone() {
        // 2024-01-10 is a Wednesday (day 3). Session 18:00-20:00 New York.
        let eval = ScheduleEvaluator::from_sessions(&[session(3, 18 * 60, 120)]);
        assert!(eval.is_online_at(ny(2024, 1, 10, 18, 30)));
        assert!(!eval.is_online_at(ny(2024, 1, 10, 20, 0)));
        // 23:30 UTC is 18:30 EST.
        let utc = Utc.with_ymd_and_hms(2024, 1, 10, 23, 30, 0).unwrap();
        assert!(eval.is_online_at(utc));
        assert_eq!(eval.current_session_end(utc), Some(ny(2024, 1, 10, 20, 0)));
    }

    #[test]
    fn midnight_crossing_session_is_split() {
        // Friday 22:00 for 4 hours → Friday 22-24 and Saturday 00-02.
        let eval = ScheduleEvaluator::from_sessions(&[session(5, 22 * 60, 240)]);
        assert!(eval.is_online_at(ny(2024, 1, 12, 23, 0)));
        assert!(eval.is_online_at(ny(2024, 1, 13, 1, 30)));
        assert!(!eval.is_online_at(ny(2024, 1, 13, 2, 0)));
        assert_eq!(
            eval.current_session_end(ny(2024, 1, 12, 23, 0)),
            Some(ny(2024, 1, 13, 2, 0))
        );
    }

    #[test]
    fn next_session_start_wraps_the_week() {
        // Only Monday 09:00.
        let eval = ScheduleEvaluator::from_sessions(&[session(1, 9 * 60, 60)]);
        // Tuesday → next Monday.
        let next = eval.next_session_start_at_or_after(ny(2024, 1, 9, 12, 0));
        assert_eq!(next, Some(ny(2024, 1, 15, 9, 0)));
        // Monday 08:00 → same day.
        let next = eval.next_session_start_at_or_after(ny(2024, 1, 15, 8, 0));
        assert_eq!(next, Some(ny(2024, 1, 15, 9, 0)));
    }

    #[test]
    fn zero_length_sessions_never_come_online() {
        let eval = ScheduleEvaluator::from_sessions(&[session(2, 600, 0)]);
        assert!(!eval.is_always_online());
        assert_eq!(eval.next_session_start_at_or_after(ny(2024, 1, 9, 0, 0)), None);
    }
}
