//! Chunk planning: turning lookbacks and gaps into bounded windows.

use std::collections::BTreeSet;

use backfill_core::{Timeframe, TradingCalendar, Window};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Upper bounds on the size of one chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkPolicy {
    /// Trading sessions per intraday chunk.
    pub intraday_sessions: u32,
    /// Daily bars per chunk.
    pub daily_slots: u32,
    /// Weekly bars per chunk.
    pub weekly_slots: u32,
}

impl Default for ChunkPolicy {
    fn default() -> Self {
        Self {
            intraday_sessions: 1,
            daily_slots: 1,
            weekly_slots: 4,
        }
    }
}

/// Splits expected slot sequences into chunk windows.
#[derive(Clone, Debug)]
pub struct ChunkPlanner {
    calendar: TradingCalendar,
    policy: ChunkPolicy,
}

impl ChunkPlanner {
    /// Creates a planner.
    #[must_use]
    pub const fn new(calendar: TradingCalendar, policy: ChunkPolicy) -> Self {
        Self { calendar, policy }
    }

    /// Returns the calendar slots are computed against.
    #[must_use]
    pub const fn calendar(&self) -> &TradingCalendar {
        &self.calendar
    }

    /// Returns the chunk size policy.
    #[must_use]
    pub const fn policy(&self) -> ChunkPolicy {
        self.policy
    }

    /// The last `lookback` sessions up to the exchange-local date of `now`.
    #[must_use]
    pub fn sessions(&self, lookback: u32, now: DateTime<Utc>) -> Vec<NaiveDate> {
        let count = usize::try_from(lookback).unwrap_or(usize::MAX);
        self.calendar.sessions_back(self.calendar.local_date(now), count)
    }

    /// Windows covering every slot of the last `lookback` sessions.
    #[must_use]
    pub fn plan_lookback(&self, timeframe: Timeframe, lookback: u32, now: DateTime<Utc>) -> Vec<Window> {
        let expected = self.calendar.slots(timeframe, &self.sessions(lookback, now));
        self.group(timeframe, &expected, &expected)
    }

    /// Windows covering the `missing` slots, split wherever a slot of `expected`
    /// is present in between.
    #[must_use]
    pub fn gap_windows(
        &self,
        timeframe: Timeframe,
        missing: &[DateTime<Utc>],
        expected: &[DateTime<Utc>],
    ) -> Vec<Window> {
        self.group(timeframe, missing, expected)
    }

    fn group(
        &self,
        timeframe: Timeframe,
        selected: &[DateTime<Utc>],
        expected: &[DateTime<Utc>],
    ) -> Vec<Window> {
        let selected: BTreeSet<DateTime<Utc>> = selected.iter().copied().collect();
        let mut windows = Vec::new();
        let mut run: Option<Run> = None;

        for slot in expected.iter().copied() {
            if !selected.contains(&slot) {
                if let Some(done) = run.take() {
                    windows.extend(done.window(&self.calendar, timeframe));
                }
                continue;
            }

            let session = self.calendar.local_date(slot);
            match run.as_mut() {
                Some(current) if self.fits(timeframe, current, session) => current.push(slot, session),
                _ => {
                    if let Some(done) = run.take() {
                        windows.extend(done.window(&self.calendar, timeframe));
                    }
                    run = Some(Run::start(slot, session));
                }
            }
        }

        if let Some(done) = run {
            windows.extend(done.window(&self.calendar, timeframe));
        }
        windows
    }

    fn fits(&self, timeframe: Timeframe, run: &Run, session: NaiveDate) -> bool {
        match timeframe {
            Timeframe::M15 | Timeframe::H1 | Timeframe::H4 => {
                let sessions = run.sessions + u32::from(session != run.last_session);
                sessions <= self.policy.intraday_sessions
            }
            Timeframe::D1 => run.slots < self.policy.daily_slots,
            Timeframe::W1 => run.slots < self.policy.weekly_slots,
        }
    }
}

/// A contiguous run of selected slots being grown into one chunk.
struct Run {
    first: DateTime<Utc>,
    last: DateTime<Utc>,
    last_session: NaiveDate,
    sessions: u32,
    slots: u32,
}

impl Run {
    const fn start(slot: DateTime<Utc>, session: NaiveDate) -> Self {
        Self {
            first: slot,
            last: slot,
            last_session: session,
            sessions: 1,
            slots: 1,
        }
    }

    fn push(&mut self, slot: DateTime<Utc>, session: NaiveDate) {
        if session != self.last_session {
            self.sessions += 1;
            self.last_session = session;
        }
        self.last = slot;
        self.slots += 1;
    }

    fn window(&self, calendar: &TradingCalendar, timeframe: Timeframe) -> Option<Window> {
        Window::new(self.first, calendar.slot_end(timeframe, self.last)).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn planner(policy: ChunkPolicy) -> ChunkPlanner {
        ChunkPlanner::new(TradingCalendar::us_equities(), policy)
    }

    fn utc(d: u32, h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, d, h, m, 0).unwrap()
    }

    #[test]
    fn test_daily_lookback_one_chunk_per_session() {
        // Saturday evening UTC; the last five sessions are Mon 4 .. Fri 8.
        let windows = planner(ChunkPolicy::default()).plan_lookback(Timeframe::D1, 5, utc(9, 18, 0));
        assert_eq!(windows.len(), 5);
        assert_eq!(windows[0].start, utc(4, 0, 0));
        assert_eq!(windows[4].end, utc(9, 0, 0));
    }

    #[test]
    fn test_intraday_lookback_one_chunk_per_session() {
        let windows = planner(ChunkPolicy::default()).plan_lookback(Timeframe::M15, 2, utc(9, 18, 0));
        assert_eq!(windows.len(), 2);
        // EST: 09:30-16:00 is 14:30-21:00 UTC.
        assert_eq!(windows[0], Window::new(utc(7, 14, 30), utc(7, 21, 0)).unwrap());
        assert_eq!(windows[1], Window::new(utc(8, 14, 30), utc(8, 21, 0)).unwrap());
    }

    #[test]
    fn test_intraday_multi_session_chunks() {
        let policy = ChunkPolicy {
            intraday_sessions: 2,
            ..ChunkPolicy::default()
        };
        let windows = planner(policy).plan_lookback(Timeframe::H1, 5, utc(9, 18, 0));
        assert_eq!(windows.len(), 3);
        assert_eq!(windows[0], Window::new(utc(4, 14, 30), utc(5, 21, 0)).unwrap());
        assert_eq!(windows[2], Window::new(utc(8, 14, 30), utc(8, 21, 0)).unwrap());
    }

    #[test]
    fn test_weekly_lookback_groups_weeks() {
        // 19 sessions span four weeks; Presidents Day closes 2024-02-19.
        let windows = planner(ChunkPolicy::default()).plan_lookback(Timeframe::W1, 19, utc(9, 18, 0));
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].start, utc(4, 0, 0) - chrono::Duration::weeks(3));
        assert_eq!(windows[0].end, utc(11, 0, 0));
    }

    #[test]
    fn test_gap_windows_split_on_present_slots() {
        let calendar = TradingCalendar::us_equities();
        let date = NaiveDate::from_ymd_opt(2024, 3, 5).unwrap();
        let expected = calendar.session_slots(Timeframe::M15, date);
        assert_eq!(expected.len(), 26);

        // Missing 10:00-10:45 local and the last bar of the day.
        let missing = vec![expected[2], expected[3], expected[4], expected[25]];
        let windows = planner(ChunkPolicy::default()).gap_windows(Timeframe::M15, &missing, &expected);

        assert_eq!(
            windows,
            vec![
                Window::new(utc(5, 15, 0), utc(5, 15, 45)).unwrap(),
                Window::new(utc(5, 20, 45), utc(5, 21, 0)).unwrap(),
            ]
        );
    }

    #[test]
    fn test_gap_windows_respect_daily_policy() {
        let policy = ChunkPolicy {
            daily_slots: 2,
            ..ChunkPolicy::default()
        };
        let calendar = TradingCalendar::us_equities();
        let sessions = calendar.sessions_back(NaiveDate::from_ymd_opt(2024, 3, 8).unwrap(), 5);
        let expected = calendar.slots(Timeframe::D1, &sessions);
        let missing = vec![expected[0], expected[1], expected[2], expected[4]];

        let windows = planner(policy).gap_windows(Timeframe::D1, &missing, &expected);
        assert_eq!(windows.len(), 3);
        assert_eq!(windows[0], Window::new(utc(4, 0, 0), utc(6, 0, 0)).unwrap());
        assert_eq!(windows[1], Window::new(utc(6, 0, 0), utc(7, 0, 0)).unwrap());
        assert_eq!(windows[2], Window::new(utc(8, 0, 0), utc(9, 0, 0)).unwrap());
    }

    #[test]
    fn test_no_gaps_no_windows() {
        let calendar = TradingCalendar::us_equities();
        let sessions = calendar.sessions_back(NaiveDate::from_ymd_opt(2024, 3, 8).unwrap(), 5);
        let expected = calendar.slots(Timeframe::D1, &sessions);
        assert!(planner(ChunkPolicy::default()).gap_windows(Timeframe::D1, &[], &expected).is_empty());
    }
}
