//! Exchange trading calendar.
//!
//! The calendar answers two questions for the engine: which bar slots *should*
//! exist for a timeframe over a set of sessions (coverage), and which slot a
//! provider timestamp belongs to (normalization).
//!
//! Slot rules:
//!
//! - intraday slots are anchored at the session open and stepped by the timeframe;
//!   the last slot of a session ends at the close
//! - a daily slot is the trading date at 00:00 UTC
//! - a weekly slot is the Monday (00:00 UTC) of any week with a trading day

use std::collections::BTreeSet;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;

use crate::error::{BackfillError, Result};
use crate::timeframe::Timeframe;
use crate::types::Window;

/// Trading sessions and holidays of one exchange.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TradingCalendar {
    tz: Tz,
    open: NaiveTime,
    close: NaiveTime,
    exchange_holidays: bool,
    extra_holidays: BTreeSet<NaiveDate>,
}

impl Default for TradingCalendar {
    fn default() -> Self {
        Self::us_equities()
    }
}

impl TradingCalendar {
    /// US equity markets: New York time, 09:30–16:00, NYSE holiday rules.
    #[must_use]
    pub fn us_equities() -> Self {
        Self {
            tz: chrono_tz::America::New_York,
            open: NaiveTime::from_hms_opt(9, 30, 0).unwrap_or(NaiveTime::MIN),
            close: NaiveTime::from_hms_opt(16, 0, 0).unwrap_or(NaiveTime::MIN),
            exchange_holidays: true,
            extra_holidays: BTreeSet::new(),
        }
    }

    /// Creates a calendar with a custom timezone and regular session.
    ///
    /// # Errors
    /// Returns [`BackfillError::InvalidParameter`] if `open` is not before `close`.
    pub fn new(tz: Tz, open: NaiveTime, close: NaiveTime) -> Result<Self> {
        if open >= close {
            return Err(BackfillError::InvalidParameter(format!(
                "Session open {open} must be before close {close}"
            )));
        }
        Ok(Self {
            tz,
            open,
            close,
            exchange_holidays: true,
            extra_holidays: BTreeSet::new(),
        })
    }

    /// Adds ad-hoc closures on top of the rule-based holidays.
    #[must_use]
    pub fn with_holidays(mut self, holidays: impl IntoIterator<Item = NaiveDate>) -> Self {
        self.extra_holidays.extend(holidays);
        self
    }

    /// Disables the rule-based US exchange holidays.
    #[must_use]
    pub const fn without_exchange_holidays(mut self) -> Self {
        self.exchange_holidays = false;
        self
    }

    /// Returns the exchange timezone.
    #[must_use]
    pub const fn timezone(&self) -> Tz {
        self.tz
    }

    /// Returns true if the exchange is closed all day on `date`.
    #[must_use]
    pub fn is_holiday(&self, date: NaiveDate) -> bool {
        self.extra_holidays.contains(&date)
            || (self.exchange_holidays && us_exchange_holidays(date.year()).contains(&date))
    }

    /// Returns true if `date` has a regular session.
    #[must_use]
    pub fn is_trading_day(&self, date: NaiveDate) -> bool {
        !matches!(date.weekday(), Weekday::Sat | Weekday::Sun) && !self.is_holiday(date)
    }

    /// Returns the exchange-local calendar date of an instant.
    #[must_use]
    pub fn local_date(&self, ts: DateTime<Utc>) -> NaiveDate {
        ts.with_timezone(&self.tz).date_naive()
    }

    /// Returns the instant the regular session would open on `date`.
    #[must_use]
    pub fn open_at(&self, date: NaiveDate) -> Option<DateTime<Utc>> {
        self.local_instant(date, self.open)
    }

    /// Returns the regular session of `date`, or `None` on non-trading days.
    #[must_use]
    pub fn session(&self, date: NaiveDate) -> Option<Window> {
        if !self.is_trading_day(date) {
            return None;
        }
        let start = self.local_instant(date, self.open)?;
        let end = self.local_instant(date, self.close)?;
        Window::new(start, end).ok()
    }

    /// Returns the last `count` trading days on or before `end`, ascending.
    #[must_use]
    pub fn sessions_back(&self, end: NaiveDate, count: usize) -> Vec<NaiveDate> {
        let mut sessions = Vec::with_capacity(count);
        let mut date = end;
        while sessions.len() < count {
            if self.is_trading_day(date) {
                sessions.push(date);
            }
            match date.pred_opt() {
                Some(prev) => date = prev,
                None => break,
            }
        }
        sessions.reverse();
        sessions
    }

    /// Returns every expected slot of `timeframe` over `sessions`, ascending.
    #[must_use]
    pub fn slots(&self, timeframe: Timeframe, sessions: &[NaiveDate]) -> Vec<DateTime<Utc>> {
        let mut slots: Vec<DateTime<Utc>> = sessions
            .iter()
            .flat_map(|date| self.session_slots(timeframe, *date))
            .collect();
        slots.sort();
        slots.dedup();
        slots
    }

    /// Returns the expected slots over `sessions` whose bar has closed by `now`.
    #[must_use]
    pub fn completed_slots(
        &self,
        timeframe: Timeframe,
        sessions: &[NaiveDate],
        now: DateTime<Utc>,
    ) -> Vec<DateTime<Utc>> {
        self.slots(timeframe, sessions)
            .into_iter()
            .filter(|slot| self.slot_end(timeframe, *slot) <= now)
            .collect()
    }

    /// Returns the slots of a single session.
    #[must_use]
    pub fn session_slots(&self, timeframe: Timeframe, date: NaiveDate) -> Vec<DateTime<Utc>> {
        if !self.is_trading_day(date) {
            return Vec::new();
        }
        match timeframe {
            Timeframe::D1 => vec![midnight_utc(date)],
            Timeframe::W1 => vec![midnight_utc(week_start(date))],
            _ => {
                let Some(session) = self.session(date) else {
                    return Vec::new();
                };
                let step = timeframe.step();
                let mut slots = Vec::new();
                let mut slot = session.start;
                while slot < session.end {
                    slots.push(slot);
                    slot += step;
                }
                slots
            }
        }
    }

    /// Returns the exclusive end of the bar starting at `slot`.
    #[must_use]
    pub fn slot_end(&self, timeframe: Timeframe, slot: DateTime<Utc>) -> DateTime<Utc> {
        let natural = slot + timeframe.step();
        if !timeframe.is_intraday() {
            return natural;
        }
        match self.session(self.local_date(slot)) {
            Some(session) => natural.min(session.end),
            None => natural,
        }
    }

    /// Snaps a provider timestamp to the slot it belongs to.
    ///
    /// Returns `None` for intraday timestamps outside the regular session and for
    /// end-of-day timestamps on non-trading days.
    #[must_use]
    pub fn align(&self, timeframe: Timeframe, ts: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match timeframe {
            Timeframe::D1 => {
                let date = ts.date_naive();
                self.is_trading_day(date).then(|| midnight_utc(date))
            }
            Timeframe::W1 => {
                let mut date = ts.date_naive();
                // Some providers start weekly bars on Sunday.
                if date.weekday() == Weekday::Sun {
                    date = date.succ_opt()?;
                }
                Some(midnight_utc(week_start(date)))
            }
            _ => {
                let session = self.session(self.local_date(ts))?;
                if !session.contains(ts) {
                    return None;
                }
                let step = timeframe.step().num_seconds();
                let offset = (ts - session.start).num_seconds();
                Some(session.start + Duration::seconds(offset / step * step))
            }
        }
    }

    fn local_instant(&self, date: NaiveDate, time: NaiveTime) -> Option<DateTime<Utc>> {
        self.tz
            .from_local_datetime(&date.and_time(time))
            .earliest()
            .map(|dt| dt.with_timezone(&Utc))
    }
}

/// Returns `date` at 00:00 UTC.
#[must_use]
pub fn midnight_utc(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN))
}

/// Returns the Monday of the ISO week containing `date`.
#[must_use]
pub fn week_start(date: NaiveDate) -> NaiveDate {
    date - Duration::days(i64::from(date.weekday().num_days_from_monday()))
}

/// Full-day closures of US equity exchanges in `year`.
fn us_exchange_holidays(year: i32) -> Vec<NaiveDate> {
    let mut days = Vec::with_capacity(10);

    // New Year's Day falling on a Saturday is not observed on the prior Friday.
    if let Some(new_year) = NaiveDate::from_ymd_opt(year, 1, 1) {
        match new_year.weekday() {
            Weekday::Sat => {}
            Weekday::Sun => days.extend(new_year.succ_opt()),
            _ => days.push(new_year),
        }
    }

    days.extend(nth_weekday(year, 1, Weekday::Mon, 3));
    days.extend(nth_weekday(year, 2, Weekday::Mon, 3));
    days.extend(easter_sunday(year).map(|easter| easter - Duration::days(2)));
    days.extend(last_weekday(year, 5, Weekday::Mon));
    if year >= 2022 {
        days.extend(NaiveDate::from_ymd_opt(year, 6, 19).map(observed));
    }
    days.extend(NaiveDate::from_ymd_opt(year, 7, 4).map(observed));
    days.extend(nth_weekday(year, 9, Weekday::Mon, 1));
    days.extend(nth_weekday(year, 11, Weekday::Thu, 4));
    days.extend(NaiveDate::from_ymd_opt(year, 12, 25).map(observed));
    days
}

fn observed(date: NaiveDate) -> NaiveDate {
    match date.weekday() {
        Weekday::Sat => date - Duration::days(1),
        Weekday::Sun => date + Duration::days(1),
        _ => date,
    }
}

fn nth_weekday(year: i32, month: u32, weekday: Weekday, n: u32) -> Option<NaiveDate> {
    let first = NaiveDate::from_ymd_opt(year, month, 1)?;
    let offset = (7 + weekday.num_days_from_monday() - first.weekday().num_days_from_monday()) % 7;
    first.checked_add_signed(Duration::days(i64::from(offset + 7 * (n - 1))))
}

fn last_weekday(year: i32, month: u32, weekday: Weekday) -> Option<NaiveDate> {
    let next_month = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)?
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)?
    };
    let last = next_month.pred_opt()?;
    let back = (7 + last.weekday().num_days_from_monday() - weekday.num_days_from_monday()) % 7;
    Some(last - Duration::days(i64::from(back)))
}

/// Anonymous Gregorian computus.
fn easter_sunday(year: i32) -> Option<NaiveDate> {
    let a = year % 19;
    let b = year / 100;
    let c = year % 100;
    let d = b / 4;
    let e = b % 4;
    let f = (b + 8) / 25;
    let g = (b - f + 1) / 3;
    let h = (19 * a + b - d - g + 15) % 30;
    let i = c / 4;
    let k = c % 4;
    let l = (32 + 2 * e + 2 * i - h - k) % 7;
    let m = (a + 11 * h + 22 * l) / 451;
    let month = (h + l - 7 * m + 114) / 31;
    let day = (h + l - 7 * m + 114) % 31 + 1;
    NaiveDate::from_ymd_opt(year, u32::try_from(month).ok()?, u32::try_from(day).ok()?)
}
