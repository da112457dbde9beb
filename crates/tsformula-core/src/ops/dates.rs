//! Timestamp helpers behind the date operators, `resample` and `constant`.

use std::sync::LazyLock;

use chrono::{DateTime, Datelike, Months, NaiveDate, NaiveDateTime, TimeDelta, Timelike};
use regex::Regex;

static FREQ_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([0-9]*)(MS|min|D|H|h|T)$").unwrap());

static OFFSET_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([+-])([0-9]{2}):?([0-9]{2})$").unwrap());

/// A regular calendar grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frequency {
    Minutes(i64),
    Hours(i64),
    Days(i64),
    MonthStart,
}

impl Frequency {
    /// Parse a pandas-style alias: `D`, `H`, `T`/`min`, `MS`, optionally
    /// prefixed by a multiple (`15min`, `2D`).
    pub fn parse(text: &str) -> Option<Frequency> {
        let caps = FREQ_RE.captures(text.trim())?;
        let n = match caps.get(1).map(|m| m.as_str()) {
            Some("") | None => 1,
            Some(digits) => digits.parse::<i64>().ok()?,
        };
        if n < 1 {
            return None;
        }
        match &caps[2] {
            "MS" if n == 1 => Some(Frequency::MonthStart),
            "MS" => None,
            "min" | "T" => Some(Frequency::Minutes(n)),
            "H" | "h" => Some(Frequency::Hours(n)),
            _ => Some(Frequency::Days(n)),
        }
    }

    fn step_seconds(self) -> Option<i64> {
        match self {
            Frequency::Minutes(n) => Some(n * 60),
            Frequency::Hours(n) => Some(n * 3_600),
            Frequency::Days(n) => Some(n * 86_400),
            Frequency::MonthStart => None,
        }
    }

    /// Start of the bucket containing `ts` (fixed steps count from the Unix
    /// epoch).
    pub fn floor(self, ts: NaiveDateTime) -> NaiveDateTime {
        match self.step_seconds() {
            Some(step) => {
                let secs = ts.and_utc().timestamp();
                let floored = secs - secs.rem_euclid(step);
                DateTime::from_timestamp(floored, 0)
                    .map(|dt| dt.naive_utc())
                    .unwrap_or(ts)
            }
            None => start_of_month(ts),
        }
    }

    /// The grid point following `ts`.
    pub fn next(self, ts: NaiveDateTime) -> Option<NaiveDateTime> {
        match self.step_seconds() {
            Some(step) => ts.checked_add_signed(TimeDelta::seconds(step)),
            None => start_of_month(ts).checked_add_months(Months::new(1)),
        }
    }

    /// First grid point at or after `ts`.
    pub fn ceil(self, ts: NaiveDateTime) -> Option<NaiveDateTime> {
        let floor = self.floor(ts);
        if floor == ts {
            Some(ts)
        } else {
            self.next(floor)
        }
    }
}

pub fn start_of_month(ts: NaiveDateTime) -> NaiveDateTime {
    ts.date()
        .with_day(1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .unwrap_or(ts)
}

/// Same time of day on the last day of the month.
pub fn end_of_month(ts: NaiveDateTime) -> NaiveDateTime {
    let first = NaiveDate::from_ymd_opt(ts.year(), ts.month(), 1);
    first
        .and_then(|d| d.checked_add_months(Months::new(1)))
        .and_then(|d| d.pred_opt())
        .and_then(|d| d.and_hms_nano_opt(ts.hour(), ts.minute(), ts.second(), ts.nanosecond()))
        .unwrap_or(ts)
}

/// Calendar shift: months move by calendar (clamping the day), the rest by
/// fixed durations.
pub fn shift(ts: NaiveDateTime, months: i64, delta: TimeDelta) -> Option<NaiveDateTime> {
    let moved = if months >= 0 {
        ts.checked_add_months(Months::new(u32::try_from(months).ok()?))?
    } else {
        ts.checked_sub_months(Months::new(u32::try_from(-months).ok()?))?
    };
    moved.checked_add_signed(delta)
}

pub fn duration(weeks: i64, days: i64, hours: i64, minutes: i64) -> Option<TimeDelta> {
    TimeDelta::try_weeks(weeks)?
        .checked_add(&TimeDelta::try_days(days)?)?
        .checked_add(&TimeDelta::try_hours(hours)?)?
        .checked_add(&TimeDelta::try_minutes(minutes)?)
}

/// UTC offset of a `#:tz` value: `UTC`, `Z`, or `+HH:MM` / `-HHMM`.
pub fn utc_offset(tz: &str) -> Option<TimeDelta> {
    let tz = tz.trim();
    if tz.eq_ignore_ascii_case("utc") || tz == "Z" {
        return Some(TimeDelta::zero());
    }
    let caps = OFFSET_RE.captures(tz)?;
    let hours: i64 = caps[2].parse().ok()?;
    let minutes: i64 = caps[3].parse().ok()?;
    if hours > 23 || minutes > 59 {
        return None;
    }
    let offset = TimeDelta::try_minutes(hours * 60 + minutes)?;
    Some(if &caps[1] == "-" { -offset } else { offset })
}
