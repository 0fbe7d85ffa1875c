//! Named aggregation periods and their time spans.
//!
//! A [`PeriodTable`] maps a [`Period`] and a record timestamp to a
//! [`TimeSpan`]. Calendar periods are computed in the table's UTC offset
//! with a one second grace, so a timestamp that falls exactly on a boundary
//! belongs to the span that ends there. Weeks start on Sunday.

use std::{fmt, str::FromStr};

use chrono::{
    DateTime, Datelike, Days, FixedOffset, Local, NaiveDate, NaiveDateTime, Offset, Timelike, Utc,
};
use thiserror::Error;

const GRACE: i64 = 1;
const DAY: i64 = 86_400;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PeriodError {
    #[error("Unknown period '{0}'")]
    Unknown(String),

    #[error("Timestamp {0} is out of range")]
    OutOfRange(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Period {
    Hour,
    Day,
    Yesterday,
    Week,
    Month,
    Year,
    Last24Hours,
    Last7Days,
    Last31Days,
    Last366Days,
}

impl Period {
    pub const ALL: [Period; 10] = [
        Period::Hour,
        Period::Day,
        Period::Yesterday,
        Period::Week,
        Period::Month,
        Period::Year,
        Period::Last24Hours,
        Period::Last7Days,
        Period::Last31Days,
        Period::Last366Days,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Period::Hour => "hour",
            Period::Day => "day",
            Period::Yesterday => "yesterday",
            Period::Week => "week",
            Period::Month => "month",
            Period::Year => "year",
            Period::Last24Hours => "last24hours",
            Period::Last7Days => "last7days",
            Period::Last31Days => "last31days",
            Period::Last366Days => "last366days",
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Period {
    type Err = PeriodError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Period::ALL
            .into_iter()
            .find(|period| period.as_str() == s)
            .ok_or_else(|| PeriodError::Unknown(s.to_string()))
    }
}

/// Time span `(start, stop]` in unix epoch seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeSpan {
    pub start: i64,
    pub stop: i64,
}

impl TimeSpan {
    pub fn new(start: i64, stop: i64) -> Self {
        Self { start, stop }
    }

    pub fn contains(&self, ts: i64) -> bool {
        self.start < ts && ts <= self.stop
    }
}

/// Computes period spans in a fixed UTC offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeriodTable {
    offset: FixedOffset,
}

impl Default for PeriodTable {
    fn default() -> Self {
        Self::utc()
    }
}

impl PeriodTable {
    pub fn new(offset: FixedOffset) -> Self {
        Self { offset }
    }

    pub fn utc() -> Self {
        Self::new(Utc.fix())
    }

    /// Uses the host's current UTC offset.
    pub fn local() -> Self {
        Self::new(Local::now().offset().fix())
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    /// Span of `period` anchored at `ts`.
    pub fn span(&self, period: Period, ts: i64) -> Result<TimeSpan, PeriodError> {
        let out_of_range = || PeriodError::OutOfRange(ts);
        let anchor = self.local_time(ts - GRACE)?;
        let date = anchor.date();

        let (start, stop) = match period {
            Period::Hour => {
                let start = date
                    .and_hms_opt(anchor.hour(), 0, 0)
                    .ok_or_else(out_of_range)?;
                let start = self.epoch(start);
                (start, start + 3600)
            }
            Period::Day => self.days(date, 0, 1).ok_or_else(out_of_range)?,
            Period::Yesterday => self.days(date, 1, 1).ok_or_else(out_of_range)?,
            Period::Week => {
                let back = u64::from(date.weekday().num_days_from_sunday());
                self.days(date, back, 7).ok_or_else(out_of_range)?
            }
            Period::Month => {
                let first = NaiveDate::from_ymd_opt(date.year(), date.month(), 1);
                let next = if date.month() == 12 {
                    NaiveDate::from_ymd_opt(date.year() + 1, 1, 1)
                } else {
                    NaiveDate::from_ymd_opt(date.year(), date.month() + 1, 1)
                };
                (
                    self.midnight(first.ok_or_else(out_of_range)?)
                        .ok_or_else(out_of_range)?,
                    self.midnight(next.ok_or_else(out_of_range)?)
                        .ok_or_else(out_of_range)?,
                )
            }
            Period::Year => {
                let first = NaiveDate::from_ymd_opt(date.year(), 1, 1);
                let next = NaiveDate::from_ymd_opt(date.year() + 1, 1, 1);
                (
                    self.midnight(first.ok_or_else(out_of_range)?)
                        .ok_or_else(out_of_range)?,
                    self.midnight(next.ok_or_else(out_of_range)?)
                        .ok_or_else(out_of_range)?,
                )
            }
            Period::Last24Hours => (ts - DAY, ts),
            Period::Last7Days => (self.days_back(ts, 7)?, ts),
            Period::Last31Days => (self.days_back(ts, 31)?, ts),
            Period::Last366Days => (self.days_back(ts, 366)?, ts),
        };

        Ok(TimeSpan::new(start, stop))
    }

    fn local_time(&self, ts: i64) -> Result<NaiveDateTime, PeriodError> {
        DateTime::from_timestamp(ts, 0)
            .map(|utc| utc.with_timezone(&self.offset).naive_local())
            .ok_or(PeriodError::OutOfRange(ts))
    }

    fn epoch(&self, local: NaiveDateTime) -> i64 {
        local.and_utc().timestamp() - i64::from(self.offset.local_minus_utc())
    }

    fn midnight(&self, date: NaiveDate) -> Option<i64> {
        date.and_hms_opt(0, 0, 0).map(|local| self.epoch(local))
    }

    /// `length` whole days starting `back` days before `date`.
    fn days(&self, date: NaiveDate, back: u64, length: u64) -> Option<(i64, i64)> {
        let first = date.checked_sub_days(Days::new(back))?;
        let next = first.checked_add_days(Days::new(length))?;
        Some((self.midnight(first)?, self.midnight(next)?))
    }

    /// Midnight `count` days before the date of `ts`.
    fn days_back(&self, ts: i64, count: u64) -> Result<i64, PeriodError> {
        let date = self.local_time(ts)?.date();
        date.checked_sub_days(Days::new(count))
            .and_then(|first| self.midnight(first))
            .ok_or(PeriodError::OutOfRange(ts))
    }
}
