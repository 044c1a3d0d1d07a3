//! Time ranges and reporting-period normalization.

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

/// Days between 0001-01-01 (CE day 1) and the Unix epoch.
const UNIX_EPOCH_CE_DAYS: i32 = 719_163;

/// A half-open-ended date window. Either endpoint may be unset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub since: Option<NaiveDate>,
    pub until: Option<NaiveDate>,
}

impl TimeRange {
    pub fn new(since: Option<NaiveDate>, until: Option<NaiveDate>) -> Self {
        Self { since, until }
    }

    pub fn between(since: NaiveDate, until: NaiveDate) -> Self {
        Self {
            since: Some(since),
            until: Some(until),
        }
    }

    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn is_unbounded(&self) -> bool {
        self.since.is_none() && self.until.is_none()
    }

    /// Whether `date` falls inside the window (inclusive on both ends).
    pub fn contains(&self, date: NaiveDate) -> bool {
        self.since.map_or(true, |s| date >= s) && self.until.map_or(true, |u| date <= u)
    }

    /// Order the endpoints so that `since <= until` when both are set.
    pub fn narrowed(&self) -> Self {
        match (self.since, self.until) {
            (Some(s), Some(u)) if s > u => Self::between(u, s),
            _ => *self,
        }
    }
}

/// Reporting cadence of a series.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DurationClass {
    #[default]
    None,
    Irregular,
    Daily,
    Quarterly,
    Annual,
}

impl DurationClass {
    /// Floor `date` to the last completed period end at or before it.
    ///
    /// Quarterly data dated 2024-08-15 normalizes to 2024-06-30, so two
    /// dates inside the same open quarter compare equal.
    pub fn normalize(&self, date: NaiveDate) -> NaiveDate {
        match self {
            DurationClass::None | DurationClass::Irregular | DurationClass::Daily => date,
            DurationClass::Quarterly => {
                let quarter_end_month = (date.month() - 1) / 3 * 3 + 3;
                let end = last_day_of_month(date.year(), quarter_end_month);
                if end <= date {
                    end
                } else if quarter_end_month == 3 {
                    last_day_of_month(date.year() - 1, 12)
                } else {
                    last_day_of_month(date.year(), quarter_end_month - 3)
                }
            }
            DurationClass::Annual => {
                let end = last_day_of_month(date.year(), 12);
                if end <= date {
                    end
                } else {
                    last_day_of_month(date.year() - 1, 12)
                }
            }
        }
    }
}

fn last_day_of_month(year: i32, month: u32) -> NaiveDate {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|d| d.pred_opt())
        .unwrap_or(NaiveDate::MAX)
}

/// Days since 1970-01-01, the physical representation of a polars `Date`.
pub fn date_to_days(date: NaiveDate) -> i32 {
    date.num_days_from_ce() - UNIX_EPOCH_CE_DAYS
}

pub fn days_to_date(days: i32) -> Option<NaiveDate> {
    NaiveDate::from_num_days_from_ce_opt(days + UNIX_EPOCH_CE_DAYS)
}
