//! Day, week and month ranges used as the unit of fetching and caching.

use chrono::{DateTime, Datelike, Days, Months, NaiveDate, Utc};
use chrono_tz::Tz;
use duet_core::WeekStart;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::local_midnight;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RangeKind {
    Day,
    Week,
    Month,
}

/// A normalized date range; both bounds are inclusive calendar days.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DateRange {
    pub kind: RangeKind,
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    /// The day, week or month containing `date`.
    pub fn containing(kind: RangeKind, date: NaiveDate, week_start: WeekStart) -> Self {
        match kind {
            RangeKind::Day => Self {
                kind,
                start: date,
                end: date,
            },
            RangeKind::Week => {
                let offset = match week_start {
                    WeekStart::Monday => date.weekday().num_days_from_monday(),
                    WeekStart::Sunday => date.weekday().num_days_from_sunday(),
                };
                let start = date - Days::new(u64::from(offset));
                Self {
                    kind,
                    start,
                    end: start + Days::new(6),
                }
            }
            RangeKind::Month => {
                let start = date.with_day(1).unwrap_or(date);
                let end = start
                    .checked_add_months(Months::new(1))
                    .and_then(|next| next.pred_opt())
                    .unwrap_or(start);
                Self { kind, start, end }
            }
        }
    }

    pub fn len_days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    /// The range of the same kind immediately after this one.
    pub fn next(&self) -> Self {
        self.shift(1)
    }

    /// The range of the same kind immediately before this one.
    pub fn previous(&self) -> Self {
        self.shift(-1)
    }

    /// Move by `steps` units of this range's kind.
    pub fn shift(&self, steps: i32) -> Self {
        match self.kind {
            RangeKind::Day | RangeKind::Week => {
                let delta = self.len_days() * i64::from(steps);
                let move_by = |d: NaiveDate| {
                    if delta >= 0 {
                        d.checked_add_days(Days::new(delta.unsigned_abs()))
                    } else {
                        d.checked_sub_days(Days::new(delta.unsigned_abs()))
                    }
                    .unwrap_or(d)
                };
                Self {
                    kind: self.kind,
                    start: move_by(self.start),
                    end: move_by(self.end),
                }
            }
            RangeKind::Month => {
                let months = Months::new(steps.unsigned_abs());
                let start = if steps >= 0 {
                    self.start.checked_add_months(months)
                } else {
                    self.start.checked_sub_months(months)
                }
                .unwrap_or(self.start);
                Self::containing(RangeKind::Month, start, WeekStart::Monday)
            }
        }
    }

    /// UTC query window `[start 00:00, (end + 1) 00:00)` in `tz`.
    pub fn bounds(&self, tz: Tz) -> (DateTime<Utc>, DateTime<Utc>) {
        let after = self.end.succ_opt().unwrap_or(self.end);
        (local_midnight(self.start, tz), local_midnight(after, tz))
    }

    /// Every day of the range, in order.
    pub fn days(&self) -> impl Iterator<Item = NaiveDate> {
        self.start.iter_days().take_while({
            let end = self.end;
            move |d| *d <= end
        })
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start.format("%Y-%m-%d"), self.end.format("%Y-%m-%d"))
    }
}
