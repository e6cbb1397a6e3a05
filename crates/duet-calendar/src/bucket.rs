//! Expansion of events into the calendar days they occupy.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use chrono_tz::Tz;

use crate::types::{Event, EventTime};

/// Events spanning more days than this are kept out of the day index.
pub const MAX_SPAN_DAYS: i64 = 3660;

/// Day → events occupying that day, each list in display order.
///
/// Derived from a flat event list; never persisted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DayIndex {
    days: BTreeMap<NaiveDate, Vec<Event>>,
}

impl DayIndex {
    /// Events on `date`, empty when nothing occupies it.
    pub fn get(&self, date: NaiveDate) -> &[Event] {
        self.days.get(&date).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.days.is_empty()
    }

    /// Number of non-empty days.
    pub fn len(&self) -> usize {
        self.days.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NaiveDate, &Vec<Event>)> {
        self.days.iter()
    }
}

/// First and last (inclusive) day an event occupies in `tz`.
///
/// All-day ends are exclusive on the wire, so the last day is the day
/// before the end, unless that would precede the start. Returns `None`
/// when a boundary is unresolved or the span is implausibly long.
pub fn event_days(event: &Event, tz: Tz) -> Option<(NaiveDate, NaiveDate)> {
    let (start, end) = match (event.start, event.end) {
        (Some(start), Some(end)) => (start, end),
        _ => return None,
    };

    let first = start.day(tz);
    let last = match (start, end) {
        (EventTime::Date(_), EventTime::Date(exclusive_end)) => {
            if exclusive_end > first {
                exclusive_end.pred_opt()?
            } else {
                first
            }
        }
        _ => end.day(tz).max(first),
    };

    if (last - first).num_days() > MAX_SPAN_DAYS {
        tracing::warn!(
            event_id = %event.id,
            "Event spans more than {} days, not bucketing",
            MAX_SPAN_DAYS
        );
        return None;
    }

    Some((first, last))
}

/// Sort by start instant, then end instant; equal keys keep their order.
pub fn sort_events(events: &mut [Event], tz: Tz) {
    events.sort_by_key(|e| (e.start_instant(tz), e.end_instant(tz)));
}

/// Build the day index for `events`.
///
/// Pure: the same list always yields the same index.
pub fn bucket(events: &[Event], tz: Tz) -> DayIndex {
    let mut days: BTreeMap<NaiveDate, Vec<Event>> = BTreeMap::new();

    for event in events {
        let Some((first, last)) = event_days(event, tz) else {
            continue;
        };
        for day in first.iter_days().take_while(|d| *d <= last) {
            days.entry(day).or_default().push(event.clone());
        }
    }

    for bucket in days.values_mut() {
        sort_events(bucket, tz);
    }

    DayIndex { days }
}
