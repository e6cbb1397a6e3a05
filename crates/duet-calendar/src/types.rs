//! Calendar API types and data structures.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use duet_auth::AccountKind;
use serde::{Deserialize, Serialize};

/// Calendar event as fetched from the remote API.
///
/// Immutable once fetched. A boundary that could not be parsed is `None`;
/// such events stay in flat lists but are never placed into day buckets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub calendar_id: String,
    pub title: String,
    pub description: Option<String>,
    pub location: Option<String>,
    pub start: Option<EventTime>,
    /// Exclusive for all-day events, as reported by the server.
    pub end: Option<EventTime>,
    pub recurring_event_id: Option<String>,
    #[serde(default)]
    pub recurrence: Vec<String>,
    #[serde(default)]
    pub status: EventStatus,
    pub html_link: Option<String>,
}

/// Event time - can be a specific datetime or an all-day date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventTime {
    DateTime(DateTime<Utc>),
    Date(NaiveDate),
}

impl EventTime {
    /// Absolute instant; dates resolve to local midnight in `tz`.
    pub fn instant(&self, tz: Tz) -> DateTime<Utc> {
        match self {
            EventTime::DateTime(dt) => *dt,
            EventTime::Date(d) => local_midnight(*d, tz),
        }
    }

    /// Calendar day in `tz`.
    pub fn day(&self, tz: Tz) -> NaiveDate {
        match self {
            EventTime::DateTime(dt) => dt.with_timezone(&tz).date_naive(),
            EventTime::Date(d) => *d,
        }
    }

    pub fn is_date(&self) -> bool {
        matches!(self, EventTime::Date(_))
    }
}

/// Start of `date` in `tz` as a UTC instant.
///
/// Falls back to UTC midnight when local midnight does not exist (DST gap).
pub fn local_midnight(date: NaiveDate, tz: Tz) -> DateTime<Utc> {
    let naive = date.and_time(NaiveTime::MIN);
    tz.from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|| Utc.from_utc_datetime(&naive))
}

impl Event {
    /// An event is all-day iff both boundaries are date-only.
    pub fn is_all_day(&self) -> bool {
        matches!(
            (&self.start, &self.end),
            (Some(EventTime::Date(_)), Some(EventTime::Date(_)))
        )
    }

    pub fn start_instant(&self, tz: Tz) -> Option<DateTime<Utc>> {
        self.start.map(|t| t.instant(tz))
    }

    pub fn end_instant(&self, tz: Tz) -> Option<DateTime<Utc>> {
        self.end.map(|t| t.instant(tz))
    }
}

/// Event status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum EventStatus {
    #[default]
    Confirmed,
    Tentative,
    Cancelled,
}

/// Calendar metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Calendar {
    pub id: String,
    pub summary: String,
    pub account: AccountKind,
    pub time_zone: Option<String>,
    pub background_color: Option<String>,
    pub is_primary: bool,
    pub access_role: AccessRole,
}

/// Calendar access role.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum AccessRole {
    Owner,
    Writer,
    #[default]
    Reader,
    FreeBusyReader,
}

// API Response Types

/// Google Calendar API event response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiEvent {
    pub id: String,
    pub summary: Option<String>,
    pub description: Option<String>,
    pub location: Option<String>,
    pub start: Option<ApiEventTime>,
    pub end: Option<ApiEventTime>,
    pub recurring_event_id: Option<String>,
    #[serde(default)]
    pub recurrence: Vec<String>,
    pub status: Option<String>,
    pub html_link: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiEventTime {
    pub date_time: Option<String>,
    pub date: Option<String>,
    pub time_zone: Option<String>,
}

/// API response for event list.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventListResponse {
    #[serde(default)]
    pub items: Vec<ApiEvent>,
    pub next_page_token: Option<String>,
}

/// API response for calendar list.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalendarListResponse {
    #[serde(default)]
    pub items: Vec<ApiCalendar>,
    pub next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiCalendar {
    pub id: String,
    pub summary: Option<String>,
    pub summary_override: Option<String>,
    pub time_zone: Option<String>,
    pub background_color: Option<String>,
    #[serde(default)]
    pub primary: bool,
    pub access_role: Option<String>,
}

impl Event {
    /// Convert API response to local Event.
    ///
    /// Offset-less datetimes are read in the event's own timezone, or in
    /// `fallback_tz` when it names none.
    pub fn from_api(api: ApiEvent, calendar_id: &str, fallback_tz: Tz) -> Self {
        let status = match api.status.as_deref() {
            Some("tentative") => EventStatus::Tentative,
            Some("cancelled") => EventStatus::Cancelled,
            _ => EventStatus::Confirmed,
        };

        Self {
            id: api.id,
            calendar_id: calendar_id.to_string(),
            title: api.summary.unwrap_or_default(),
            description: api.description,
            location: api.location,
            start: api.start.as_ref().and_then(|t| parse_event_time(t, fallback_tz)),
            end: api.end.as_ref().and_then(|t| parse_event_time(t, fallback_tz)),
            recurring_event_id: api.recurring_event_id,
            recurrence: api.recurrence,
            status,
            html_link: api.html_link,
        }
    }
}

impl Calendar {
    pub fn from_api(api: ApiCalendar, account: AccountKind) -> Self {
        let access_role = match api.access_role.as_deref() {
            Some("owner") => AccessRole::Owner,
            Some("writer") => AccessRole::Writer,
            Some("freeBusyReader") => AccessRole::FreeBusyReader,
            _ => AccessRole::Reader,
        };

        Self {
            id: api.id,
            summary: api.summary_override.or(api.summary).unwrap_or_default(),
            account,
            time_zone: api.time_zone,
            background_color: api.background_color,
            is_primary: api.primary,
            access_role,
        }
    }
}

fn parse_event_time(api: &ApiEventTime, fallback_tz: Tz) -> Option<EventTime> {
    if let Some(dt_str) = &api.date_time {
        if let Ok(dt) = DateTime::parse_from_rfc3339(dt_str) {
            return Some(EventTime::DateTime(dt.with_timezone(&Utc)));
        }
        let tz = api
            .time_zone
            .as_deref()
            .and_then(|name| name.parse::<Tz>().ok())
            .unwrap_or(fallback_tz);
        return NaiveDateTime::parse_from_str(dt_str, "%Y-%m-%dT%H:%M:%S%.f")
            .ok()
            .and_then(|naive| tz.from_local_datetime(&naive).earliest())
            .map(|dt| EventTime::DateTime(dt.with_timezone(&Utc)));
    }
    if let Some(date_str) = &api.date {
        return NaiveDate::parse_from_str(date_str, "%Y-%m-%d")
            .ok()
            .map(EventTime::Date);
    }
    None
}
