//! Google Calendar API client.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use chrono_tz::Tz;
use duet_auth::AccountKind;
use duet_core::ApiConfig;
use tracing::instrument;

use crate::error::CalendarError;
use crate::retry::{self, with_retry, RetryConfig};
use crate::types::*;

pub const CALENDAR_API_BASE: &str = "https://www.googleapis.com/calendar/v3";

/// Upper bound on followed `nextPageToken`s per listing.
const MAX_PAGES: usize = 100;

/// Remote calendar operations the engine depends on.
#[async_trait]
pub trait CalendarApi: Send + Sync {
    /// Calendars visible to the account owning `token`.
    async fn list_calendars(
        &self,
        account: AccountKind,
        token: &str,
    ) -> Result<Vec<Calendar>, CalendarError>;

    /// Events of one calendar overlapping `[time_min, time_max)`, recurring
    /// series expanded into single occurrences, ordered by start.
    async fn list_events(
        &self,
        token: &str,
        calendar_id: &str,
        time_min: DateTime<Utc>,
        time_max: DateTime<Utc>,
    ) -> Result<Vec<Event>, CalendarError>;
}

pub struct CalendarClient {
    client: reqwest::Client,
    base_url: String,
    retry: RetryConfig,
    fallback_tz: Tz,
}

impl CalendarClient {
    pub fn new(
        base_url: &str,
        timeout: Duration,
        retry: RetryConfig,
        fallback_tz: Tz,
    ) -> Result<Self, CalendarError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            retry,
            fallback_tz,
        })
    }

    pub fn from_config(config: &ApiConfig, fallback_tz: Tz) -> Result<Self, CalendarError> {
        let retry = RetryConfig {
            max_retries: config.max_retries,
            ..RetryConfig::default()
        };
        Self::new(&config.base_url, config.timeout(), retry, fallback_tz)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        token: &str,
    ) -> Result<T, CalendarError> {
        let response = with_retry(&self.retry, || {
            self.client.get(url).bearer_auth(token).send()
        })
        .await?;

        self.handle_response(response).await
    }

    /// Decode a success body or map the status to a `CalendarError`.
    async fn handle_response<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, CalendarError> {
        let status = response.status();

        if status.is_success() {
            return response
                .json()
                .await
                .map_err(|e| CalendarError::Decode(e.to_string()));
        }

        let retry_after = retry::retry_after(&response);
        let body = response.text().await.unwrap_or_default();
        tracing::debug!("Calendar API returned {}: {}", status, body);
        Err(CalendarError::from_status(status, retry_after, body))
    }
}

fn format_instant(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[async_trait]
impl CalendarApi for CalendarClient {
    #[instrument(skip(self, token), level = "info")]
    async fn list_calendars(
        &self,
        account: AccountKind,
        token: &str,
    ) -> Result<Vec<Calendar>, CalendarError> {
        let mut calendars = Vec::new();
        let mut page_token: Option<String> = None;

        for _ in 0..MAX_PAGES {
            let mut url = format!("{}/users/me/calendarList", self.base_url);
            if let Some(pt) = &page_token {
                url.push_str(&format!("?pageToken={}", urlencoding::encode(pt)));
            }

            let page: CalendarListResponse = self.get_json(&url, token).await?;
            calendars.extend(
                page.items
                    .into_iter()
                    .map(|api| Calendar::from_api(api, account)),
            );

            match page.next_page_token {
                Some(next) if !next.is_empty() => page_token = Some(next),
                _ => return Ok(calendars),
            }
        }

        tracing::warn!("Calendar list exceeded {} pages, truncating", MAX_PAGES);
        Ok(calendars)
    }

    #[instrument(skip(self, token), level = "info")]
    async fn list_events(
        &self,
        token: &str,
        calendar_id: &str,
        time_min: DateTime<Utc>,
        time_max: DateTime<Utc>,
    ) -> Result<Vec<Event>, CalendarError> {
        let base = format!(
            "{}/calendars/{}/events?timeMin={}&timeMax={}&singleEvents=true&orderBy=startTime&maxResults=250",
            self.base_url,
            urlencoding::encode(calendar_id),
            urlencoding::encode(&format_instant(time_min)),
            urlencoding::encode(&format_instant(time_max)),
        );

        let mut events = Vec::new();
        let mut page_token: Option<String> = None;

        for _ in 0..MAX_PAGES {
            let url = match &page_token {
                Some(pt) => format!("{}&pageToken={}", base, urlencoding::encode(pt)),
                None => base.clone(),
            };

            let page: EventListResponse = self.get_json(&url, token).await?;
            events.extend(
                page.items
                    .into_iter()
                    .map(|api| Event::from_api(api, calendar_id, self.fallback_tz)),
            );

            match page.next_page_token {
                Some(next) if !next.is_empty() => page_token = Some(next),
                _ => return Ok(events),
            }
        }

        tracing::warn!(
            "Event list for {} exceeded {} pages, truncating",
            calendar_id,
            MAX_PAGES
        );
        Ok(events)
    }
}
