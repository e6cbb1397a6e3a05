//! Parallel per-account fetching with the partial-failure policy.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono_tz::Tz;
use duet_auth::{AccountKind, TokenProvider};
use tokio::task::JoinSet;

use crate::cache::{CacheKey, CachedRange};
use crate::client::CalendarApi;
use crate::error::{CalendarError, SyncFailure};
use crate::flight::SingleFlight;
use crate::range::DateRange;
use crate::types::Event;

pub type AccountResult = Result<CachedRange, CalendarError>;

/// Results of one fetch, one entry per account that was attempted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchOutcome {
    pub results: BTreeMap<AccountKind, AccountResult>,
}

impl FetchOutcome {
    pub fn attempted(&self) -> impl Iterator<Item = AccountKind> + '_ {
        self.results.keys().copied()
    }

    pub fn successes(&self) -> impl Iterator<Item = (AccountKind, &CachedRange)> {
        self.results
            .iter()
            .filter_map(|(kind, result)| result.as_ref().ok().map(|data| (*kind, data)))
    }

    pub fn errors(&self) -> impl Iterator<Item = (AccountKind, &CalendarError)> {
        self.results
            .iter()
            .filter_map(|(kind, result)| result.as_ref().err().map(|err| (*kind, err)))
    }

    /// The error to surface, if any.
    ///
    /// Only when every attempted account failed: a lone account's own
    /// error, or an aggregate when several were attempted. One account
    /// failing while another succeeds surfaces nothing.
    pub fn failure(&self) -> Option<SyncFailure> {
        if self.results.is_empty() {
            return None;
        }

        let errors: Vec<(AccountKind, CalendarError)> = self
            .errors()
            .map(|(kind, err)| (kind, err.clone()))
            .collect();

        if errors.len() < self.results.len() {
            return None;
        }

        match errors.as_slice() {
            [(kind, err)] => Some(SyncFailure::Account(*kind, err.clone())),
            _ => Some(SyncFailure::AllAccounts(errors)),
        }
    }
}

/// Issues per-account fetches against the remote API.
///
/// Every per-account fetch goes through a single-flight guard keyed by
/// `(account, range)`, so overlapping callers share one request.
pub struct FetchCoordinator {
    api: Arc<dyn CalendarApi>,
    tokens: Arc<dyn TokenProvider>,
    tz: Tz,
    flight: SingleFlight<CacheKey, AccountResult>,
}

impl FetchCoordinator {
    pub fn new(api: Arc<dyn CalendarApi>, tokens: Arc<dyn TokenProvider>, tz: Tz) -> Self {
        Self {
            api,
            tokens,
            tz,
            flight: SingleFlight::new(),
        }
    }

    pub fn tokens(&self) -> &Arc<dyn TokenProvider> {
        &self.tokens
    }

    /// Whether a fetch for `key` is currently running.
    pub fn is_in_flight(&self, key: &CacheKey) -> bool {
        self.flight.is_in_flight(key)
    }

    /// Fetch every requested account in parallel and wait for all of them.
    pub async fn fetch(self: &Arc<Self>, accounts: &[AccountKind], range: DateRange) -> FetchOutcome {
        let requested: BTreeSet<AccountKind> = accounts.iter().copied().collect();
        let mut tasks = JoinSet::new();

        for kind in requested.iter().copied() {
            let this = Arc::clone(self);
            tasks.spawn(async move { (kind, this.fetch_account(kind, range).await) });
        }

        let mut outcome = FetchOutcome::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((kind, result)) => {
                    if let Err(e) = &result {
                        tracing::warn!("Fetch for {} account failed: {}", kind, e);
                    }
                    outcome.results.insert(kind, result);
                }
                Err(e) => tracing::error!("Account fetch task failed: {}", e),
            }
        }

        for kind in requested {
            outcome
                .results
                .entry(kind)
                .or_insert_with(|| Err(CalendarError::Transport("fetch task aborted".to_string())));
        }

        outcome
    }

    /// Fetch one account's calendars and events for `range`.
    ///
    /// Joins an identical fetch already in flight instead of issuing a new one.
    pub async fn fetch_account(self: &Arc<Self>, kind: AccountKind, range: DateRange) -> AccountResult {
        let key = CacheKey::new(kind, &range);
        let this = Arc::clone(self);
        self.flight
            .run(key, move || async move { this.fetch_uncoalesced(kind, range).await })
            .await
    }

    async fn fetch_uncoalesced(&self, kind: AccountKind, range: DateRange) -> AccountResult {
        let token = self.tokens.access_token(kind).await.map_err(|e| {
            tracing::warn!("No credential for {} account: {}", kind, e);
            CalendarError::from(e)
        })?;

        let calendars = self.api.list_calendars(kind, &token).await?;
        let (time_min, time_max) = range.bounds(self.tz);

        let mut tasks = JoinSet::new();
        for (index, calendar) in calendars.iter().enumerate() {
            let api = Arc::clone(&self.api);
            let token = token.clone();
            let calendar_id = calendar.id.clone();
            tasks.spawn(async move {
                let result = api
                    .list_events(&token, &calendar_id, time_min, time_max)
                    .await;
                (index, result)
            });
        }

        let mut per_calendar: Vec<Vec<Event>> = vec![Vec::new(); calendars.len()];
        while let Some(joined) = tasks.join_next().await {
            let (index, result) =
                joined.map_err(|e| CalendarError::Transport(format!("event fetch task failed: {}", e)))?;
            per_calendar[index] = result?;
        }

        let mut events: Vec<Event> = per_calendar.into_iter().flatten().collect();
        // Stable; events without a start go last.
        events.sort_by_key(|e| {
            let start = e.start_instant(self.tz);
            (start.is_none(), start)
        });

        tracing::debug!(
            "Fetched {} events from {} calendars for {} account ({})",
            events.len(),
            calendars.len(),
            kind,
            range
        );

        Ok(CachedRange { calendars, events })
    }
}
