//! Range loading façade over the cache, fetcher, bucketer and prefetcher.
//!
//! State is published through a `watch` channel: each load commits one
//! immutable [`SyncSnapshot`], so readers never see a half-applied load.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use chrono_tz::Tz;
use duet_auth::{AccountKind, TokenProvider};
use duet_core::{Config, ConfigError, SyncConfig, WeekStart};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::bucket::{bucket, sort_events, DayIndex};
use crate::cache::{CacheKey, CacheStore, CachedRange};
use crate::client::{CalendarApi, CalendarClient};
use crate::error::SyncFailure;
use crate::fetch::{FetchCoordinator, FetchOutcome};
use crate::prefetch::PrefetchScheduler;
use crate::range::{DateRange, RangeKind};
use crate::store::BlobStore;
use crate::types::{Calendar, Event};

/// Presentation state of one range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadStatus {
    #[default]
    Idle,
    Loading,
    Loaded,
    /// Some accounts failed but at least one succeeded or came from cache.
    PartialLoaded,
    Failed,
}

/// Everything the presentation layer observes, committed atomically.
#[derive(Debug, Clone, Default)]
pub struct SyncSnapshot {
    pub range: Option<DateRange>,
    pub events: BTreeMap<AccountKind, Vec<Event>>,
    pub calendars: BTreeMap<AccountKind, Vec<Calendar>>,
    pub days: BTreeMap<AccountKind, DayIndex>,
    pub is_loading: bool,
    /// Debounced, user-facing error text.
    pub error: Option<String>,
    pub status: LoadStatus,
    /// Incremented on every commit.
    pub revision: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoadOutcome {
    pub range: DateRange,
    pub status: LoadStatus,
    pub failure: Option<SyncFailure>,
    /// False when a later load started before this one finished.
    pub published: bool,
}

#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub tz: Tz,
    pub week_start: WeekStart,
    pub error_debounce: Duration,
    pub prefetch: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            tz: Tz::UTC,
            week_start: WeekStart::Monday,
            error_debounce: Duration::from_millis(2500),
            prefetch: true,
        }
    }
}

impl SyncSettings {
    pub fn from_config(config: &SyncConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            tz: config.tz()?,
            week_start: config.week_start,
            error_debounce: config.error_debounce(),
            prefetch: config.prefetch,
        })
    }
}

pub struct SyncController {
    coordinator: Arc<FetchCoordinator>,
    cache: Arc<CacheStore>,
    prefetch: PrefetchScheduler,
    settings: SyncSettings,
    state: Arc<watch::Sender<SyncSnapshot>>,
    statuses: Mutex<HashMap<DateRange, LoadStatus>>,
    generation: AtomicU64,
    error_timer: Mutex<Option<CancellationToken>>,
}

impl SyncController {
    pub fn new(
        api: Arc<dyn CalendarApi>,
        tokens: Arc<dyn TokenProvider>,
        cache: Arc<CacheStore>,
        settings: SyncSettings,
    ) -> Self {
        let coordinator = Arc::new(FetchCoordinator::new(api, tokens, settings.tz));
        let prefetch = PrefetchScheduler::new(Arc::clone(&coordinator), Arc::clone(&cache));
        let (state, _) = watch::channel(SyncSnapshot::default());

        Self {
            coordinator,
            cache,
            prefetch,
            settings,
            state: Arc::new(state),
            statuses: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
            error_timer: Mutex::new(None),
        }
    }

    /// Wire a controller against the remote API described by `config`.
    pub fn from_config(
        config: &Config,
        tokens: Arc<dyn TokenProvider>,
        store: Arc<dyn BlobStore>,
    ) -> anyhow::Result<Self> {
        let settings = SyncSettings::from_config(&config.sync)?;
        let client = CalendarClient::from_config(&config.api, settings.tz)?;
        let cache = Arc::new(CacheStore::new(store, &config.cache));
        Ok(Self::new(Arc::new(client), tokens, cache, settings))
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    pub fn prefetch(&self) -> &PrefetchScheduler {
        &self.prefetch
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncSnapshot> {
        self.state.subscribe()
    }

    pub fn snapshot(&self) -> SyncSnapshot {
        self.state.borrow().clone()
    }

    pub fn status(&self, range: &DateRange) -> LoadStatus {
        self.statuses.lock().get(range).copied().unwrap_or_default()
    }

    /// Load the day, week or month containing `date`.
    pub async fn load_range(&self, kind: RangeKind, date: NaiveDate) -> LoadOutcome {
        let range = DateRange::containing(kind, date, self.settings.week_start);
        self.load(range).await
    }

    /// Load an already normalized range.
    ///
    /// Cached accounts are served from the cache; only the rest are
    /// fetched, and only those count towards the error policy. When loads
    /// overlap, the most recently started one owns the published state.
    pub async fn load(&self, range: DateRange) -> LoadOutcome {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let epoch = self.cache.epoch();

        self.prefetch.cancel();
        self.prefetch.observe(&range);
        self.set_status(range, LoadStatus::Loading);
        let mut previous = LoadStatus::Idle;
        self.state.send_modify(|s| {
            previous = s.status;
            s.is_loading = true;
            s.status = LoadStatus::Loading;
        });
        let mut guard = LoadingGuard {
            controller: self,
            generation,
            range,
            previous,
            armed: true,
        };

        let accounts = self.coordinator.tokens().linked_accounts();
        tracing::info!("Loading {} for {} linked accounts", range, accounts.len());

        let mut data: BTreeMap<AccountKind, CachedRange> = BTreeMap::new();
        let mut misses = Vec::new();
        for kind in accounts.iter().copied() {
            match self.cache.get(&CacheKey::new(kind, &range)).await {
                Some(hit) => {
                    tracing::debug!("Cache hit for {} {}", kind, range);
                    data.insert(kind, hit);
                }
                None => misses.push(kind),
            }
        }

        let outcome = if misses.is_empty() {
            FetchOutcome::default()
        } else {
            self.coordinator.fetch(&misses, range).await
        };

        for (kind, fetched) in outcome.successes() {
            self.cache
                .put_if_current(epoch, CacheKey::new(kind, &range), fetched.clone());
            data.insert(kind, fetched.clone());
        }

        let failure = outcome.failure();
        let status = match (&failure, outcome.errors().next()) {
            (Some(_), _) => LoadStatus::Failed,
            (None, Some(_)) => LoadStatus::PartialLoaded,
            (None, None) => LoadStatus::Loaded,
        };

        let published = self.commit(generation, range, &accounts, data, status, failure.as_ref());
        guard.armed = false;
        // A clear_all since this load started also dropped its status.
        if published || self.cache.epoch() == epoch {
            self.set_status(range, status);
        }

        if published {
            self.prune_statuses(&range);
            match &failure {
                Some(f) => {
                    tracing::warn!("Loading {} failed: {}", range, f);
                    self.schedule_error(f.user_message());
                }
                None => self.clear_error(),
            }

            if status != LoadStatus::Failed && self.settings.prefetch {
                self.prefetch.on_range_loaded(range, &accounts);
            }
        } else {
            tracing::debug!("Load of {} superseded, not publishing", range);
        }

        LoadOutcome {
            range,
            status,
            failure,
            published,
        }
    }

    fn set_status(&self, range: DateRange, status: LoadStatus) {
        self.statuses.lock().insert(range, status);
    }

    /// Keep statuses for `range` and its neighbours only.
    fn prune_statuses(&self, range: &DateRange) {
        let keep = [range.previous(), *range, range.next()];
        self.statuses.lock().retain(|r, _| keep.contains(r));
    }

    /// Undo the loading markers of a load dropped before it committed.
    fn abandon_load(&self, generation: u64, range: DateRange, previous: LoadStatus) {
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        {
            let mut statuses = self.statuses.lock();
            if statuses.get(&range) == Some(&LoadStatus::Loading) {
                statuses.remove(&range);
            }
        }
        let restored = self.state.send_if_modified(|s| {
            if self.generation.load(Ordering::SeqCst) != generation || !s.is_loading {
                return false;
            }
            s.is_loading = false;
            s.status = previous;
            true
        });
        if restored {
            tracing::debug!("Load of {} dropped before completing", range);
        }
    }

    /// Publish the load's results if no newer load has started.
    fn commit(
        &self,
        generation: u64,
        range: DateRange,
        accounts: &[AccountKind],
        mut data: BTreeMap<AccountKind, CachedRange>,
        status: LoadStatus,
        failure: Option<&SyncFailure>,
    ) -> bool {
        let tz = self.settings.tz;
        let mut events = BTreeMap::new();
        let mut calendars = BTreeMap::new();
        let mut days = BTreeMap::new();

        // Failed accounts publish empty lists rather than another range's data.
        for kind in accounts.iter().copied() {
            let CachedRange {
                calendars: account_calendars,
                events: account_events,
            } = data.remove(&kind).unwrap_or_default();
            days.insert(kind, bucket(&account_events, tz));
            events.insert(kind, account_events);
            calendars.insert(kind, account_calendars);
        }

        self.state.send_if_modified(|s| {
            if self.generation.load(Ordering::SeqCst) != generation {
                return false;
            }
            s.range = Some(range);
            s.events = events;
            s.calendars = calendars;
            s.days = days;
            s.is_loading = false;
            s.status = status;
            if failure.is_none() {
                s.error = None;
            }
            s.revision += 1;
            true
        })
    }

    /// Show `message` after the debounce delay unless a later load succeeds first.
    fn schedule_error(&self, message: String) {
        let token = CancellationToken::new();
        if let Some(previous) = self.error_timer.lock().replace(token.clone()) {
            previous.cancel();
        }

        let delay = self.settings.error_debounce;
        if delay.is_zero() {
            self.state.send_modify(|s| s.error = Some(message));
            return;
        }

        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    state.send_if_modified(|s| {
                        if token.is_cancelled() {
                            return false;
                        }
                        s.error = Some(message);
                        true
                    });
                }
            }
        });
    }

    fn clear_error(&self) {
        if let Some(timer) = self.error_timer.lock().take() {
            timer.cancel();
        }
        self.state.send_if_modified(|s| s.error.take().is_some());
    }

    /// Events occupying `date`, optionally for one account only.
    ///
    /// Reads the published index; performs no I/O.
    pub fn events_for_day(&self, date: NaiveDate, account: Option<AccountKind>) -> Vec<Event> {
        let snapshot = self.state.borrow();
        let mut events: Vec<Event> = snapshot
            .days
            .iter()
            .filter(|(kind, _)| account.map_or(true, |only| only == **kind))
            .flat_map(|(_, index)| index.get(date).iter().cloned())
            .collect();
        drop(snapshot);

        if account.is_none() {
            sort_events(&mut events, self.settings.tz);
        }
        events
    }

    /// Drop every cached range and all published state.
    pub async fn clear_all(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.prefetch.reset();
        if let Some(timer) = self.error_timer.lock().take() {
            timer.cancel();
        }

        self.cache.invalidate_all().await;
        self.statuses.lock().clear();
        self.state.send_modify(|s| {
            *s = SyncSnapshot {
                revision: s.revision + 1,
                ..SyncSnapshot::default()
            };
        });
        tracing::info!("Calendar state cleared");
    }

    /// Wait for background prefetching and cache persistence to finish.
    pub async fn settle(&self) {
        self.prefetch.settle().await;
        self.cache.flush().await;
    }
}

/// Rolls back the loading markers if a load's future is dropped mid-flight.
struct LoadingGuard<'a> {
    controller: &'a SyncController,
    generation: u64,
    range: DateRange,
    previous: LoadStatus,
    armed: bool,
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.controller
                .abandon_load(self.generation, self.range, self.previous);
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
    use super::*;
    use crate::error::CalendarError;
    use crate::fetch::tests::{timed, week, FakeApi};
    use crate::store::tests::FailingBlobStore;
    use crate::store::MemoryBlobStore;
    use duet_auth::StaticTokenProvider;
    use duet_core::CacheConfig;

    fn controller(api: Arc<FakeApi>, tokens: Arc<StaticTokenProvider>) -> SyncController {
        let cache = Arc::new(CacheStore::new(
            Arc::new(MemoryBlobStore::new()),
            &CacheConfig::default(),
        ));
        SyncController::new(
            api,
            tokens,
            cache,
            SyncSettings {
                error_debounce: Duration::ZERO,
                prefetch: false,
                ..SyncSettings::default()
            },
        )
    }

    fn both() -> Arc<StaticTokenProvider> {
        Arc::new(StaticTokenProvider::with_tokens([
            (AccountKind::Personal, "personal"),
            (AccountKind::Professional, "professional"),
        ]))
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, d).unwrap()
    }

    fn ids(events: &[Event]) -> Vec<&str> {
        events.iter().map(|e| e.id.as_str()).collect()
    }

    fn two_account_api() -> FakeApi {
        FakeApi::default()
            .with_calendar("personal", AccountKind::Personal, "home")
            .with_calendar("professional", AccountKind::Professional, "work")
            .with_events(
                "home",
                vec![timed("gym", "home", "2025-03-11T17:00:00Z", "2025-03-11T18:00:00Z")],
            )
            .with_events(
                "work",
                vec![timed("standup", "work", "2025-03-11T09:00:00Z", "2025-03-11T09:15:00Z")],
            )
    }

    #[tokio::test]
    async fn test_load_publishes_merged_state() {
        let sync = controller(Arc::new(two_account_api()), both());
        let mut rx = sync.subscribe();

        let outcome = sync.load_range(RangeKind::Week, day(12)).await;

        assert_eq!(outcome.status, LoadStatus::Loaded);
        assert_eq!(outcome.range, week());
        assert!(outcome.published);
        assert!(rx.has_changed().unwrap());

        let snapshot = rx.borrow_and_update().clone();
        assert_eq!(snapshot.range, Some(week()));
        assert!(!snapshot.is_loading);
        assert_eq!(snapshot.events[&AccountKind::Personal].len(), 1);
        assert_eq!(snapshot.calendars[&AccountKind::Professional][0].id, "work");
        assert_eq!(sync.status(&week()), LoadStatus::Loaded);

        assert_eq!(ids(&sync.events_for_day(day(11), None)), vec!["standup", "gym"]);
        assert_eq!(
            ids(&sync.events_for_day(day(11), Some(AccountKind::Personal))),
            vec!["gym"]
        );
        assert!(sync.events_for_day(day(12), None).is_empty());
    }

    #[tokio::test]
    async fn test_second_load_is_served_from_cache() {
        let api = Arc::new(two_account_api());
        let sync = controller(api.clone(), both());

        sync.load_range(RangeKind::Week, day(10)).await;
        sync.load_range(RangeKind::Week, day(16)).await;

        assert_eq!(api.total_calls(), 2);
        assert_eq!(sync.snapshot().revision, 2);
    }

    #[tokio::test]
    async fn test_partial_failure_publishes_survivor() {
        let api = two_account_api().failing("personal", CalendarError::ServerError(503));
        let sync = controller(Arc::new(api), both());

        let outcome = sync.load_range(RangeKind::Week, day(10)).await;

        assert_eq!(outcome.status, LoadStatus::PartialLoaded);
        assert!(outcome.failure.is_none());
        let snapshot = sync.snapshot();
        assert!(snapshot.error.is_none());
        assert!(snapshot.events[&AccountKind::Personal].is_empty());
        assert_eq!(ids(&sync.events_for_day(day(11), None)), vec!["standup"]);
    }

    #[tokio::test]
    async fn test_error_counts_only_accounts_that_fetched() {
        let api = Arc::new(two_account_api());
        let sync = controller(api.clone(), both());
        sync.load_range(RangeKind::Week, day(10)).await;

        // Professional stays cached; personal expires and then fails.
        sync.cache()
            .invalidate(&CacheKey::new(AccountKind::Personal, &week()))
            .await;
        api.calendars
            .lock()
            .insert("personal".into(), Err(CalendarError::Unauthorized));

        let outcome = sync.load_range(RangeKind::Week, day(10)).await;

        assert_eq!(outcome.status, LoadStatus::Failed);
        assert_eq!(
            outcome.failure,
            Some(SyncFailure::Account(AccountKind::Personal, CalendarError::Unauthorized))
        );
        assert!(sync.snapshot().error.is_some());
        assert_eq!(ids(&sync.events_for_day(day(11), None)), vec!["standup"]);
    }

    #[tokio::test]
    async fn test_no_linked_accounts_loads_empty() {
        let sync = controller(Arc::new(FakeApi::default()), Arc::new(StaticTokenProvider::new()));

        let outcome = sync.load_range(RangeKind::Month, day(10)).await;

        assert_eq!(outcome.status, LoadStatus::Loaded);
        let snapshot = sync.snapshot();
        assert!(snapshot.events.is_empty());
        assert!(snapshot.error.is_none());
    }

    #[tokio::test]
    async fn test_success_clears_visible_error() {
        let api = Arc::new(
            two_account_api()
                .failing("personal", CalendarError::Timeout)
                .failing("professional", CalendarError::Timeout),
        );
        let sync = controller(api.clone(), both());

        sync.load_range(RangeKind::Day, day(10)).await;
        assert!(sync.snapshot().error.is_some());
        assert_eq!(sync.status(&DateRange::containing(RangeKind::Day, day(10), WeekStart::Monday)), LoadStatus::Failed);

        api.calendars.lock().insert("personal".into(), Ok(vec![]));
        sync.load_range(RangeKind::Day, day(10)).await;
        assert!(sync.snapshot().error.is_none());
    }

    #[tokio::test]
    async fn test_clear_all_resets_state_and_cache() {
        let api = Arc::new(two_account_api());
        let sync = controller(api.clone(), both());
        sync.load_range(RangeKind::Week, day(10)).await;

        sync.clear_all().await;

        let snapshot = sync.snapshot();
        assert!(snapshot.range.is_none());
        assert!(snapshot.events.is_empty());
        assert!(sync.events_for_day(day(11), None).is_empty());
        assert_eq!(sync.status(&week()), LoadStatus::Idle);
        assert!(sync.cache().is_empty());

        sync.load_range(RangeKind::Week, day(10)).await;
        assert_eq!(api.total_calls(), 4);
    }

    fn controller_over(
        api: Arc<FakeApi>,
        store: Arc<dyn BlobStore>,
        prefetch: bool,
    ) -> SyncController {
        let cache = Arc::new(CacheStore::new(store, &CacheConfig::default()));
        SyncController::new(
            api,
            both(),
            cache,
            SyncSettings {
                error_debounce: Duration::ZERO,
                prefetch,
                ..SyncSettings::default()
            },
        )
    }

    #[tokio::test]
    async fn test_clear_all_discards_load_in_flight() {
        let api = Arc::new(two_account_api().with_delay(Duration::from_millis(100)));
        let store = Arc::new(MemoryBlobStore::new());
        let sync = controller_over(api, store.clone(), true);

        let (outcome, _) = tokio::join!(sync.load(week()), async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            sync.clear_all().await;
        });

        assert!(!outcome.published);
        sync.settle().await;
        assert_eq!(sync.status(&week()), LoadStatus::Idle);
        assert!(sync.cache().is_empty());
        assert!(store.is_empty());
        assert!(sync.snapshot().events.is_empty());
    }

    #[tokio::test]
    async fn test_clear_all_discards_prefetch_in_flight() {
        let api = Arc::new(two_account_api().with_delay(Duration::from_millis(100)));
        let store = Arc::new(MemoryBlobStore::new());
        let sync = controller_over(api, store.clone(), true);

        sync.load(week()).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        sync.clear_all().await;
        tokio::time::sleep(Duration::from_millis(400)).await;
        sync.settle().await;

        assert!(sync.cache().is_empty());
        assert!(store.is_empty());
        assert!(!sync.cache().contains_fresh(&CacheKey::new(AccountKind::Personal, &week().next())));
    }

    #[tokio::test]
    async fn test_unusable_persisted_store_still_loads() {
        let api = Arc::new(two_account_api());
        let sync = controller_over(api.clone(), Arc::new(FailingBlobStore::default()), false);

        let outcome = sync.load(week()).await;
        sync.settle().await;

        assert_eq!(outcome.status, LoadStatus::Loaded);
        assert!(outcome.failure.is_none());
        assert!(sync.snapshot().error.is_none());
        assert_eq!(ids(&sync.events_for_day(day(11), None)), vec!["standup", "gym"]);

        sync.load(week()).await;
        assert_eq!(api.total_calls(), 2);
    }

    #[tokio::test]
    async fn test_status_map_keeps_neighbourhood_only() {
        let sync = controller(Arc::new(two_account_api()), both());

        for offset in 0..6 {
            sync.load(week().shift(offset)).await;
        }

        assert_eq!(sync.statuses.lock().len(), 2);
        assert_eq!(sync.status(&week().shift(5)), LoadStatus::Loaded);
        assert_eq!(sync.status(&week().shift(4)), LoadStatus::Loaded);
        assert_eq!(sync.status(&week()), LoadStatus::Idle);

        sync.load(week()).await;
        assert_eq!(sync.statuses.lock().len(), 1);
        assert_eq!(sync.status(&week()), LoadStatus::Loaded);
    }

    #[tokio::test]
    async fn test_dropped_load_resets_loading_state() {
        let api = Arc::new(two_account_api().with_delay(Duration::from_millis(200)));
        let sync = controller(api, both());

        let abandoned =
            tokio::time::timeout(Duration::from_millis(30), sync.load(week())).await;
        assert!(abandoned.is_err());

        let snapshot = sync.snapshot();
        assert!(!snapshot.is_loading);
        assert_eq!(snapshot.status, LoadStatus::Idle);
        assert_eq!(sync.status(&week()), LoadStatus::Idle);
    }
}
