//! Background warming of ranges adjacent to the one on screen.

use std::cmp::Ordering;
use std::sync::Arc;

use chrono::NaiveDate;
use duet_auth::AccountKind;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cache::{CacheKey, CacheStore};
use crate::fetch::FetchCoordinator;
use crate::range::DateRange;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    Backward,
    #[default]
    Neutral,
    Forward,
}

impl Direction {
    pub fn signum(&self) -> i8 {
        match self {
            Direction::Backward => -1,
            Direction::Neutral => 0,
            Direction::Forward => 1,
        }
    }
}

/// Where the user has been navigating.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NavigationState {
    pub last_start: Option<NaiveDate>,
    pub direction: Direction,
}

impl NavigationState {
    /// Record a load starting at `start`. An unchanged start keeps the
    /// current direction.
    pub fn observe(&mut self, start: NaiveDate) -> Direction {
        if let Some(last) = self.last_start {
            match start.cmp(&last) {
                Ordering::Greater => self.direction = Direction::Forward,
                Ordering::Less => self.direction = Direction::Backward,
                Ordering::Equal => {}
            }
        }
        self.last_start = Some(start);
        self.direction
    }
}

/// Ranges to warm around `range`, highest priority first.
pub fn plan(range: &DateRange, direction: Direction) -> Vec<DateRange> {
    match direction {
        Direction::Forward => {
            let next = range.next();
            vec![next, next.next(), range.previous()]
        }
        Direction::Backward => {
            let previous = range.previous();
            vec![previous, previous.previous(), range.next()]
        }
        Direction::Neutral => vec![range.next(), range.previous()],
    }
}

/// Warms the cache for neighbouring ranges after each foreground load.
///
/// Only ever writes to the cache. Failures are dropped.
pub struct PrefetchScheduler {
    coordinator: Arc<FetchCoordinator>,
    cache: Arc<CacheStore>,
    navigation: Mutex<NavigationState>,
    current: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl PrefetchScheduler {
    pub fn new(coordinator: Arc<FetchCoordinator>, cache: Arc<CacheStore>) -> Self {
        Self {
            coordinator,
            cache,
            navigation: Mutex::new(NavigationState::default()),
            current: Mutex::new(None),
        }
    }

    pub fn direction(&self) -> Direction {
        self.navigation.lock().direction
    }

    pub fn navigation(&self) -> NavigationState {
        *self.navigation.lock()
    }

    /// Update the navigation direction for a load of `range`.
    pub fn observe(&self, range: &DateRange) -> Direction {
        self.navigation.lock().observe(range.start)
    }

    /// Schedule warming around a freshly loaded `range`.
    ///
    /// Cancels whatever was scheduled before and returns the planned
    /// ranges in priority order. Returns immediately.
    pub fn on_range_loaded(&self, range: DateRange, accounts: &[AccountKind]) -> Vec<DateRange> {
        let direction = self.observe(&range);
        let targets = plan(&range, direction);

        self.cancel();
        if accounts.is_empty() {
            return targets;
        }

        tracing::debug!(
            "Prefetching {} ranges around {} (direction {})",
            targets.len(),
            range,
            direction.signum()
        );

        let token = CancellationToken::new();
        let task = tokio::spawn(warm(
            Arc::clone(&self.coordinator),
            Arc::clone(&self.cache),
            self.cache.epoch(),
            token.clone(),
            targets.clone(),
            accounts.to_vec(),
        ));
        *self.current.lock() = Some((token, task));

        targets
    }

    /// Stop scheduled warming before its next request.
    ///
    /// A request already on the wire finishes and is still cached, unless
    /// the cache was cleared meanwhile.
    pub fn cancel(&self) {
        if let Some((token, _)) = self.current.lock().take() {
            token.cancel();
        }
    }

    /// Cancel and forget the navigation history.
    pub fn reset(&self) {
        self.cancel();
        *self.navigation.lock() = NavigationState::default();
    }

    /// Wait for the scheduled warming pass, if any, to finish.
    pub async fn settle(&self) {
        let task = self.current.lock().take();
        if let Some((token, task)) = task {
            if let Err(e) = task.await {
                tracing::warn!("Prefetch task failed: {}", e);
            }
            drop(token);
        }
    }
}

impl Drop for PrefetchScheduler {
    fn drop(&mut self) {
        self.cancel();
    }
}

async fn warm(
    coordinator: Arc<FetchCoordinator>,
    cache: Arc<CacheStore>,
    epoch: u64,
    token: CancellationToken,
    targets: Vec<DateRange>,
    accounts: Vec<AccountKind>,
) {
    for range in targets {
        for kind in accounts.iter().copied() {
            if token.is_cancelled() {
                tracing::debug!("Prefetch cancelled before {} {}", kind, range);
                return;
            }

            let key = CacheKey::new(kind, &range);
            if cache.contains_fresh(&key) {
                tracing::debug!("Prefetch skip, cached: {}", key);
                continue;
            }

            // Joins a foreground fetch of the same key rather than repeating it.
            match coordinator.fetch_account(kind, range).await {
                Ok(data) => {
                    if !cache.put_if_current(epoch, key, data) {
                        return;
                    }
                    tracing::debug!("Prefetched {}", key);
                }
                Err(e) => tracing::debug!("Prefetch of {} failed: {}", key, e),
            }
        }
    }
}
