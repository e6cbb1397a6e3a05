//! Two-tier cache of fetched ranges: memory in front of a persisted blob store.
//!
//! Memory entries live for the memory TTL and are bounded by an LRU limit.
//! Every write is mirrored to the persisted tier in the background; that tier
//! has a longer TTL so entries survive restarts and eviction.
//!
//! Writers that fetched their data before an [`CacheStore::invalidate_all`]
//! pass the epoch they observed and are dropped.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use duet_auth::AccountKind;
use duet_core::CacheConfig;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::clock::{Clock, SystemClock};
use crate::error::CalendarError;
use crate::range::DateRange;
use crate::store::BlobStore;
use crate::types::{Calendar, Event};

/// Namespace of cache entries inside the blob store.
pub const CACHE_KEY_PREFIX: &str = "calendar-cache:";

/// One account's data for one range, at day granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    pub account: AccountKind,
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl CacheKey {
    pub fn new(account: AccountKind, range: &DateRange) -> Self {
        Self {
            account,
            start: range.start,
            end: range.end,
        }
    }

    /// Key under which the entry is persisted.
    pub fn storage_key(&self) -> String {
        format!("{}{}", CACHE_KEY_PREFIX, self)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.account,
            self.start.format("%Y-%m-%d"),
            self.end.format("%Y-%m-%d")
        )
    }
}

/// Events and calendars fetched for one account over one range.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CachedRange {
    pub calendars: Vec<Calendar>,
    pub events: Vec<Event>,
}

#[derive(Debug)]
struct MemoryEntry {
    data: CachedRange,
    written_at: DateTime<Utc>,
    /// Eviction order only; the sequence number breaks timestamp ties.
    last_access: (DateTime<Utc>, u64),
}

pub struct CacheStore {
    memory: Mutex<HashMap<CacheKey, MemoryEntry>>,
    persisted: Arc<dyn BlobStore>,
    clock: Arc<dyn Clock>,
    memory_ttl: Duration,
    persisted_ttl: Duration,
    max_entries: usize,
    access_seq: AtomicU64,
    epoch: AtomicU64,
    pending: Mutex<Vec<JoinHandle<()>>>,
    /// Sequence of the newest mirror written per key.
    mirrored: Arc<Mutex<HashMap<CacheKey, u64>>>,
}

impl CacheStore {
    pub fn new(persisted: Arc<dyn BlobStore>, config: &CacheConfig) -> Self {
        Self::with_clock(persisted, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        persisted: Arc<dyn BlobStore>,
        config: &CacheConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            memory: Mutex::new(HashMap::new()),
            persisted,
            clock,
            memory_ttl: config.memory_ttl(),
            persisted_ttl: config.persisted_ttl(),
            max_entries: config.max_entries.max(1),
            access_seq: AtomicU64::new(0),
            epoch: AtomicU64::new(0),
            pending: Mutex::new(Vec::new()),
            mirrored: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn access_stamp(&self, now: DateTime<Utc>) -> (DateTime<Utc>, u64) {
        (now, self.access_seq.fetch_add(1, Ordering::Relaxed))
    }

    fn age(now: DateTime<Utc>, written_at: DateTime<Utc>) -> Duration {
        (now - written_at).to_std().unwrap_or_default()
    }

    /// Incremented by every [`invalidate_all`](Self::invalidate_all).
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Number of entries held in memory.
    pub fn len(&self) -> usize {
        self.memory.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.memory.lock().is_empty()
    }

    /// Whether memory holds a valid entry for `key`. Does not count as an access.
    pub fn contains_fresh(&self, key: &CacheKey) -> bool {
        let now = self.clock.now();
        self.memory
            .lock()
            .get(key)
            .is_some_and(|entry| Self::age(now, entry.written_at) < self.memory_ttl)
    }

    /// Look up `key`, falling back to the persisted tier.
    ///
    /// Stale entries found in either tier are purged. A persisted hit is
    /// re-admitted to memory with its original write time.
    pub async fn get(&self, key: &CacheKey) -> Option<CachedRange> {
        let now = self.clock.now();
        let epoch = self.epoch();

        {
            let mut memory = self.memory.lock();
            let fresh = memory
                .get(key)
                .map(|entry| Self::age(now, entry.written_at) < self.memory_ttl);
            match fresh {
                Some(true) => {
                    let stamp = self.access_stamp(now);
                    let data = memory.get_mut(key).map(|entry| {
                        entry.last_access = stamp;
                        entry.data.clone()
                    });
                    tracing::debug!("Memory cache hit: {}", key);
                    return data;
                }
                Some(false) => {
                    memory.remove(key);
                    tracing::debug!("Purged stale memory entry: {}", key);
                }
                None => {}
            }
        }

        let (written_at, data) = self.read_persisted(key, now).await?;

        let stamp = self.access_stamp(now);
        let mut memory = self.memory.lock();
        if self.epoch() != epoch {
            tracing::debug!("Cache cleared during read of {}", key);
            return None;
        }
        memory.insert(
            *key,
            MemoryEntry {
                data: data.clone(),
                written_at,
                last_access: stamp,
            },
        );
        self.evict(&mut memory);
        tracing::debug!("Persisted cache hit: {}", key);
        Some(data)
    }

    async fn read_persisted(
        &self,
        key: &CacheKey,
        now: DateTime<Utc>,
    ) -> Option<(DateTime<Utc>, CachedRange)> {
        let store = self.persisted.clone();
        let storage_key = key.storage_key();
        let read = run_blocking(move || {
            let Some(written_at) = store.timestamp(&storage_key)? else {
                return Ok(None);
            };
            Ok(store.get(&storage_key)?.map(|bytes| (written_at, bytes)))
        })
        .await;

        let (written_at, bytes) = match read {
            Ok(Some(found)) => found,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!("Persisted read of {} failed: {}", key, CalendarError::CacheIo(e.to_string()));
                return None;
            }
        };

        if Self::age(now, written_at) >= self.persisted_ttl {
            tracing::debug!("Purged stale persisted entry: {}", key);
            self.remove_persisted(key).await;
            return None;
        }

        match serde_json::from_slice::<CachedRange>(&bytes) {
            Ok(data) => Some((written_at, data)),
            Err(e) => {
                tracing::warn!("Discarding corrupt persisted entry {}: {}", key, e);
                self.remove_persisted(key).await;
                None
            }
        }
    }

    async fn remove_persisted(&self, key: &CacheKey) {
        let store = self.persisted.clone();
        let storage_key = key.storage_key();
        if let Err(e) = run_blocking(move || store.remove(&storage_key)).await {
            tracing::warn!("Persisted remove of {} failed: {}", key, CalendarError::CacheIo(e.to_string()));
        }
    }

    /// Store fresh data for `key` and mirror it to the persisted tier.
    ///
    /// Persistence is best-effort and never fails the caller.
    pub fn put(&self, key: CacheKey, data: CachedRange) {
        self.put_if_current(self.epoch(), key, data);
    }

    /// Like [`put`](Self::put), but dropped when the cache was cleared
    /// after `epoch` was read. Returns whether the entry was stored.
    pub fn put_if_current(&self, epoch: u64, key: CacheKey, data: CachedRange) -> bool {
        let now = self.clock.now();
        let bytes = serde_json::to_vec(&data);

        // Held until the mirror is queued so invalidate_all's flush sees it.
        let mut memory = self.memory.lock();
        if self.epoch() != epoch {
            tracing::debug!("Dropping write of {} fetched before the cache was cleared", key);
            return false;
        }

        let stamp = self.access_stamp(now);
        memory.insert(
            key,
            MemoryEntry {
                data,
                written_at: now,
                last_access: stamp,
            },
        );
        self.evict(&mut memory);

        let bytes = match bytes {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!("Failed to encode cache entry {}: {}", key, e);
                return true;
            }
        };

        let store = self.persisted.clone();
        let mirrored = Arc::clone(&self.mirrored);
        let seq = stamp.1;
        let write = move || {
            write_mirror(store.as_ref(), &mirrored, key, seq, &bytes, now);
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let task = handle.spawn_blocking(write);
                let mut pending = self.pending.lock();
                pending.retain(|t| !t.is_finished());
                pending.push(task);
            }
            Err(_) => write(),
        }
        true
    }

    /// Drop least-recently-accessed memory entries beyond the bound.
    /// The persisted tier keeps its copy.
    fn evict(&self, memory: &mut HashMap<CacheKey, MemoryEntry>) {
        if memory.len() <= self.max_entries {
            return;
        }

        let mut by_access: Vec<(CacheKey, (DateTime<Utc>, u64))> = memory
            .iter()
            .map(|(key, entry)| (*key, entry.last_access))
            .collect();
        by_access.sort_by_key(|(_, access)| *access);

        let excess = memory.len() - self.max_entries;
        for (key, _) in by_access.into_iter().take(excess) {
            memory.remove(&key);
            tracing::debug!("Evicted from memory cache: {}", key);
        }
    }

    /// Remove `key` from both tiers.
    pub async fn invalidate(&self, key: &CacheKey) {
        self.memory.lock().remove(key);
        self.flush().await;
        self.remove_persisted(key).await;
    }

    /// Remove every entry from both tiers.
    ///
    /// Writes that captured an earlier [`epoch`](Self::epoch) are dropped
    /// from here on.
    pub async fn invalidate_all(&self) {
        {
            let mut memory = self.memory.lock();
            self.epoch.fetch_add(1, Ordering::SeqCst);
            memory.clear();
            self.mirrored.lock().clear();
        }
        self.flush().await;

        let store = self.persisted.clone();
        if let Err(e) = run_blocking(move || store.remove_prefix(CACHE_KEY_PREFIX)).await {
            tracing::warn!("Persisted clear failed: {}", CalendarError::CacheIo(e.to_string()));
        }
        tracing::info!("Calendar cache cleared");
    }

    /// Wait for outstanding persisted writes.
    pub async fn flush(&self) {
        let pending: Vec<JoinHandle<()>> = std::mem::take(&mut *self.pending.lock());
        for task in pending {
            if let Err(e) = task.await {
                tracing::warn!("Persisted cache write task failed: {}", e);
            }
        }
    }
}

/// Persist one mirrored write unless a newer one for `key` already landed.
///
/// Mirrors run on the blocking pool and may finish out of order; `seq`
/// orders them.
fn write_mirror(
    store: &dyn BlobStore,
    mirrored: &Mutex<HashMap<CacheKey, u64>>,
    key: CacheKey,
    seq: u64,
    bytes: &[u8],
    written_at: DateTime<Utc>,
) -> bool {
    let mut mirrored = mirrored.lock();
    if mirrored.get(&key).is_some_and(|newest| *newest > seq) {
        tracing::debug!("Skipping superseded persisted write of {}", key);
        return false;
    }
    match store.set(&key.storage_key(), bytes, written_at) {
        Ok(()) => {
            mirrored.insert(key, seq);
            true
        }
        Err(e) => {
            tracing::warn!("Persisted write of {} failed: {}", key, CalendarError::CacheIo(e.to_string()));
            false
        }
    }
}

async fn run_blocking<T, F>(f: F) -> anyhow::Result<T>
where
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await?
}
