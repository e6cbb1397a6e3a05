//! Calendar sync engine for Duet.
//!
//! Loads day, week and month ranges for a personal and a professional
//! account, caches them in memory and on disk, buckets events into days
//! and warms neighbouring ranges in the background.

pub mod bucket;
pub mod cache;
pub mod client;
pub mod clock;
pub mod error;
pub mod fetch;
pub mod flight;
pub mod prefetch;
pub mod range;
pub mod retry;
pub mod store;
pub mod sync;
pub mod types;

pub use bucket::{bucket, DayIndex};
pub use cache::{CacheKey, CacheStore, CachedRange};
pub use client::{CalendarApi, CalendarClient};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{CalendarError, SyncFailure};
pub use fetch::{FetchCoordinator, FetchOutcome};
pub use flight::SingleFlight;
pub use prefetch::{Direction, NavigationState, PrefetchScheduler};
pub use range::{DateRange, RangeKind};
pub use retry::RetryConfig;
pub use store::{BlobStore, MemoryBlobStore, SqliteBlobStore};
pub use sync::{LoadOutcome, LoadStatus, SyncController, SyncSettings, SyncSnapshot};
pub use types::{AccessRole, Calendar, Event, EventStatus, EventTime};
