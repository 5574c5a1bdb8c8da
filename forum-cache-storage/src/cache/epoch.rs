//! Invalidation epoch: the cache-wide generation counter.
//!
//! Every key a backend stores is scoped to the epoch that was current when it
//! was written. Advancing the epoch makes all older entries unreachable at
//! once, so no backend has to support enumerating or deleting by prefix.
//!
//! The counter lives in whatever shared storage the backend already uses,
//! behind [`InvalidationStore`]. The facade reads it through an
//! [`EpochTracker`], which only ever moves forward.

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use forum_cache_core::CacheResult;

/// Sentinel meaning "never refreshed".
const NEVER: u64 = u64::MAX;

/// Globally visible store for the invalidation epoch.
///
/// `advance` must be an atomic increment in the backing storage. Two
/// processes advancing concurrently may both observe the same new value;
/// that is fine, since any higher epoch invalidates everything older.
#[async_trait]
pub trait InvalidationStore: Debug + Send + Sync {
    /// Read the current epoch.
    async fn current(&self) -> CacheResult<u64>;

    /// Increment the epoch and return the new value.
    async fn advance(&self) -> CacheResult<u64>;
}

/// Process-wide epoch held in an atomic counter.
#[derive(Debug, Default)]
pub struct MemoryEpochStore {
    epoch: AtomicU64,
}

impl MemoryEpochStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start at a specific epoch.
    pub fn starting_at(epoch: u64) -> Self {
        Self {
            epoch: AtomicU64::new(epoch),
        }
    }
}

#[async_trait]
impl InvalidationStore for MemoryEpochStore {
    async fn current(&self) -> CacheResult<u64> {
        Ok(self.epoch.load(Ordering::SeqCst))
    }

    async fn advance(&self) -> CacheResult<u64> {
        Ok(self.epoch.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

/// Caches the last observed epoch and refreshes it from the store.
///
/// Reads go to the store at most once per `refresh` interval. The value
/// handed out never decreases, even if the store briefly reports a lower
/// epoch (for instance a replica lagging behind).
#[derive(Debug)]
pub struct EpochTracker {
    store: Arc<dyn InvalidationStore>,
    observed: AtomicU64,
    refresh: Duration,
    started: Instant,
    /// Milliseconds since `started` of the last successful refresh.
    refreshed_at: AtomicU64,
}

impl EpochTracker {
    pub fn new(store: Arc<dyn InvalidationStore>, refresh: Duration) -> Self {
        Self {
            store,
            observed: AtomicU64::new(0),
            refresh,
            started: Instant::now(),
            refreshed_at: AtomicU64::new(NEVER),
        }
    }

    /// The last value handed out, without touching the store.
    pub fn observed(&self) -> u64 {
        self.observed.load(Ordering::SeqCst)
    }

    /// Current epoch, refreshed from the store when the cached value is old.
    ///
    /// A failing store keeps the last observed value.
    pub async fn current(&self) -> u64 {
        if !self.needs_refresh() {
            return self.observed();
        }
        self.refresh().await
    }

    /// Re-read the store regardless of the refresh interval.
    pub async fn refresh(&self) -> u64 {
        match self.store.current().await {
            Ok(epoch) => {
                self.mark_refreshed();
                self.observe(epoch)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read cache epoch, keeping last observed");
                self.observed()
            }
        }
    }

    /// Advance the epoch in the store and adopt the new value.
    pub async fn advance(&self) -> CacheResult<u64> {
        let epoch = self.store.advance().await?;
        self.mark_refreshed();
        Ok(self.observe(epoch))
    }

    /// Record a value seen elsewhere; returns the (monotonic) current value.
    pub fn observe(&self, epoch: u64) -> u64 {
        let previous = self.observed.fetch_max(epoch, Ordering::SeqCst);
        previous.max(epoch)
    }

    fn needs_refresh(&self) -> bool {
        let last = self.refreshed_at.load(Ordering::SeqCst);
        if last == NEVER {
            return true;
        }
        let elapsed = self.elapsed_millis().saturating_sub(last);
        u128::from(elapsed) >= self.refresh.as_millis()
    }

    fn mark_refreshed(&self) {
        self.refreshed_at
            .store(self.elapsed_millis(), Ordering::SeqCst);
    }

    fn elapsed_millis(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(NEVER - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forum_cache_core::{CacheError, StorageError};
    use std::sync::atomic::AtomicBool;

    #[derive(Debug)]
    struct FlakyStore {
        epoch: AtomicU64,
        failing: AtomicBool,
    }

    #[async_trait]
    impl InvalidationStore for FlakyStore {
        async fn current(&self) -> CacheResult<u64> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(CacheError::from(StorageError::LockPoisoned));
            }
            Ok(self.epoch.load(Ordering::SeqCst))
        }

        async fn advance(&self) -> CacheResult<u64> {
            Ok(self.epoch.fetch_add(1, Ordering::SeqCst) + 1)
        }
    }

    #[tokio::test]
    async fn test_memory_store_advances_monotonically() {
        let store = MemoryEpochStore::new();
        assert_eq!(store.current().await.unwrap(), 0);
        assert_eq!(store.advance().await.unwrap(), 1);
        assert_eq!(store.advance().await.unwrap(), 2);
        assert_eq!(store.current().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_tracker_never_decreases() {
        let store = Arc::new(MemoryEpochStore::starting_at(5));
        let tracker = EpochTracker::new(store.clone(), Duration::ZERO);

        assert_eq!(tracker.current().await, 5);
        // A value seen through another path wins over a lower store read.
        tracker.observe(9);
        assert_eq!(tracker.current().await, 9);
    }

    #[tokio::test]
    async fn test_tracker_caches_within_refresh_interval() {
        let store = Arc::new(MemoryEpochStore::new());
        let tracker = EpochTracker::new(store.clone(), Duration::from_secs(3600));

        assert_eq!(tracker.current().await, 0);
        store.advance().await.unwrap();
        // Still inside the interval: cached value.
        assert_eq!(tracker.current().await, 0);
        // Forced refresh picks it up.
        assert_eq!(tracker.refresh().await, 1);
    }

    #[tokio::test]
    async fn test_tracker_advance_adopts_new_value() {
        let store = Arc::new(MemoryEpochStore::new());
        let tracker = EpochTracker::new(store, Duration::from_secs(3600));
        assert_eq!(tracker.advance().await.unwrap(), 1);
        assert_eq!(tracker.current().await, 1);
    }

    #[tokio::test]
    async fn test_tracker_keeps_last_value_when_store_fails() {
        let store = Arc::new(FlakyStore {
            epoch: AtomicU64::new(3),
            failing: AtomicBool::new(false),
        });
        let tracker = EpochTracker::new(store.clone(), Duration::ZERO);
        assert_eq!(tracker.current().await, 3);

        store.failing.store(true, Ordering::SeqCst);
        assert_eq!(tracker.current().await, 3);
    }

    #[tokio::test]
    async fn test_concurrent_advances_are_not_lost() {
        let store = Arc::new(MemoryEpochStore::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.advance().await.unwrap() }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(store.current().await.unwrap(), 16);
    }
}
