//! The cache facade the rest of the forum talks to.
//!
//! `ForumCache` scopes every key to the current invalidation epoch, fills in
//! the default TTL and absorbs backend errors: a failing backend looks like
//! an empty cache, never like an error.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use forum_cache_core::{CacheSettings, HealthCheck, ScopedKey};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::diagnostics::{BackendReport, CacheReport};
use super::epoch::EpochTracker;
use super::selector::BackendRegistry;
use super::traits::{CacheBackend, CacheScope, CacheStats};

#[derive(Debug, Default)]
struct StatsRecorder {
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
    clears: AtomicU64,
    errors: AtomicU64,
}

impl StatsRecorder {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            clears: self.clears.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Uniform cache facade over the selected backend.
///
/// # Example
///
/// ```ignore
/// let cache = ForumCache::from_settings(&CacheSettings::from_env()?).await;
///
/// let boards = match cache.get("board_list_3", None).await {
///     Some(bytes) => bytes,
///     None => {
///         let bytes = render_board_list(3);
///         cache.put("board_list_3", Some(&bytes), Some(Duration::from_secs(300))).await;
///         bytes
///     }
/// };
/// ```
pub struct ForumCache {
    backend: Arc<dyn CacheBackend>,
    registry: Option<BackendRegistry>,
    tracker: EpochTracker,
    default_ttl: Duration,
    stats: StatsRecorder,
}

impl std::fmt::Debug for ForumCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForumCache")
            .field("backend", &self.backend.name())
            .field("epoch", &self.tracker.observed())
            .field("default_ttl", &self.default_ttl)
            .finish()
    }
}

impl ForumCache {
    /// Detect, register and select a backend from settings.
    pub async fn from_settings(settings: &CacheSettings) -> Self {
        let registry = BackendRegistry::from_settings(settings).await;
        Self::from_registry(registry, settings).await
    }

    /// Select from an already populated registry.
    pub async fn from_registry(registry: BackendRegistry, settings: &CacheSettings) -> Self {
        let backend = registry.select(settings.preference).await;
        let mut cache = Self::with_backend(backend, settings);
        cache.registry = Some(registry);
        cache.tracker.refresh().await;
        cache
    }

    /// Wrap a specific backend, bypassing selection. The caller is
    /// responsible for having connected it.
    ///
    /// The backend is recorded as enabled in its capabilities. If another
    /// kind was already enabled there, `is_supported` stays false.
    pub fn with_backend(backend: Arc<dyn CacheBackend>, settings: &CacheSettings) -> Self {
        if let Some(caps) = backend.capabilities() {
            caps.mark_enabled(backend.kind());
        }
        let tracker = EpochTracker::new(backend.invalidation_store(), settings.epoch_refresh);
        Self {
            backend,
            registry: None,
            tracker,
            default_ttl: settings.default_ttl,
            stats: StatsRecorder::default(),
        }
    }

    /// Name of the selected backend.
    pub fn name(&self) -> &'static str {
        self.backend.name()
    }

    /// Whether the selected backend is supported and enabled.
    pub fn is_supported(&self) -> bool {
        self.backend.is_supported(false)
    }

    pub fn backend(&self) -> &Arc<dyn CacheBackend> {
        &self.backend
    }

    /// Current invalidation epoch.
    pub async fn epoch(&self) -> u64 {
        self.tracker.current().await
    }

    async fn scoped(&self, key: &str) -> ScopedKey {
        ScopedKey::new(self.tracker.current().await, key)
    }

    /// Fetch `key`; `None` on a miss or on any backend failure.
    ///
    /// `ttl` is the maximum age accepted, defaulting to the configured TTL.
    pub async fn get(&self, key: &str, ttl: Option<Duration>) -> Option<Vec<u8>> {
        let scoped = self.scoped(key).await;
        let ttl = ttl.unwrap_or(self.default_ttl);

        match self.backend.get_data(&scoped, Some(ttl)).await {
            Ok(Some(value)) => {
                StatsRecorder::bump(&self.stats.hits);
                Some(value)
            }
            Ok(None) => {
                StatsRecorder::bump(&self.stats.misses);
                None
            }
            Err(e) => {
                StatsRecorder::bump(&self.stats.errors);
                StatsRecorder::bump(&self.stats.misses);
                tracing::warn!(
                    backend = self.name(),
                    key,
                    epoch = scoped.epoch(),
                    error = %e,
                    "Cache read failed, treating as miss"
                );
                None
            }
        }
    }

    /// Store `value` under `key`, or delete it when `value` is `None`.
    pub async fn put(&self, key: &str, value: Option<&[u8]>, ttl: Option<Duration>) -> bool {
        let scoped = self.scoped(key).await;
        let ttl = ttl.unwrap_or(self.default_ttl);

        match self.backend.put_data(&scoped, value, Some(ttl)).await {
            Ok(stored) => {
                if value.is_some() {
                    StatsRecorder::bump(&self.stats.writes);
                } else {
                    StatsRecorder::bump(&self.stats.deletes);
                }
                stored
            }
            Err(e) => {
                StatsRecorder::bump(&self.stats.errors);
                tracing::warn!(
                    backend = self.name(),
                    key,
                    epoch = scoped.epoch(),
                    error = %e,
                    "Cache write failed"
                );
                false
            }
        }
    }

    /// Clear `scope` and invalidate everything cached so far.
    ///
    /// Returns whether the backend physically cleared storage. The epoch
    /// moves forward either way.
    pub async fn clear(&self, scope: CacheScope) -> bool {
        StatsRecorder::bump(&self.stats.clears);
        match self.backend.clean_cache(scope).await {
            Ok(cleared) => {
                let epoch = self.tracker.refresh().await;
                tracing::info!(backend = self.name(), ?scope, epoch, cleared, "Cache cleared");
                cleared
            }
            Err(e) => {
                StatsRecorder::bump(&self.stats.errors);
                tracing::warn!(backend = self.name(), ?scope, error = %e, "Cache clear failed");
                if let Err(e) = self.tracker.advance().await {
                    tracing::warn!(backend = self.name(), error = %e, "Failed to advance cache epoch");
                }
                false
            }
        }
    }

    /// Deserialize a JSON value stored under `key`.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str, ttl: Option<Duration>) -> Option<T> {
        let bytes = self.get(key, ttl).await?;
        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                StatsRecorder::bump(&self.stats.errors);
                tracing::warn!(backend = self.name(), key, error = %e, "Cached value is not valid JSON");
                None
            }
        }
    }

    /// Serialize `value` as JSON and store it; `None` deletes.
    pub async fn put_json<T: Serialize>(&self, key: &str, value: Option<&T>, ttl: Option<Duration>) -> bool {
        let bytes = match value.map(serde_json::to_vec).transpose() {
            Ok(bytes) => bytes,
            Err(e) => {
                StatsRecorder::bump(&self.stats.errors);
                tracing::warn!(backend = self.name(), key, error = %e, "Failed to serialize cache value");
                return false;
            }
        };
        self.put(key, bytes.as_deref(), ttl).await
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.snapshot()
    }

    /// Every known backend with support and selection state.
    pub async fn report(&self) -> CacheReport {
        let active = self.backend.kind();
        let backends = match &self.registry {
            Some(registry) => {
                let mut reports: Vec<BackendReport> = registry
                    .backends()
                    .iter()
                    .map(|b| BackendReport::of(b.as_ref(), b.kind() == active))
                    .collect();
                reports.push(BackendReport::of(
                    registry.null_backend().as_ref(),
                    active == forum_cache_core::BackendKind::Null,
                ));
                reports
            }
            None => vec![BackendReport::of(self.backend.as_ref(), true)],
        };
        let stats = self.stats();

        CacheReport {
            active: self.name().to_string(),
            epoch: self.epoch().await,
            backends,
            hit_rate: stats.hit_rate(),
            stats,
            postgres: self
                .registry
                .as_ref()
                .and_then(|r| r.capabilities().postgres.clone()),
        }
    }

    pub async fn health(&self) -> Vec<HealthCheck> {
        self.report().await.health()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::null_backend::NullBackend;
    use async_trait::async_trait;
    use forum_cache_core::{BackendKind, CacheError, CacheResult, StorageError};
    use crate::cache::epoch::{InvalidationStore, MemoryEpochStore};
    use serde::Deserialize;

    /// Every data call fails.
    #[derive(Debug, Default)]
    struct BrokenBackend {
        epoch: Arc<MemoryEpochStore>,
    }

    fn broken() -> CacheError {
        CacheError::from(StorageError::ConnectionFailed {
            backend: "broken".to_string(),
            reason: "down".to_string(),
        })
    }

    #[async_trait]
    impl CacheBackend for BrokenBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::Postgres
        }

        fn is_supported(&self, _probe: bool) -> bool {
            true
        }

        async fn connect(&self) -> CacheResult<()> {
            Ok(())
        }

        async fn get_data(
            &self,
            _key: &ScopedKey,
            _ttl: Option<Duration>,
        ) -> CacheResult<Option<Vec<u8>>> {
            Err(broken())
        }

        async fn put_data(
            &self,
            _key: &ScopedKey,
            _value: Option<&[u8]>,
            _ttl: Option<Duration>,
        ) -> CacheResult<bool> {
            Err(broken())
        }

        async fn clean_cache(&self, _scope: CacheScope) -> CacheResult<bool> {
            Err(broken())
        }

        fn invalidation_store(&self) -> Arc<dyn InvalidationStore> {
            self.epoch.clone()
        }
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Board {
        id: u32,
        name: String,
    }

    #[tokio::test]
    async fn test_errors_are_absorbed() {
        let cache = ForumCache::with_backend(Arc::new(BrokenBackend::default()), &CacheSettings::new());

        assert_eq!(cache.get("k", None).await, None);
        assert!(!cache.put("k", Some(b"v"), None).await);
        assert!(!cache.clear(CacheScope::All).await);

        let stats = cache.stats();
        assert_eq!(stats.errors, 3);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn test_failed_clear_still_advances_epoch() {
        let cache = ForumCache::with_backend(Arc::new(BrokenBackend::default()), &CacheSettings::new());
        let before = cache.epoch().await;
        cache.clear(CacheScope::All).await;
        assert_eq!(cache.tracker.observed(), before + 1);
    }

    #[tokio::test]
    async fn test_null_backend_facade() {
        let cache = ForumCache::with_backend(Arc::new(NullBackend::new()), &CacheSettings::new());
        assert_eq!(cache.name(), "none");
        assert!(cache.put("board_list_3", Some(&[1, 2, 3]), None).await);
        assert_eq!(cache.get("board_list_3", None).await, None);
        assert!(cache.clear(CacheScope::All).await);
        assert_eq!(cache.epoch().await, 1);
    }

    #[cfg(feature = "shm")]
    #[tokio::test]
    async fn test_json_helpers() {
        use crate::cache::capabilities::Capabilities;
        use crate::cache::shm_backend::{SharedMemoryBackend, SharedSegment};
        use forum_cache_core::KeyNamespace;

        let backend = SharedMemoryBackend::with_segment(
            Arc::new(SharedSegment::new()),
            KeyNamespace::new("json-"),
            Arc::new(Capabilities::none().with_shared_memory(true)),
        );
        let cache = ForumCache::with_backend(Arc::new(backend), &CacheSettings::new());

        let board = Board {
            id: 3,
            name: "General".to_string(),
        };
        assert!(cache.put_json("board:3", Some(&board), None).await);
        assert_eq!(cache.get_json::<Board>("board:3", None).await, Some(board));

        // Bytes that are not JSON read as a miss.
        cache.put("raw", Some(b"\xff\x00"), None).await;
        assert_eq!(cache.get_json::<Board>("raw", None).await, None);

        assert!(cache.put_json::<Board>("board:3", None, None).await);
        assert_eq!(cache.get_json::<Board>("board:3", None).await, None);
        assert_eq!(cache.stats().deletes, 1);
    }

    #[cfg(feature = "shm")]
    #[test]
    fn test_wrapped_backend_is_enabled() {
        use crate::cache::capabilities::Capabilities;
        use crate::cache::shm_backend::{SharedMemoryBackend, SharedSegment};
        use forum_cache_core::KeyNamespace;

        let caps = Arc::new(Capabilities::none().with_shared_memory(true));
        let backend = SharedMemoryBackend::with_segment(
            Arc::new(SharedSegment::new()),
            KeyNamespace::new("wrap-"),
            caps.clone(),
        );
        let cache = ForumCache::with_backend(Arc::new(backend), &CacheSettings::new());
        assert!(cache.is_supported());
        assert!(caps.is_enabled(BackendKind::SharedMemory));

        // Another kind already enabled on the capabilities keeps its place.
        let taken = Arc::new(Capabilities::none().with_shared_memory(true));
        taken.mark_enabled(BackendKind::Lmdb);
        let other = SharedMemoryBackend::with_segment(
            Arc::new(SharedSegment::new()),
            KeyNamespace::new("wrap-"),
            taken,
        );
        assert!(!ForumCache::with_backend(Arc::new(other), &CacheSettings::new()).is_supported());
    }

    #[tokio::test]
    async fn test_report_without_registry() {
        let cache = ForumCache::with_backend(Arc::new(NullBackend::new()), &CacheSettings::new());
        let report = cache.report().await;
        assert_eq!(report.active, "none");
        assert_eq!(report.backends.len(), 1);
        assert!(report.backends[0].active);
    }
}
