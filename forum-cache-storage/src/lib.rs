//! Forum Cache Storage - Backends, Selection and Facade
//!
//! Implements the cache backends (shared memory, PostgreSQL table, LMDB and
//! the null fallback), the invalidation epoch and the [`ForumCache`] facade.
//! Shared types live in `forum-cache-core`.

pub mod cache;

pub use cache::{
    BackendRegistry, CacheBackend, CacheReport, CacheScope, CacheStats, CacheTable, Capabilities,
    EpochTracker, ForumCache, InvalidationStore, MemoryEpochStore, NullBackend, PgServerInfo,
    PostgresBackend,
};

#[cfg(feature = "lmdb")]
pub use cache::{LmdbCacheBackend, LmdbCacheError};
#[cfg(feature = "postgres")]
pub use cache::PooledCacheTable;
#[cfg(feature = "shm")]
pub use cache::{SharedMemoryBackend, SharedSegment};

pub use forum_cache_core::{
    AdminCredentials, BackendKind, BackendPreference, CacheError, CacheResult, CacheSettings,
    DbConfig, KeyNamespace, LmdbSettings, ScopedKey,
};
