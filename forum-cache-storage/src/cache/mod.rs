//! Pluggable short-term cache with epoch-based invalidation.
//!
//! Expensive query results (board lists, menus, permission sets) are parked
//! here under a caller-chosen key for a bounded time. Any supported storage
//! medium may sit behind the [`CacheBackend`] trait; the [`BackendRegistry`]
//! picks one at startup and [`ForumCache`] is the single entry point.
//!
//! # Invalidation
//!
//! Every key is scoped to the current invalidation epoch before it reaches a
//! backend. Clearing the cache advances the epoch, which makes every older
//! entry unreachable at once, whether or not the backend managed to delete
//! anything.
//!
//! # Failure model
//!
//! The cache is an optimisation. Unsupported backends fall back to the null
//! backend, and storage failures surface from the facade as misses or
//! `false`, logged at `warn`.
//!
//! # Example
//!
//! ```ignore
//! let cache = ForumCache::from_settings(&CacheSettings::from_env()?).await;
//!
//! cache.put("board_list_3", Some(&[1, 2, 3]), Some(Duration::from_secs(300))).await;
//! assert_eq!(cache.get("board_list_3", None).await, Some(vec![1, 2, 3]));
//!
//! cache.clear(CacheScope::All).await;
//! assert_eq!(cache.get("board_list_3", None).await, None);
//! ```

pub mod capabilities;
pub mod diagnostics;
pub mod epoch;
pub mod facade;
#[cfg(feature = "lmdb")]
pub mod lmdb_backend;
pub mod null_backend;
pub mod pg_backend;
#[cfg(feature = "postgres")]
pub mod pg_pool;
pub mod selector;
#[cfg(feature = "shm")]
pub mod shm_backend;
pub mod traits;

pub use capabilities::Capabilities;
pub use diagnostics::{BackendReport, CacheReport};
pub use epoch::{EpochTracker, InvalidationStore, MemoryEpochStore};
pub use facade::ForumCache;
#[cfg(feature = "lmdb")]
pub use lmdb_backend::{LmdbCacheBackend, LmdbCacheError, LmdbEpochStore, Partition};
pub use null_backend::NullBackend;
pub use pg_backend::{
    CacheTable, PgEpochStore, PgServerInfo, PgState, PostgresBackend, MIN_SERVER_VERSION,
};
#[cfg(feature = "postgres")]
pub use pg_pool::{create_pool, PooledCacheTable};
pub use selector::BackendRegistry;
#[cfg(feature = "shm")]
pub use shm_backend::{Segment, SharedMemoryBackend, SharedSegment};
pub use traits::{CacheBackend, CacheScope, CacheStats};
