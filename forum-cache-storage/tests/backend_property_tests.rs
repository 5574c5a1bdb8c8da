//! Property-Based Tests for Cache Backends
//!
//! **Property 1: Round-trip.** For any key and value, a put followed by a
//! get within the TTL returns the value.
//!
//! **Property 3: Delete via null.** A put with no value makes the next get
//! miss.
//!
//! **Property 4: Epoch invalidation.** After a clear, no key written before
//! it is readable, whatever the backend physically did.
//!
//! Each property runs against the shared-memory, table and LMDB backends.

use std::sync::Arc;
use std::time::Duration;

use forum_cache_storage::cache::{
    CacheBackend, CacheScope, Capabilities, ForumCache, LmdbCacheBackend, PostgresBackend,
    SharedMemoryBackend, SharedSegment,
};
use forum_cache_storage::{KeyNamespace, ScopedKey};
use forum_cache_test_utils::{fixtures, generators, MemoryCacheTable};
use proptest::prelude::*;
use tempfile::TempDir;
use tokio::runtime::Runtime;

// ============================================================================
// TEST CONFIGURATION
// ============================================================================

fn test_runtime() -> Result<Runtime, TestCaseError> {
    Runtime::new().map_err(|e| TestCaseError::fail(format!("Failed to create runtime: {}", e)))
}

/// Every backend under test, plus whatever keeps it alive.
struct Backends {
    all: Vec<Arc<dyn CacheBackend>>,
    _lmdb_dir: TempDir,
}

fn backends() -> Result<Backends, TestCaseError> {
    let namespace = KeyNamespace::new("prop-");

    let shm = SharedMemoryBackend::with_segment(
        Arc::new(SharedSegment::new()),
        namespace.clone(),
        Arc::new(Capabilities::none().with_shared_memory(true)),
    );

    let table = Arc::new(MemoryCacheTable::new());
    let pg = PostgresBackend::new(
        table.clone(),
        namespace.clone(),
        Arc::new(fixtures::postgres_capabilities(&table)),
        Duration::from_secs(1),
    );

    let dir = TempDir::new().map_err(|e| TestCaseError::fail(e.to_string()))?;
    let lmdb = LmdbCacheBackend::new(
        dir.path(),
        16,
        namespace,
        Arc::new(Capabilities::none().with_lmdb(16)),
        Some(fixtures::admin_credentials()),
    );

    let all: Vec<Arc<dyn CacheBackend>> = vec![Arc::new(shm), Arc::new(pg), Arc::new(lmdb)];
    Ok(Backends {
        all,
        _lmdb_dir: dir,
    })
}

// ============================================================================
// PROPERTIES
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_round_trip(
        key in generators::arb_cache_key(),
        value in generators::arb_value(),
        ttl in generators::arb_ttl(),
    ) {
        let rt = test_runtime()?;
        let backends = backends()?;

        rt.block_on(async {
            for backend in &backends.all {
                backend.connect().await.map_err(|e| TestCaseError::fail(e.to_string()))?;
                let scoped = ScopedKey::new(0, key.clone());

                let stored = backend
                    .put_data(&scoped, Some(&value), Some(ttl))
                    .await
                    .map_err(|e| TestCaseError::fail(e.to_string()))?;
                prop_assert!(stored, "{} refused a put", backend.name());

                let read = backend
                    .get_data(&scoped, Some(ttl))
                    .await
                    .map_err(|e| TestCaseError::fail(e.to_string()))?;
                prop_assert_eq!(read.as_ref(), Some(&value), "{} lost the value", backend.name());
            }
            Ok(())
        })?;
    }

    #[test]
    fn prop_null_put_deletes(
        key in generators::arb_cache_key(),
        value in generators::arb_value(),
    ) {
        let rt = test_runtime()?;
        let backends = backends()?;

        rt.block_on(async {
            for backend in &backends.all {
                let scoped = ScopedKey::new(0, key.clone());
                backend
                    .put_data(&scoped, Some(&value), None)
                    .await
                    .map_err(|e| TestCaseError::fail(e.to_string()))?;
                backend
                    .put_data(&scoped, None, None)
                    .await
                    .map_err(|e| TestCaseError::fail(e.to_string()))?;

                let read = backend
                    .get_data(&scoped, None)
                    .await
                    .map_err(|e| TestCaseError::fail(e.to_string()))?;
                prop_assert!(read.is_none(), "{} still returned a deleted key", backend.name());
            }
            Ok(())
        })?;
    }

    #[test]
    fn prop_clear_invalidates_every_earlier_key(
        keys in prop::collection::hash_set(generators::arb_cache_key(), 1..8),
        scope in generators::arb_scope(),
    ) {
        let rt = test_runtime()?;
        let backends = backends()?;
        let settings = fixtures::test_settings("prop-");

        rt.block_on(async {
            for backend in &backends.all {
                let cache = ForumCache::with_backend(backend.clone(), &settings);
                for key in &keys {
                    prop_assert!(cache.put(key, Some(b"cached"), None).await);
                }

                let before = cache.epoch().await;
                cache.clear(scope).await;
                prop_assert!(cache.epoch().await > before);

                for key in &keys {
                    prop_assert!(
                        cache.get(key, None).await.is_none(),
                        "{} served {} after clear({:?})",
                        backend.name(),
                        key,
                        scope
                    );
                }
            }
            Ok(())
        })?;
    }
}
