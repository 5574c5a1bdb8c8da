//! Forum Cache Test Utilities
//!
//! Centralized test infrastructure for the forum cache workspace:
//! - An in-memory `CacheTable` that stands in for PostgreSQL
//! - Proptest generators for keys, values and TTLs
//! - Test fixtures for settings and backends
//! - Custom assertions for cache results

pub use forum_cache_core::{
    AdminCredentials, BackendKind, CacheError, CacheResult, CacheSettings, Clock, KeyNamespace,
    ManualClock, ScopedKey, StorageError,
};
pub use forum_cache_storage::cache::{CacheScope, CacheTable, Capabilities, PgServerInfo};

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

// ============================================================================
// IN-MEMORY CACHE TABLE
// ============================================================================

/// A row exactly as the table backend wrote it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRow {
    pub value: Vec<u8>,
    /// Expiry instant, unix millis
    pub ttl: i64,
    /// Write instant, unix millis
    pub stored_at: i64,
}

#[derive(Debug, Default)]
struct TableState {
    exists: bool,
    rows: HashMap<String, RawRow>,
    epoch: u64,
}

/// In-memory stand-in for the unlogged cache table.
///
/// Several backends may share one instance to play the part of several
/// processes talking to the same database.
#[derive(Debug)]
pub struct MemoryCacheTable {
    state: Mutex<TableState>,
    server: PgServerInfo,
    failing: AtomicBool,
    latency: Option<Duration>,
    create_calls: AtomicU32,
}

impl Default for MemoryCacheTable {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCacheTable {
    /// A current PostgreSQL server with no tables yet.
    pub fn new() -> Self {
        Self::with_server("PostgreSQL", 160002)
    }

    pub fn with_server(product: &str, version_num: i32) -> Self {
        Self {
            state: Mutex::new(TableState::default()),
            server: PgServerInfo::new(product, version_num),
            failing: AtomicBool::new(false),
            latency: None,
            create_calls: AtomicU32::new(0),
        }
    }

    /// Delay every call, to exercise timeouts.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Make every call fail until switched back.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Row stored under the exact storage key, ignoring expiry.
    pub fn raw_row(&self, storage_key: &str) -> Option<RawRow> {
        self.state
            .lock()
            .ok()
            .and_then(|state| state.rows.get(storage_key).cloned())
    }

    pub fn row_count(&self) -> usize {
        self.state.lock().map(|state| state.rows.len()).unwrap_or(0)
    }

    pub fn tables_exist(&self) -> bool {
        self.state.lock().map(|state| state.exists).unwrap_or(false)
    }

    /// How many times `create_table` ran.
    pub fn create_calls(&self) -> u32 {
        self.create_calls.load(Ordering::SeqCst)
    }

    async fn enter(&self) -> CacheResult<MutexGuard<'_, TableState>> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(CacheError::from(StorageError::ConnectionFailed {
                backend: "postgres".to_string(),
                reason: "connection refused".to_string(),
            }));
        }
        self.state
            .lock()
            .map_err(|_| CacheError::from(StorageError::LockPoisoned))
    }
}

#[async_trait]
impl CacheTable for MemoryCacheTable {
    async fn server_info(&self) -> CacheResult<PgServerInfo> {
        drop(self.enter().await?);
        Ok(self.server.clone())
    }

    async fn table_exists(&self) -> CacheResult<bool> {
        Ok(self.enter().await?.exists)
    }

    async fn create_table(&self) -> CacheResult<()> {
        drop(self.enter().await?);
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        // Let a concurrent creator interleave between check and create.
        tokio::task::yield_now().await;
        self.enter().await?.exists = true;
        Ok(())
    }

    async fn select(
        &self,
        key: &str,
        now_ms: i64,
        cutoff_ms: i64,
    ) -> CacheResult<Option<Vec<u8>>> {
        let state = self.enter().await?;
        Ok(state
            .rows
            .get(key)
            .filter(|row| row.ttl > now_ms && row.stored_at >= cutoff_ms)
            .map(|row| row.value.clone()))
    }

    async fn upsert(
        &self,
        key: &str,
        value: &[u8],
        stored_at: i64,
        expires_at: i64,
    ) -> CacheResult<()> {
        let mut state = self.enter().await?;
        state.rows.insert(
            key.to_string(),
            RawRow {
                value: value.to_vec(),
                ttl: expires_at,
                stored_at,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        Ok(self.enter().await?.rows.remove(key).is_some())
    }

    async fn truncate(&self) -> CacheResult<()> {
        self.enter().await?.rows.clear();
        Ok(())
    }

    async fn read_epoch(&self) -> CacheResult<u64> {
        Ok(self.enter().await?.epoch)
    }

    async fn advance_epoch(&self) -> CacheResult<u64> {
        let mut state = self.enter().await?;
        state.epoch += 1;
        Ok(state.epoch)
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for cache inputs.

    use super::*;
    use proptest::prelude::*;

    /// Logical keys shaped like the forum's, separators included.
    pub fn arb_cache_key() -> impl Strategy<Value = String> {
        "[a-z_]{1,24}([:/][0-9]{1,4}){0,2}"
    }

    pub fn arb_value() -> impl Strategy<Value = Vec<u8>> {
        prop::collection::vec(any::<u8>(), 0..512)
    }

    /// A positive TTL of up to an hour.
    pub fn arb_ttl() -> impl Strategy<Value = Duration> {
        (1u64..3600).prop_map(Duration::from_secs)
    }

    pub fn arb_scope() -> impl Strategy<Value = CacheScope> {
        prop_oneof![
            Just(CacheScope::All),
            Just(CacheScope::User),
            Just(CacheScope::Data),
        ]
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built fixtures for common cache test scenarios.

    use super::*;

    /// Settings with a fixed prefix and an epoch that is re-read on every
    /// operation.
    pub fn test_settings(prefix: &str) -> CacheSettings {
        CacheSettings::new()
            .with_key_prefix(prefix)
            .with_epoch_refresh(Duration::ZERO)
    }

    pub fn admin_credentials() -> AdminCredentials {
        AdminCredentials::new("admin", "correct horse battery staple")
            .expect("fixture credentials are non-empty")
    }

    /// Capabilities describing the given table's server.
    pub fn postgres_capabilities(table: &MemoryCacheTable) -> Capabilities {
        Capabilities::none().with_postgres(table.server.clone())
    }

    /// A manual clock starting now.
    pub fn manual_clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new())
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for cache results.

    use super::*;

    /// Assert that a CacheResult is a Storage error.
    #[track_caller]
    pub fn assert_storage_error<T: std::fmt::Debug>(result: &CacheResult<T>) {
        match result {
            Err(CacheError::Storage(_)) => {}
            other => panic!("Expected Storage error, got: {:?}", other),
        }
    }

    /// Assert that a CacheResult is a Timeout storage error.
    #[track_caller]
    pub fn assert_timeout<T: std::fmt::Debug>(result: &CacheResult<T>) {
        match result {
            Err(CacheError::Storage(StorageError::Timeout { .. })) => {}
            other => panic!("Expected Timeout error, got: {:?}", other),
        }
    }

    /// Assert a facade read hit with the expected bytes.
    #[track_caller]
    pub fn assert_hit(read: &Option<Vec<u8>>, expected: &[u8]) {
        assert_eq!(read.as_deref(), Some(expected), "Expected cache hit");
    }

    #[track_caller]
    pub fn assert_miss(read: &Option<Vec<u8>>) {
        assert!(read.is_none(), "Expected cache miss, got: {:?}", read);
    }
}

// ============================================================================
// TESTS
// ============================================================================
