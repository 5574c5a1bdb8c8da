//! Unlogged-table cache backend.
//!
//! The backend itself knows nothing about connections. It drives a
//! [`CacheTable`], which `pg_pool` implements over a deadpool-postgres pool
//! and the test utilities implement in memory.
//!
//! # Lifecycle
//!
//! `Uninitialized -> Connected -> Operational`. `connect` verifies the
//! tables exist, creating them if needed, and moves to `Connected`. The first
//! successful data statement moves to `Operational`.
//!
//! # Columns
//!
//! `key TEXT`, `value BYTEA`, `ttl BIGINT` (expiry instant, unix millis) and
//! `stored_at BIGINT` (write instant, unix millis). A row is visible while
//! `ttl > now` and, when the reader passes a max age, `stored_at >= now - age`.

use std::fmt::Debug;
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use forum_cache_core::{
    duration_millis, BackendKind, CacheResult, Clock, KeyNamespace, ScopedKey, StorageError,
    SystemClock,
};
use serde::Serialize;
use tokio::sync::OnceCell;

use super::capabilities::Capabilities;
use super::epoch::InvalidationStore;
use super::traits::{CacheBackend, CacheScope};

/// `server_version_num` of PostgreSQL 9.5, the first release with upsert.
pub const MIN_SERVER_VERSION: i32 = 90500;

/// Result of the one-time version query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PgServerInfo {
    /// Product name as reported by `version()`
    pub product: String,
    /// `server_version_num`
    pub version_num: i32,
}

impl PgServerInfo {
    pub fn new(product: impl Into<String>, version_num: i32) -> Self {
        Self {
            product: product.into(),
            version_num,
        }
    }

    /// Parse the output of `SELECT version(), current_setting('server_version_num')`.
    pub fn parse(version: &str, version_num: &str) -> Option<Self> {
        let product = version.split_whitespace().next()?;
        let version_num = version_num.trim().parse().ok()?;
        Some(Self::new(product, version_num))
    }

    pub fn is_postgres(&self) -> bool {
        self.product.eq_ignore_ascii_case("postgresql")
    }

    pub fn meets_minimum(&self) -> bool {
        self.version_num >= MIN_SERVER_VERSION
    }
}

/// Storage contract the table backend consumes.
///
/// Implementations own all SQL. Creating tables must be safe to race with
/// other processes doing the same.
#[async_trait]
pub trait CacheTable: Debug + Send + Sync {
    /// Engine product and `server_version_num`.
    async fn server_info(&self) -> CacheResult<PgServerInfo>;

    /// Whether both the cache and the epoch table are in the catalog.
    async fn table_exists(&self) -> CacheResult<bool>;

    /// Create the unlogged cache table and the epoch table if absent.
    async fn create_table(&self) -> CacheResult<()>;

    /// Value for `key` if `ttl > now_ms` and `stored_at >= cutoff_ms`.
    async fn select(&self, key: &str, now_ms: i64, cutoff_ms: i64)
        -> CacheResult<Option<Vec<u8>>>;

    /// Insert or replace in a single statement.
    async fn upsert(
        &self,
        key: &str,
        value: &[u8],
        stored_at: i64,
        expires_at: i64,
    ) -> CacheResult<()>;

    async fn delete(&self, key: &str) -> CacheResult<bool>;

    async fn truncate(&self) -> CacheResult<()>;

    async fn read_epoch(&self) -> CacheResult<u64>;

    /// Atomic increment returning the new value.
    async fn advance_epoch(&self) -> CacheResult<u64>;
}

/// Connection lifecycle of the table backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PgState {
    Uninitialized,
    Connected,
    Operational,
}

impl PgState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => PgState::Uninitialized,
            1 => PgState::Connected,
            _ => PgState::Operational,
        }
    }
}

async fn with_timeout<T, F>(after: Duration, fut: F) -> CacheResult<T>
where
    F: Future<Output = CacheResult<T>> + Send,
{
    match tokio::time::timeout(after, fut).await {
        Ok(result) => result,
        Err(_) => Err(StorageError::Timeout {
            backend: BackendKind::Postgres.name().to_string(),
            after,
        }
        .into()),
    }
}

/// Invalidation epoch kept in the single-row epoch table.
#[derive(Debug)]
pub struct PgEpochStore {
    table: Arc<dyn CacheTable>,
    timeout: Duration,
}

impl PgEpochStore {
    pub fn new(table: Arc<dyn CacheTable>, timeout: Duration) -> Self {
        Self { table, timeout }
    }
}

#[async_trait]
impl InvalidationStore for PgEpochStore {
    async fn current(&self) -> CacheResult<u64> {
        with_timeout(self.timeout, self.table.read_epoch()).await
    }

    async fn advance(&self) -> CacheResult<u64> {
        with_timeout(self.timeout, self.table.advance_epoch()).await
    }
}

/// Cache backend over an unlogged PostgreSQL table.
#[derive(Debug)]
pub struct PostgresBackend {
    table: Arc<dyn CacheTable>,
    epoch: Arc<PgEpochStore>,
    namespace: KeyNamespace,
    caps: Arc<Capabilities>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
    state: AtomicU8,
    connected: OnceCell<()>,
}

impl PostgresBackend {
    pub fn new(
        table: Arc<dyn CacheTable>,
        namespace: KeyNamespace,
        caps: Arc<Capabilities>,
        timeout: Duration,
    ) -> Self {
        Self {
            epoch: Arc::new(PgEpochStore::new(table.clone(), timeout)),
            table,
            namespace,
            caps,
            clock: Arc::new(SystemClock),
            timeout,
            state: AtomicU8::new(PgState::Uninitialized as u8),
            connected: OnceCell::new(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn state(&self) -> PgState {
        PgState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Row key for `key`.
    pub fn storage_key(&self, key: &ScopedKey) -> String {
        self.namespace.storage_key(key)
    }

    fn mark_operational(&self) {
        self.state
            .fetch_max(PgState::Operational as u8, Ordering::SeqCst);
    }

    async fn timed<T, F>(&self, fut: F) -> CacheResult<T>
    where
        F: Future<Output = CacheResult<T>> + Send,
    {
        with_timeout(self.timeout, fut).await
    }
}

#[async_trait]
impl CacheBackend for PostgresBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Postgres
    }

    fn is_supported(&self, probe: bool) -> bool {
        let available = self
            .caps
            .postgres
            .as_ref()
            .is_some_and(|info| info.is_postgres() && info.meets_minimum());
        available && (probe || self.caps.is_enabled(self.kind()))
    }

    fn capabilities(&self) -> Option<&Arc<Capabilities>> {
        Some(&self.caps)
    }

    fn unsupported_reason(&self) -> Option<String> {
        match &self.caps.postgres {
            None => Some(
                self.caps
                    .postgres_error
                    .clone()
                    .unwrap_or_else(|| "server not detected".to_string()),
            ),
            Some(info) if !info.is_postgres() => {
                Some(format!("server reports {}, not PostgreSQL", info.product))
            }
            Some(info) if !info.meets_minimum() => Some(format!(
                "server_version_num {} is below {}",
                info.version_num, MIN_SERVER_VERSION
            )),
            Some(_) => None,
        }
    }

    async fn connect(&self) -> CacheResult<()> {
        self.connected
            .get_or_try_init(|| async {
                if !self.timed(self.table.table_exists()).await? {
                    tracing::info!(backend = self.name(), "Creating cache tables");
                    self.timed(self.table.create_table()).await?;
                }
                self.state
                    .fetch_max(PgState::Connected as u8, Ordering::SeqCst);
                Ok::<_, forum_cache_core::CacheError>(())
            })
            .await?;
        Ok(())
    }

    async fn get_data(
        &self,
        key: &ScopedKey,
        ttl: Option<Duration>,
    ) -> CacheResult<Option<Vec<u8>>> {
        self.connect().await?;

        let storage_key = self.storage_key(key);
        let now = self.clock.now_millis();
        let cutoff = match ttl.filter(|ttl| !ttl.is_zero()) {
            Some(max_age) => now.saturating_sub(duration_millis(max_age)),
            None => i64::MIN,
        };

        let value = self
            .timed(self.table.select(&storage_key, now, cutoff))
            .await?;
        self.mark_operational();
        Ok(value)
    }

    async fn put_data(
        &self,
        key: &ScopedKey,
        value: Option<&[u8]>,
        ttl: Option<Duration>,
    ) -> CacheResult<bool> {
        self.connect().await?;
        let storage_key = self.storage_key(key);

        match value {
            None => {
                self.timed(self.table.delete(&storage_key)).await?;
            }
            Some(bytes) => {
                let now = self.clock.now_millis();
                let expires_at = match ttl.filter(|ttl| !ttl.is_zero()) {
                    Some(ttl) => now.saturating_add(duration_millis(ttl)),
                    None => i64::MAX,
                };
                self.timed(self.table.upsert(&storage_key, bytes, now, expires_at))
                    .await?;
            }
        }
        self.mark_operational();
        Ok(true)
    }

    async fn clean_cache(&self, scope: CacheScope) -> CacheResult<bool> {
        self.connect().await?;

        let truncated = self.timed(self.table.truncate()).await;
        let epoch = self.epoch.advance().await?;
        truncated?;

        tracing::debug!(backend = self.name(), ?scope, epoch, "Truncated cache table");
        Ok(true)
    }

    fn invalidation_store(&self) -> Arc<dyn InvalidationStore> {
        self.epoch.clone()
    }
}
