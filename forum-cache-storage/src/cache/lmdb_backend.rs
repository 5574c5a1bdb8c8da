//! LMDB-backed cache with administrative clearing.
//!
//! Uses the heed crate (Rust bindings for LMDB) to keep entries in a
//! memory-mapped environment shared by every process on the host.
//!
//! # Partitions
//!
//! - `vars`: caller entries written through [`CacheBackend::put_data`]
//! - `code`: the data partition, filled by other subsystems through
//!   [`LmdbCacheBackend::put_partition`]
//! - `meta`: bookkeeping, currently only the invalidation epoch
//!
//! Physically clearing either partition requires [`AdminCredentials`].
//! Without them `clean_cache` still advances the epoch, so stale entries
//! become unreachable, and reports `false`.
//!
//! # Entry layout
//!
//! `[stored_at: i64 LE][expires_at: i64 LE][epoch: u64 LE][payload]`,
//! timestamps in unix millis. Entries that never expire carry `i64::MAX`.
//!
//! # Reclaiming space
//!
//! Expired entries are deleted when a read finds them. When a write hits
//! `MDB_MAP_FULL`, `vars` is swept of expired entries and entries written
//! under an older epoch, then the write is retried once.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use forum_cache_core::{
    duration_millis, AdminCredentials, BackendKind, CacheError, CacheResult, Clock, KeyNamespace,
    ScopedKey, StorageError, SystemClock,
};
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};
use sha2::{Digest, Sha256};
use tokio::sync::OnceCell;

use super::capabilities::Capabilities;
use super::epoch::InvalidationStore;
use super::traits::{CacheBackend, CacheScope};

/// LMDB's default maximum key size.
const MAX_KEY_LEN: usize = 511;

const HEADER_LEN: usize = 24;

const EPOCH_KEY: &[u8] = b"epoch";

/// Error type for LMDB cache operations.
#[derive(Debug, thiserror::Error)]
pub enum LmdbCacheError {
    /// Failed to open or create the LMDB environment.
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    /// Failed to open a database within the environment.
    #[error("Failed to open database: {0}")]
    DbOpen(String),

    /// Transaction error.
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// The memory map has no room left for the write.
    #[error("LMDB map is full")]
    MapFull,

    /// Stored bytes do not match the entry layout.
    #[error("Corrupt entry: {0}")]
    Corrupt(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LmdbCacheError> for CacheError {
    fn from(e: LmdbCacheError) -> Self {
        match e {
            LmdbCacheError::EnvOpen(reason) | LmdbCacheError::DbOpen(reason) => {
                CacheError::Storage(StorageError::ConnectionFailed {
                    backend: BackendKind::Lmdb.name().to_string(),
                    reason,
                })
            }
            LmdbCacheError::Io(io) => CacheError::Storage(StorageError::ConnectionFailed {
                backend: BackendKind::Lmdb.name().to_string(),
                reason: io.to_string(),
            }),
            LmdbCacheError::Corrupt(reason) => CacheError::Storage(StorageError::CorruptEntry {
                key: String::new(),
                reason,
            }),
            LmdbCacheError::Transaction(reason) => {
                CacheError::Storage(StorageError::TransactionFailed { reason })
            }
            LmdbCacheError::MapFull => CacheError::Storage(StorageError::TransactionFailed {
                reason: "LMDB map is full".to_string(),
            }),
        }
    }
}

fn txn_err(e: heed::Error) -> LmdbCacheError {
    match e {
        heed::Error::Mdb(heed::MdbError::MapFull) => LmdbCacheError::MapFull,
        other => LmdbCacheError::Transaction(other.to_string()),
    }
}

/// Physical partition inside the environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Partition {
    /// Caller entries
    Vars,
    /// Data written by other subsystems
    Code,
}

/// Opened environment and its databases.
struct LmdbStore {
    env: Env,
    vars: Database<Bytes, Bytes>,
    code: Database<Bytes, Bytes>,
    meta: Database<Bytes, Bytes>,
}

impl LmdbStore {
    fn open(path: &Path, map_size_mb: usize) -> Result<Self, LmdbCacheError> {
        std::fs::create_dir_all(path)?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(map_size_mb * 1024 * 1024)
                .max_dbs(3)
                .open(path)
        }
        .map_err(|e| LmdbCacheError::EnvOpen(e.to_string()))?;

        let mut wtxn = env.write_txn().map_err(txn_err)?;
        let vars = env
            .create_database(&mut wtxn, Some("vars"))
            .map_err(|e| LmdbCacheError::DbOpen(e.to_string()))?;
        let code = env
            .create_database(&mut wtxn, Some("code"))
            .map_err(|e| LmdbCacheError::DbOpen(e.to_string()))?;
        let meta = env
            .create_database(&mut wtxn, Some("meta"))
            .map_err(|e| LmdbCacheError::DbOpen(e.to_string()))?;
        wtxn.commit().map_err(txn_err)?;

        Ok(Self {
            env,
            vars,
            code,
            meta,
        })
    }

    fn db(&self, partition: Partition) -> &Database<Bytes, Bytes> {
        match partition {
            Partition::Vars => &self.vars,
            Partition::Code => &self.code,
        }
    }

    /// Live payload under `key`. An expired entry is deleted on the way out.
    fn get(
        &self,
        partition: Partition,
        key: &[u8],
        now_ms: i64,
    ) -> Result<Option<Vec<u8>>, LmdbCacheError> {
        {
            let rtxn = self.env.read_txn().map_err(txn_err)?;
            let Some(bytes) = self.db(partition).get(&rtxn, key).map_err(txn_err)? else {
                return Ok(None);
            };
            let header = EntryHeader::decode(bytes)?;
            if header.is_live(now_ms) {
                return Ok(Some(bytes[HEADER_LEN..].to_vec()));
            }
        }

        // Another writer may have replaced the entry since the read.
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        let db = self.db(partition);
        let still_expired = match db.get(&wtxn, key).map_err(txn_err)? {
            Some(bytes) => !EntryHeader::decode(bytes)?.is_live(now_ms),
            None => false,
        };
        if still_expired {
            db.delete(&mut wtxn, key).map_err(txn_err)?;
        }
        wtxn.commit().map_err(txn_err)?;
        Ok(None)
    }

    /// Write an entry. On a full map, `vars` is swept and the write retried
    /// once.
    fn put(
        &self,
        partition: Partition,
        key: &[u8],
        value: &[u8],
        header: EntryHeader,
    ) -> Result<(), LmdbCacheError> {
        let mut full_bytes = Vec::with_capacity(HEADER_LEN + value.len());
        header.encode_into(&mut full_bytes);
        full_bytes.extend_from_slice(value);

        match self.write(partition, key, &full_bytes) {
            Err(LmdbCacheError::MapFull) => {
                let removed = self.sweep_vars(header.stored_at)?;
                tracing::debug!(removed, "LMDB map full, swept stale entries");
                self.write(partition, key, &full_bytes)
            }
            other => other,
        }
    }

    fn write(&self, partition: Partition, key: &[u8], bytes: &[u8]) -> Result<(), LmdbCacheError> {
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        self.db(partition).put(&mut wtxn, key, bytes).map_err(txn_err)?;
        wtxn.commit().map_err(txn_err)
    }

    /// Delete `vars` entries that are expired or belong to an older epoch.
    fn sweep_vars(&self, now_ms: i64) -> Result<u64, LmdbCacheError> {
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        let epoch = match self.meta.get(&wtxn, EPOCH_KEY).map_err(txn_err)? {
            Some(bytes) => decode_epoch(bytes)?,
            None => 0,
        };

        let mut stale = Vec::new();
        for item in self.vars.iter(&wtxn).map_err(txn_err)? {
            let (key, bytes) = item.map_err(txn_err)?;
            // Unreadable entries are reclaimed too.
            let keep = EntryHeader::decode(bytes)
                .map(|header| header.is_live(now_ms) && header.epoch >= epoch)
                .unwrap_or(false);
            if !keep {
                stale.push(key.to_vec());
            }
        }

        for key in &stale {
            self.vars.delete(&mut wtxn, key).map_err(txn_err)?;
        }
        wtxn.commit().map_err(txn_err)?;
        Ok(stale.len() as u64)
    }

    fn delete(&self, partition: Partition, key: &[u8]) -> Result<bool, LmdbCacheError> {
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        let deleted = self.db(partition).delete(&mut wtxn, key).map_err(txn_err)?;
        wtxn.commit().map_err(txn_err)?;
        Ok(deleted)
    }

    fn clear(&self, partitions: &[Partition]) -> Result<(), LmdbCacheError> {
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        for partition in partitions {
            self.db(*partition).clear(&mut wtxn).map_err(txn_err)?;
        }
        wtxn.commit().map_err(txn_err)
    }

    fn len(&self, partition: Partition) -> Result<u64, LmdbCacheError> {
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        self.db(partition).len(&rtxn).map_err(txn_err)
    }

    fn read_epoch(&self) -> Result<u64, LmdbCacheError> {
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        match self.meta.get(&rtxn, EPOCH_KEY).map_err(txn_err)? {
            Some(bytes) => decode_epoch(bytes),
            None => Ok(0),
        }
    }

    /// Read-increment-write inside one write transaction. LMDB allows a
    /// single writer per environment, across processes too.
    fn advance_epoch(&self) -> Result<u64, LmdbCacheError> {
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        let current = match self.meta.get(&wtxn, EPOCH_KEY).map_err(txn_err)? {
            Some(bytes) => decode_epoch(bytes)?,
            None => 0,
        };
        let next = current.saturating_add(1);
        self.meta
            .put(&mut wtxn, EPOCH_KEY, &next.to_be_bytes())
            .map_err(txn_err)?;
        wtxn.commit().map_err(txn_err)?;
        Ok(next)
    }
}

#[derive(Debug, Clone, Copy)]
struct EntryHeader {
    stored_at: i64,
    expires_at: i64,
    epoch: u64,
}

impl EntryHeader {
    fn decode(bytes: &[u8]) -> Result<Self, LmdbCacheError> {
        if bytes.len() < HEADER_LEN {
            return Err(LmdbCacheError::Corrupt(format!(
                "entry is {} bytes, header needs {}",
                bytes.len(),
                HEADER_LEN
            )));
        }
        Ok(Self {
            stored_at: i64::from_le_bytes(read_word(&bytes[0..8])?),
            expires_at: i64::from_le_bytes(read_word(&bytes[8..16])?),
            epoch: u64::from_le_bytes(read_word(&bytes[16..24])?),
        })
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.stored_at.to_le_bytes());
        out.extend_from_slice(&self.expires_at.to_le_bytes());
        out.extend_from_slice(&self.epoch.to_le_bytes());
    }

    fn is_live(&self, now_ms: i64) -> bool {
        self.expires_at > now_ms
    }
}

fn read_word(bytes: &[u8]) -> Result<[u8; 8], LmdbCacheError> {
    bytes
        .try_into()
        .map_err(|_| LmdbCacheError::Corrupt("invalid header field".into()))
}

fn decode_epoch(bytes: &[u8]) -> Result<u64, LmdbCacheError> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| LmdbCacheError::Corrupt("invalid epoch".into()))?;
    Ok(u64::from_be_bytes(raw))
}

/// Lazily opened environment, shared by the backend and its epoch store.
///
/// heed refuses to open the same path twice in one process, so handles are
/// shared per path for as long as one is alive.
struct LmdbHandle {
    path: PathBuf,
    map_size_mb: usize,
    store: OnceCell<LmdbStore>,
}

impl fmt::Debug for LmdbHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LmdbHandle")
            .field("path", &self.path)
            .field("map_size_mb", &self.map_size_mb)
            .field("opened", &self.store.initialized())
            .finish()
    }
}

impl LmdbHandle {
    fn shared(path: &Path, map_size_mb: usize) -> Arc<LmdbHandle> {
        static HANDLES: OnceLock<Mutex<HashMap<PathBuf, Weak<LmdbHandle>>>> = OnceLock::new();

        let handles = HANDLES.get_or_init(Default::default);
        let mut handles = match handles.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        handles.retain(|_, handle| handle.strong_count() > 0);

        if let Some(handle) = handles.get(path).and_then(Weak::upgrade) {
            return handle;
        }
        let handle = Arc::new(LmdbHandle {
            path: path.to_path_buf(),
            map_size_mb,
            store: OnceCell::new(),
        });
        handles.insert(path.to_path_buf(), Arc::downgrade(&handle));
        handle
    }

    async fn open(&self) -> Result<&LmdbStore, LmdbCacheError> {
        self.store
            .get_or_try_init(|| async {
                let store = LmdbStore::open(&self.path, self.map_size_mb)?;
                tracing::info!(
                    path = %self.path.display(),
                    map_size_mb = self.map_size_mb,
                    "Opened LMDB cache environment"
                );
                Ok::<_, LmdbCacheError>(store)
            })
            .await
    }
}

/// Invalidation epoch kept under the `epoch` key of the `meta` database.
#[derive(Debug)]
pub struct LmdbEpochStore {
    handle: Arc<LmdbHandle>,
}

#[async_trait]
impl InvalidationStore for LmdbEpochStore {
    async fn current(&self) -> CacheResult<u64> {
        Ok(self.handle.open().await?.read_epoch()?)
    }

    async fn advance(&self) -> CacheResult<u64> {
        Ok(self.handle.open().await?.advance_epoch()?)
    }
}

/// LMDB-backed cache with administrative clearing.
///
/// # Example
///
/// ```ignore
/// use forum_cache_storage::cache::{LmdbCacheBackend, CacheBackend};
///
/// let backend = LmdbCacheBackend::new(
///     &settings.lmdb.path,
///     settings.lmdb.map_size_mb,
///     settings.namespace(),
///     caps,
///     settings.admin.clone(),
/// );
/// backend.connect().await?;
/// backend.put_data(&ScopedKey::new(epoch, "board_list_3"), Some(&bytes), None).await?;
/// ```
#[derive(Debug)]
pub struct LmdbCacheBackend {
    handle: Arc<LmdbHandle>,
    epoch: Arc<LmdbEpochStore>,
    namespace: KeyNamespace,
    caps: Arc<Capabilities>,
    /// Admin gate for physical clears.
    admin: Option<AdminCredentials>,
    clock: Arc<dyn Clock>,
}

impl LmdbCacheBackend {
    /// Create the backend. The environment is opened by `connect`.
    pub fn new(
        path: impl AsRef<Path>,
        map_size_mb: usize,
        namespace: KeyNamespace,
        caps: Arc<Capabilities>,
        admin: Option<AdminCredentials>,
    ) -> Self {
        let handle = LmdbHandle::shared(path.as_ref(), map_size_mb);
        Self {
            epoch: Arc::new(LmdbEpochStore {
                handle: handle.clone(),
            }),
            handle,
            namespace,
            caps,
            admin,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn has_admin_credentials(&self) -> bool {
        self.admin.is_some()
    }

    /// Key as written to the `vars` partition.
    pub fn storage_key(&self, key: &ScopedKey) -> Vec<u8> {
        let storage_key = self.namespace.storage_key(key);
        if storage_key.len() <= MAX_KEY_LEN {
            storage_key.into_bytes()
        } else {
            format!("h-{}", hex::encode(Sha256::digest(storage_key.as_bytes()))).into_bytes()
        }
    }

    /// Write directly into a partition, bypassing epoch scoping.
    pub async fn put_partition(
        &self,
        partition: Partition,
        key: &str,
        value: &[u8],
    ) -> CacheResult<()> {
        let store = self.handle.open().await?;
        let header = EntryHeader {
            stored_at: self.clock.now_millis(),
            expires_at: i64::MAX,
            epoch: 0,
        };
        store.put(partition, key.as_bytes(), value, header)?;
        Ok(())
    }

    /// Number of entries in a partition, expired or not.
    pub async fn partition_len(&self, partition: Partition) -> CacheResult<u64> {
        Ok(self.handle.open().await?.len(partition)?)
    }
}

#[async_trait]
impl CacheBackend for LmdbCacheBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Lmdb
    }

    fn is_supported(&self, probe: bool) -> bool {
        let available = self.caps.lmdb && self.caps.lmdb_map_size_mb > 0;
        available && (probe || self.caps.is_enabled(self.kind()))
    }

    fn capabilities(&self) -> Option<&Arc<Capabilities>> {
        Some(&self.caps)
    }

    fn unsupported_reason(&self) -> Option<String> {
        if !self.caps.lmdb {
            Some("built without the lmdb feature".to_string())
        } else if self.caps.lmdb_map_size_mb == 0 {
            Some("variable storage size is zero".to_string())
        } else {
            None
        }
    }

    async fn connect(&self) -> CacheResult<()> {
        self.handle.open().await?;
        Ok(())
    }

    async fn get_data(
        &self,
        key: &ScopedKey,
        _ttl: Option<Duration>,
    ) -> CacheResult<Option<Vec<u8>>> {
        let store = self.handle.open().await?;
        let storage_key = self.storage_key(key);
        store
            .get(Partition::Vars, &storage_key, self.clock.now_millis())
            .map_err(|e| match e {
                LmdbCacheError::Corrupt(reason) => CacheError::Storage(StorageError::CorruptEntry {
                    key: key.key().to_string(),
                    reason,
                }),
                other => other.into(),
            })
    }

    async fn put_data(
        &self,
        key: &ScopedKey,
        value: Option<&[u8]>,
        ttl: Option<Duration>,
    ) -> CacheResult<bool> {
        let store = self.handle.open().await?;
        let storage_key = self.storage_key(key);

        let Some(bytes) = value else {
            store.delete(Partition::Vars, &storage_key)?;
            return Ok(true);
        };

        let now = self.clock.now_millis();
        let expires_at = match ttl.filter(|ttl| !ttl.is_zero()) {
            Some(ttl) => now.saturating_add(duration_millis(ttl)),
            None => i64::MAX,
        };
        let header = EntryHeader {
            stored_at: now,
            expires_at,
            epoch: key.epoch(),
        };
        store.put(Partition::Vars, &storage_key, bytes, header)?;
        Ok(true)
    }

    async fn clean_cache(&self, scope: CacheScope) -> CacheResult<bool> {
        let store = self.handle.open().await?;

        let Some(admin) = &self.admin else {
            let epoch = store.advance_epoch()?;
            tracing::warn!(
                backend = self.name(),
                epoch,
                "No admin credentials configured, cache invalidated but not cleared"
            );
            return Ok(false);
        };

        let partitions: &[Partition] = match scope {
            CacheScope::All => &[Partition::Vars, Partition::Code],
            CacheScope::User => &[Partition::Vars],
            CacheScope::Data => &[Partition::Code],
        };
        // The epoch moves even when the physical clear fails.
        let cleared = store.clear(partitions);
        let epoch = store.advance_epoch()?;
        cleared?;
        tracing::info!(backend = self.name(), user = admin.user(), ?scope, epoch, "Cleared LMDB cache");
        Ok(true)
    }

    fn invalidation_store(&self) -> Arc<dyn InvalidationStore> {
        self.epoch.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forum_cache_core::ManualClock;
    use tempfile::TempDir;

    fn create_test_backend(
        admin: Option<AdminCredentials>,
    ) -> (LmdbCacheBackend, Arc<ManualClock>, TempDir) {
        let temp_dir = TempDir::new().expect("TempDir creation should succeed");
        let clock = Arc::new(ManualClock::new());
        let backend = LmdbCacheBackend::new(
            temp_dir.path(),
            10,
            KeyNamespace::new("t-"),
            Arc::new(Capabilities::none().with_lmdb(10)),
            admin,
        )
        .with_clock(clock.clone());
        (backend, clock, temp_dir)
    }

    fn admin() -> Option<AdminCredentials> {
        AdminCredentials::new("admin", "hunter2")
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let (backend, _clock, _dir) = create_test_backend(None);
        backend.connect().await.unwrap();
        let key = ScopedKey::new(0, "board_list_3");

        assert!(backend.put_data(&key, Some(&[1, 2, 3]), None).await.unwrap());
        assert_eq!(
            backend.get_data(&key, None).await.unwrap(),
            Some(vec![1, 2, 3])
        );

        assert!(backend.put_data(&key, None, None).await.unwrap());
        assert_eq!(backend.get_data(&key, None).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_expiry_enforced_at_read() {
        let (backend, clock, _dir) = create_test_backend(None);
        let key = ScopedKey::new(0, "k");
        backend
            .put_data(&key, Some(b"v"), Some(Duration::from_secs(60)))
            .await
            .unwrap();

        clock.advance(Duration::from_secs(59));
        assert!(backend.get_data(&key, None).await.unwrap().is_some());
        clock.advance(Duration::from_secs(1));
        assert!(backend.get_data(&key, None).await.unwrap().is_none());
        assert_eq!(backend.partition_len(Partition::Vars).await.unwrap(), 0);
    }

    /// One megabyte map, filled with 16 KiB entries until writes fail.
    async fn fill_small_map(ttl: Option<Duration>) -> (LmdbCacheBackend, Arc<ManualClock>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new());
        let backend = LmdbCacheBackend::new(
            temp_dir.path(),
            1,
            KeyNamespace::new("t-"),
            Arc::new(Capabilities::none().with_lmdb(1)),
            None,
        )
        .with_clock(clock.clone());

        let payload = vec![7u8; 16 * 1024];
        let mut stored = 0;
        for i in 0..200 {
            let key = ScopedKey::new(0, format!("topic:{}", i));
            if backend.put_data(&key, Some(&payload), ttl).await.is_err() {
                break;
            }
            stored += 1;
        }
        assert!(stored > 0 && stored < 200, "map never filled: {}", stored);
        (backend, clock, temp_dir)
    }

    #[tokio::test]
    async fn test_full_map_reclaims_expired_entries() {
        let (backend, clock, _dir) = fill_small_map(Some(Duration::from_secs(1))).await;
        let before = backend.partition_len(Partition::Vars).await.unwrap();

        clock.advance(Duration::from_secs(3600));
        let key = ScopedKey::new(0, "after_expiry");
        assert!(backend
            .put_data(&key, Some(&vec![1u8; 16 * 1024]), None)
            .await
            .unwrap());
        assert!(backend.get_data(&key, None).await.unwrap().is_some());
        assert!(backend.partition_len(Partition::Vars).await.unwrap() < before);
    }

    #[tokio::test]
    async fn test_full_map_reclaims_older_epochs() {
        let (backend, _clock, _dir) = fill_small_map(None).await;

        // No credentials: only the epoch moves.
        assert!(!backend.clean_cache(CacheScope::All).await.unwrap());
        let key = ScopedKey::new(1, "after_clear");
        assert!(backend
            .put_data(&key, Some(&vec![1u8; 16 * 1024]), None)
            .await
            .unwrap());
        assert_eq!(backend.partition_len(Partition::Vars).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_full_map_keeps_live_entries() {
        let (backend, _clock, _dir) = fill_small_map(None).await;
        let before = backend.partition_len(Partition::Vars).await.unwrap();

        let key = ScopedKey::new(0, "no_room");
        assert!(backend
            .put_data(&key, Some(&vec![1u8; 16 * 1024]), None)
            .await
            .is_err());
        assert_eq!(backend.partition_len(Partition::Vars).await.unwrap(), before);
        assert!(backend
            .get_data(&ScopedKey::new(0, "topic:0"), None)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_long_keys_are_hashed() {
        let (backend, _clock, _dir) = create_test_backend(None);
        let key = ScopedKey::new(0, "x".repeat(2048));
        assert_eq!(backend.storage_key(&key).len(), 2 + 64);

        backend.put_data(&key, Some(b"long"), None).await.unwrap();
        assert_eq!(
            backend.get_data(&key, None).await.unwrap(),
            Some(b"long".to_vec())
        );
    }

    #[tokio::test]
    async fn test_clean_without_credentials_only_invalidates() {
        let (backend, _clock, _dir) = create_test_backend(None);
        let key = ScopedKey::new(0, "k");
        backend.put_data(&key, Some(b"v"), None).await.unwrap();

        assert!(!backend.clean_cache(CacheScope::All).await.unwrap());
        assert_eq!(backend.partition_len(Partition::Vars).await.unwrap(), 1);
        assert_eq!(backend.invalidation_store().current().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_clean_with_credentials_by_scope() {
        let (backend, _clock, _dir) = create_test_backend(admin());
        backend
            .put_data(&ScopedKey::new(0, "k"), Some(b"v"), None)
            .await
            .unwrap();
        backend
            .put_partition(Partition::Code, "template:index", b"compiled")
            .await
            .unwrap();

        assert!(backend.clean_cache(CacheScope::User).await.unwrap());
        assert_eq!(backend.partition_len(Partition::Vars).await.unwrap(), 0);
        assert_eq!(backend.partition_len(Partition::Code).await.unwrap(), 1);

        assert!(backend.clean_cache(CacheScope::Data).await.unwrap());
        assert_eq!(backend.partition_len(Partition::Code).await.unwrap(), 0);
        assert_eq!(backend.invalidation_store().current().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_epoch_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let caps = Arc::new(Capabilities::none().with_lmdb(10));
        {
            let backend = LmdbCacheBackend::new(
                temp_dir.path(),
                10,
                KeyNamespace::new("t-"),
                caps.clone(),
                None,
            );
            backend.clean_cache(CacheScope::All).await.unwrap();
            backend.clean_cache(CacheScope::All).await.unwrap();
        }
        let reopened =
            LmdbCacheBackend::new(temp_dir.path(), 10, KeyNamespace::new("t-"), caps, None);
        assert_eq!(reopened.invalidation_store().current().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_instances_share_one_environment() {
        let (first, _clock, dir) = create_test_backend(None);
        let second = LmdbCacheBackend::new(
            dir.path(),
            10,
            KeyNamespace::new("t-"),
            Arc::new(Capabilities::none().with_lmdb(10)),
            None,
        );
        let key = ScopedKey::new(0, "shared");
        first.put_data(&key, Some(b"v"), None).await.unwrap();
        assert_eq!(
            second.get_data(&key, None).await.unwrap(),
            Some(b"v".to_vec())
        );
    }

    #[test]
    fn test_zero_map_size_is_unsupported() {
        let dir = TempDir::new().unwrap();
        let backend = LmdbCacheBackend::new(
            dir.path(),
            0,
            KeyNamespace::new("t-"),
            Arc::new(Capabilities::none().with_lmdb(0)),
            None,
        );
        assert!(!backend.is_supported(true));
        assert_eq!(
            backend.unsupported_reason().as_deref(),
            Some("variable storage size is zero")
        );
    }
}
