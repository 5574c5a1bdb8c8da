//! In-process shared memory cache backend.
//!
//! Entries live in a [`SharedSegment`], a pair of concurrent maps shared by
//! every worker in the process. The `user` segment holds caller data; the
//! `system` segment holds whatever other subsystems park there and is only
//! touched by full clears. Expiry is native: the TTL is fixed at write time
//! and the read-side TTL is ignored. Reads evict the expired entry they
//! find, and every [`SWEEP_INTERVAL`] writes the whole segment is swept.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use forum_cache_core::{
    duration_millis, BackendKind, CacheResult, Clock, KeyNamespace, ScopedKey, SystemClock,
};

use super::capabilities::Capabilities;
use super::epoch::{InvalidationStore, MemoryEpochStore};
use super::traits::{CacheBackend, CacheScope};

/// Appended to every storage key so caller entries never collide with the
/// segment's own bookkeeping keys.
pub const KEY_SUFFIX: &str = "sbb";

/// Writes between full sweeps of expired entries.
pub const SWEEP_INTERVAL: u64 = 1024;

/// Which half of the shared segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Segment {
    User,
    System,
}

#[derive(Debug, Clone)]
struct SegmentEntry {
    value: Vec<u8>,
    /// Unix millis after which the entry is gone; `None` never expires.
    expires_at: Option<i64>,
}

impl SegmentEntry {
    fn is_live(&self, now_ms: i64) -> bool {
        self.expires_at.map_or(true, |at| at > now_ms)
    }
}

/// Process-wide key-value segment with its own invalidation epoch.
#[derive(Debug, Default)]
pub struct SharedSegment {
    user: DashMap<String, SegmentEntry>,
    system: DashMap<String, SegmentEntry>,
    epoch: Arc<MemoryEpochStore>,
    writes: AtomicU64,
}

impl SharedSegment {
    pub fn new() -> Self {
        Self::default()
    }

    /// The segment every backend in this process shares by default.
    pub fn global() -> Arc<SharedSegment> {
        static GLOBAL: OnceLock<Arc<SharedSegment>> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(SharedSegment::new())).clone()
    }

    fn map(&self, segment: Segment) -> &DashMap<String, SegmentEntry> {
        match segment {
            Segment::User => &self.user,
            Segment::System => &self.system,
        }
    }

    /// Insert an entry, sweeping both halves every [`SWEEP_INTERVAL`] writes.
    pub fn store(
        &self,
        segment: Segment,
        key: String,
        value: Vec<u8>,
        expires_at: Option<i64>,
        now_ms: i64,
    ) {
        self.map(segment)
            .insert(key, SegmentEntry { value, expires_at });

        let writes = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if writes % SWEEP_INTERVAL == 0 {
            let removed =
                self.sweep_expired(Segment::User, now_ms) + self.sweep_expired(Segment::System, now_ms);
            if removed > 0 {
                tracing::debug!(removed, "Swept expired entries from shared segment");
            }
        }
    }

    /// Drop every expired entry and return how many went.
    pub fn sweep_expired(&self, segment: Segment, now_ms: i64) -> usize {
        let map = self.map(segment);
        let before = map.len();
        map.retain(|_, entry| entry.is_live(now_ms));
        before.saturating_sub(map.len())
    }

    /// Fetch a live entry. Expired entries are evicted on the way out.
    pub fn fetch(&self, segment: Segment, key: &str, now_ms: i64) -> Option<Vec<u8>> {
        let map = self.map(segment);
        let live = {
            let entry = map.get(key)?;
            entry.is_live(now_ms).then(|| entry.value.clone())
        };
        if live.is_none() {
            map.remove_if(key, |_, entry| !entry.is_live(now_ms));
        }
        live
    }

    pub fn delete(&self, segment: Segment, key: &str) -> bool {
        self.map(segment).remove(key).is_some()
    }

    pub fn clear(&self, segment: Segment) {
        self.map(segment).clear();
    }

    /// Number of stored entries, expired or not.
    pub fn len(&self, segment: Segment) -> usize {
        self.map(segment).len()
    }

    pub fn is_empty(&self, segment: Segment) -> bool {
        self.len(segment) == 0
    }

    pub fn epoch_store(&self) -> Arc<MemoryEpochStore> {
        self.epoch.clone()
    }
}

/// Cache backend over the in-process shared segment.
#[derive(Debug)]
pub struct SharedMemoryBackend {
    segment: Arc<SharedSegment>,
    namespace: KeyNamespace,
    caps: Arc<Capabilities>,
    clock: Arc<dyn Clock>,
}

impl SharedMemoryBackend {
    /// Backend over the process-wide segment.
    pub fn new(namespace: KeyNamespace, caps: Arc<Capabilities>) -> Self {
        Self::with_segment(SharedSegment::global(), namespace, caps)
    }

    pub fn with_segment(
        segment: Arc<SharedSegment>,
        namespace: KeyNamespace,
        caps: Arc<Capabilities>,
    ) -> Self {
        Self {
            segment,
            namespace,
            caps,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn segment(&self) -> &Arc<SharedSegment> {
        &self.segment
    }

    /// The exact key written to the segment for `key`.
    pub fn storage_key(&self, key: &ScopedKey) -> String {
        self.namespace.storage_key_with_suffix(key, KEY_SUFFIX)
    }
}

#[async_trait]
impl CacheBackend for SharedMemoryBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::SharedMemory
    }

    fn is_supported(&self, probe: bool) -> bool {
        self.caps.shared_memory && (probe || self.caps.is_enabled(self.kind()))
    }

    fn capabilities(&self) -> Option<&Arc<Capabilities>> {
        Some(&self.caps)
    }

    fn unsupported_reason(&self) -> Option<String> {
        (!self.caps.shared_memory).then(|| "built without the shm feature".to_string())
    }

    async fn connect(&self) -> CacheResult<()> {
        Ok(())
    }

    async fn get_data(
        &self,
        key: &ScopedKey,
        _ttl: Option<Duration>,
    ) -> CacheResult<Option<Vec<u8>>> {
        let storage_key = self.storage_key(key);
        Ok(self
            .segment
            .fetch(Segment::User, &storage_key, self.clock.now_millis()))
    }

    async fn put_data(
        &self,
        key: &ScopedKey,
        value: Option<&[u8]>,
        ttl: Option<Duration>,
    ) -> CacheResult<bool> {
        let storage_key = self.storage_key(key);
        match value {
            None => {
                self.segment.delete(Segment::User, &storage_key);
            }
            Some(bytes) => {
                let now = self.clock.now_millis();
                let expires_at = ttl
                    .filter(|ttl| !ttl.is_zero())
                    .map(|ttl| now.saturating_add(duration_millis(ttl)));
                self.segment
                    .store(Segment::User, storage_key, bytes.to_vec(), expires_at, now);
            }
        }
        Ok(true)
    }

    async fn clean_cache(&self, scope: CacheScope) -> CacheResult<bool> {
        self.segment.clear(Segment::User);
        if scope != CacheScope::User {
            self.segment.clear(Segment::System);
        }
        let epoch = self.segment.epoch.advance().await?;
        tracing::debug!(backend = self.name(), ?scope, epoch, "Cleared shared segment");
        Ok(true)
    }

    fn invalidation_store(&self) -> Arc<dyn InvalidationStore> {
        self.segment.epoch_store()
    }
}
