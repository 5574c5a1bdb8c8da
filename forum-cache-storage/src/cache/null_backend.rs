//! Always-miss fallback backend.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use forum_cache_core::{BackendKind, CacheResult, ScopedKey};

use super::epoch::{InvalidationStore, MemoryEpochStore};
use super::traits::{CacheBackend, CacheScope};

/// Stores nothing. Every get misses and every put succeeds, so callers
/// simply recompute.
#[derive(Debug, Default)]
pub struct NullBackend {
    epoch: Arc<MemoryEpochStore>,
}

impl NullBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheBackend for NullBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Null
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
        Ok(None)
    }

    async fn put_data(
        &self,
        _key: &ScopedKey,
        _value: Option<&[u8]>,
        _ttl: Option<Duration>,
    ) -> CacheResult<bool> {
        Ok(true)
    }

    async fn clean_cache(&self, _scope: CacheScope) -> CacheResult<bool> {
        self.epoch.advance().await?;
        Ok(true)
    }

    fn invalidation_store(&self) -> Arc<dyn InvalidationStore> {
        self.epoch.clone()
    }
}
