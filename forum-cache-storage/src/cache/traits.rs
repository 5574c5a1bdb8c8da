//! Cache backend trait and the clear scope it accepts.
//!
//! Every storage medium implements [`CacheBackend`] independently; the
//! selector in [`super::selector`] picks one at startup and the facade in
//! [`super::facade`] is the only thing the rest of the forum talks to.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use forum_cache_core::{BackendKind, CacheResult, ConfigError, ScopedKey};
use serde::Serialize;

use super::capabilities::Capabilities;
use super::epoch::InvalidationStore;

/// Logical partition a clear applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheScope {
    /// Everything the backend holds
    #[default]
    All,
    /// Caller-written entries only
    User,
    /// Backend data partition
    Data,
}

impl FromStr for CacheScope {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" => Ok(CacheScope::All),
            "user" => Ok(CacheScope::User),
            "data" => Ok(CacheScope::Data),
            other => Err(ConfigError::InvalidValue {
                field: "scope".to_string(),
                value: other.to_string(),
                reason: "expected \"\", \"user\" or \"data\"".to_string(),
            }),
        }
    }
}

/// Cache backend trait for pluggable storage media.
///
/// # TTL
///
/// On `put_data` the TTL is the lifetime from now; `None` or zero means the
/// entry never expires on its own. On `get_data` the TTL is the maximum age
/// the caller accepts; self-expiring backends may ignore it.
///
/// # Errors
///
/// Backends return [`CacheResult`] so the facade can log the cause, but
/// a missing or expired key is always `Ok(None)`, never an error.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Which implementation this is.
    fn kind(&self) -> BackendKind;

    /// Stable identifier used in configuration and diagnostics.
    fn name(&self) -> &'static str {
        self.kind().name()
    }

    /// Capability check.
    ///
    /// With `probe` set this only looks at raw capabilities and is used
    /// during discovery. Without it the backend must also be the enabled one.
    fn is_supported(&self, probe: bool) -> bool;

    /// Capabilities this backend checks `is_supported` against, if any.
    fn capabilities(&self) -> Option<&Arc<Capabilities>> {
        None
    }

    /// Why `is_supported(true)` is false, for administrative display.
    fn unsupported_reason(&self) -> Option<String> {
        None
    }

    /// One-time setup. Idempotent and safe to race from several processes.
    async fn connect(&self) -> CacheResult<()>;

    /// Fetch a value, `None` when absent or expired.
    async fn get_data(&self, key: &ScopedKey, ttl: Option<Duration>)
        -> CacheResult<Option<Vec<u8>>>;

    /// Store a value, or delete the key when `value` is `None`.
    async fn put_data(
        &self,
        key: &ScopedKey,
        value: Option<&[u8]>,
        ttl: Option<Duration>,
    ) -> CacheResult<bool>;

    /// Physically clear `scope` and advance the invalidation epoch.
    ///
    /// The epoch is advanced even when the physical clear does nothing;
    /// the return value only reports whether storage was reclaimed.
    async fn clean_cache(&self, scope: CacheScope) -> CacheResult<bool>;

    /// The store holding this backend's invalidation epoch.
    fn invalidation_store(&self) -> Arc<dyn InvalidationStore>;
}

/// Statistics about facade usage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Number of successful stores.
    pub writes: u64,
    /// Number of deletes (puts with no value).
    pub deletes: u64,
    /// Number of clear calls.
    pub clears: u64,
    /// Storage errors absorbed by the facade.
    pub errors: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
