//! Backend registry and startup selection.

use std::sync::Arc;

use forum_cache_core::{BackendKind, BackendPreference, CacheSettings};

use super::capabilities::Capabilities;
use super::null_backend::NullBackend;
use super::pg_backend::{CacheTable, PostgresBackend};
use super::traits::CacheBackend;

/// Every backend this process knows about, in probe order.
///
/// The null backend is held separately and never takes part in automatic
/// selection; it is only the fallback.
pub struct BackendRegistry {
    caps: Arc<Capabilities>,
    backends: Vec<Arc<dyn CacheBackend>>,
    null: Arc<NullBackend>,
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("caps", &self.caps)
            .field(
                "backends",
                &self.backends.iter().map(|b| b.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl BackendRegistry {
    pub fn new(caps: Arc<Capabilities>) -> Self {
        Self {
            caps,
            backends: Vec::new(),
            null: Arc::new(NullBackend::new()),
        }
    }

    /// Detect capabilities and register every backend compiled in.
    ///
    /// Builds the PostgreSQL pool when database settings are present.
    pub async fn from_settings(settings: &CacheSettings) -> Self {
        #[cfg(feature = "postgres")]
        let (table, pool_error): (Option<Arc<dyn CacheTable>>, Option<String>) =
            match &settings.db {
                Some(db) => match super::pg_pool::PooledCacheTable::from_config(db) {
                    Ok(table) => (Some(Arc::new(table) as Arc<dyn CacheTable>), None),
                    Err(e) => (None, Some(e.to_string())),
                },
                None => (None, None),
            };
        #[cfg(not(feature = "postgres"))]
        let (table, pool_error): (Option<Arc<dyn CacheTable>>, Option<String>) = (
            None,
            settings
                .db
                .as_ref()
                .map(|_| "built without the postgres feature".to_string()),
        );

        if let Some(reason) = &pool_error {
            tracing::warn!(error = %reason, "Cache database pool unavailable");
        }
        Self::assemble(settings, table, pool_error).await
    }

    /// Like [`from_settings`](Self::from_settings) with an explicit table
    /// implementation for the PostgreSQL backend.
    pub async fn with_table(settings: &CacheSettings, table: Option<Arc<dyn CacheTable>>) -> Self {
        Self::assemble(settings, table, None).await
    }

    async fn assemble(
        settings: &CacheSettings,
        table: Option<Arc<dyn CacheTable>>,
        pool_error: Option<String>,
    ) -> Self {
        let mut caps = Capabilities::detect(settings, table.as_deref(), settings.op_timeout).await;
        if let Some(reason) = pool_error {
            caps = caps.with_postgres_error(reason);
        }
        let caps = Arc::new(caps);
        tracing::debug!(?caps, "Resolved cache capabilities");

        let namespace = settings.namespace();
        #[allow(unused_mut)]
        let mut registry = Self::new(caps.clone());

        #[cfg(feature = "shm")]
        registry.register(Arc::new(super::shm_backend::SharedMemoryBackend::new(
            namespace.clone(),
            caps.clone(),
        )));

        if let Some(table) = table {
            registry.register(Arc::new(PostgresBackend::new(
                table,
                namespace.clone(),
                caps.clone(),
                settings.op_timeout,
            )));
        }

        #[cfg(feature = "lmdb")]
        registry.register(Arc::new(super::lmdb_backend::LmdbCacheBackend::new(
            &settings.lmdb.path,
            settings.lmdb.map_size_mb,
            namespace,
            caps,
            settings.admin.clone(),
        )));

        registry
    }

    pub fn register(&mut self, backend: Arc<dyn CacheBackend>) {
        self.backends.push(backend);
    }

    pub fn capabilities(&self) -> &Arc<Capabilities> {
        &self.caps
    }

    pub fn backends(&self) -> &[Arc<dyn CacheBackend>] {
        &self.backends
    }

    pub fn null_backend(&self) -> Arc<dyn CacheBackend> {
        self.null.clone()
    }

    /// Backend registered under `kind`, the null backend included.
    pub fn get(&self, kind: BackendKind) -> Option<Arc<dyn CacheBackend>> {
        if kind == BackendKind::Null {
            return Some(self.null_backend());
        }
        self.backends.iter().find(|b| b.kind() == kind).cloned()
    }

    /// Pick a backend by preference using raw capability probes only.
    pub fn choose(&self, preference: BackendPreference) -> Option<Arc<dyn CacheBackend>> {
        match preference {
            BackendPreference::Disabled => None,
            BackendPreference::Auto => self.backends.iter().find(|b| b.is_supported(true)).cloned(),
            BackendPreference::Named(kind) => self
                .backends
                .iter()
                .find(|b| b.kind() == kind && b.is_supported(true))
                .cloned(),
        }
    }

    /// Choose, connect and record the backend for this process.
    ///
    /// Once a backend has been recorded, every later call returns it
    /// unchanged. Anything that goes wrong lands on the null backend.
    pub async fn select(&self, preference: BackendPreference) -> Arc<dyn CacheBackend> {
        if let Some(kind) = self.caps.enabled() {
            if let Some(backend) = self.get(kind) {
                return backend;
            }
        }

        let chosen = match self.choose(preference) {
            Some(backend) => match backend.connect().await {
                Ok(()) => backend,
                Err(e) => {
                    tracing::warn!(
                        backend = backend.name(),
                        error = %e,
                        "Cache backend failed to connect, falling back to none"
                    );
                    self.null_backend()
                }
            },
            None => {
                if let BackendPreference::Named(kind) = preference {
                    let reason = self
                        .get(kind)
                        .and_then(|b| b.unsupported_reason())
                        .unwrap_or_else(|| "not registered".to_string());
                    tracing::warn!(
                        backend = kind.name(),
                        reason = %reason,
                        "Preferred cache backend unsupported, falling back to none"
                    );
                }
                self.null_backend()
            }
        };

        let enabled = self.caps.mark_enabled(chosen.kind());
        if enabled != chosen.kind() {
            // Lost a race with a concurrent selection; honour the winner.
            return self.get(enabled).unwrap_or_else(|| self.null_backend());
        }
        tracing::info!(backend = chosen.name(), "Cache backend selected");
        chosen
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disabled_preference_uses_null() {
        let registry = BackendRegistry::new(Arc::new(Capabilities::none()));
        let backend = registry.select(BackendPreference::Disabled).await;
        assert_eq!(backend.kind(), BackendKind::Null);
        assert!(registry.capabilities().is_enabled(BackendKind::Null));
    }

    #[tokio::test]
    async fn test_auto_skips_unsupported() {
        #[allow(unused_mut)]
        let mut registry = BackendRegistry::new(Arc::new(Capabilities::none()));
        #[cfg(feature = "shm")]
        registry.register(Arc::new(crate::cache::shm_backend::SharedMemoryBackend::new(
            forum_cache_core::KeyNamespace::new("t-"),
            registry.capabilities().clone(),
        )));
        assert!(registry.choose(BackendPreference::Auto).is_none());
        assert_eq!(
            registry.select(BackendPreference::Auto).await.kind(),
            BackendKind::Null
        );
    }

    #[tokio::test]
    async fn test_selection_is_sticky() {
        let registry = BackendRegistry::new(Arc::new(Capabilities::none()));
        registry.select(BackendPreference::Disabled).await;
        // A different preference later does not change the recorded choice.
        let again = registry.select(BackendPreference::Auto).await;
        assert_eq!(again.kind(), BackendKind::Null);
    }

    #[test]
    fn test_get_null_kind() {
        let registry = BackendRegistry::new(Arc::new(Capabilities::none()));
        assert!(registry.get(BackendKind::Null).is_some());
        assert!(registry.get(BackendKind::Lmdb).is_none());
    }
}
