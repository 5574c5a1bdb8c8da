//! Capability descriptor resolved once at startup.
//!
//! Backends never probe the runtime themselves. Compiled-in features,
//! configuration thresholds and the PostgreSQL server version are gathered
//! here once, and every backend answers `is_supported` from this snapshot.

use std::sync::OnceLock;
use std::time::Duration;

use forum_cache_core::{BackendKind, CacheSettings};

use super::pg_backend::{CacheTable, PgServerInfo};

/// What this process can run.
#[derive(Debug, Default)]
pub struct Capabilities {
    /// Shared memory segment operations are compiled in.
    pub shared_memory: bool,
    /// LMDB support is compiled in.
    pub lmdb: bool,
    /// Configured LMDB variable storage size; zero disables the backend.
    pub lmdb_map_size_mb: usize,
    /// Detected PostgreSQL server, if one answered the version query.
    pub postgres: Option<PgServerInfo>,
    /// Why PostgreSQL detection failed.
    pub postgres_error: Option<String>,
    enabled: OnceLock<BackendKind>,
}

impl Capabilities {
    /// Capabilities implied by cargo features and settings alone.
    pub fn compiled(settings: &CacheSettings) -> Self {
        Self {
            shared_memory: cfg!(feature = "shm"),
            lmdb: cfg!(feature = "lmdb"),
            lmdb_map_size_mb: settings.lmdb.map_size_mb,
            postgres: None,
            postgres_error: settings
                .db
                .is_none()
                .then(|| "no database configured".to_string()),
            enabled: OnceLock::new(),
        }
    }

    /// Full detection, including one version query against PostgreSQL.
    pub async fn detect(
        settings: &CacheSettings,
        table: Option<&dyn CacheTable>,
        timeout: Duration,
    ) -> Self {
        let caps = Self::compiled(settings);
        let Some(table) = table else {
            return caps;
        };

        match tokio::time::timeout(timeout, table.server_info()).await {
            Ok(Ok(info)) => caps.with_postgres(info),
            Ok(Err(e)) => caps.with_postgres_error(e.to_string()),
            Err(_) => caps.with_postgres_error(format!("version query timed out after {:?}", timeout)),
        }
    }

    pub fn with_shared_memory(mut self, available: bool) -> Self {
        self.shared_memory = available;
        self
    }

    /// LMDB compiled in with the given map size.
    pub fn with_lmdb(mut self, map_size_mb: usize) -> Self {
        self.lmdb = true;
        self.lmdb_map_size_mb = map_size_mb;
        self
    }

    pub fn with_postgres(mut self, info: PgServerInfo) -> Self {
        self.postgres = Some(info);
        self.postgres_error = None;
        self
    }

    pub fn with_postgres_error(mut self, reason: impl Into<String>) -> Self {
        self.postgres = None;
        self.postgres_error = Some(reason.into());
        self
    }

    /// Nothing available; only the null backend can run.
    pub fn none() -> Self {
        Self::default()
    }

    /// The backend the selector settled on, if it has run.
    pub fn enabled(&self) -> Option<BackendKind> {
        self.enabled.get().copied()
    }

    pub fn is_enabled(&self, kind: BackendKind) -> bool {
        self.enabled() == Some(kind)
    }

    /// Record the selected backend. The first selection wins; later calls
    /// return the kind already recorded.
    pub fn mark_enabled(&self, kind: BackendKind) -> BackendKind {
        *self.enabled.get_or_init(|| kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forum_cache_core::{DbConfig, LmdbSettings};

    #[test]
    fn test_compiled_reflects_settings() {
        let settings = CacheSettings::new().with_lmdb(LmdbSettings {
            path: "/tmp/x".into(),
            map_size_mb: 0,
        });
        let caps = Capabilities::compiled(&settings);
        assert_eq!(caps.lmdb_map_size_mb, 0);
        assert!(caps.postgres.is_none());
        assert!(caps.postgres_error.is_some());

        let with_db = Capabilities::compiled(&CacheSettings::new().with_db(DbConfig::default()));
        assert!(with_db.postgres_error.is_none());
    }

    #[test]
    fn test_mark_enabled_is_idempotent() {
        let caps = Capabilities::none();
        assert_eq!(caps.enabled(), None);
        assert_eq!(caps.mark_enabled(BackendKind::Lmdb), BackendKind::Lmdb);
        assert_eq!(caps.mark_enabled(BackendKind::Postgres), BackendKind::Lmdb);
        assert!(caps.is_enabled(BackendKind::Lmdb));
        assert!(!caps.is_enabled(BackendKind::Postgres));
    }

    #[test]
    fn test_with_postgres_clears_error() {
        let caps = Capabilities::none()
            .with_postgres_error("down")
            .with_postgres(PgServerInfo::new("PostgreSQL", 160002));
        assert!(caps.postgres_error.is_none());
        assert_eq!(caps.postgres.as_ref().map(|p| p.version_num), Some(160002));
    }
}
