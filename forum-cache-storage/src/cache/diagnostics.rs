//! Administrative view of the cache layer.

use forum_cache_core::HealthCheck;
use serde::Serialize;

use super::pg_backend::PgServerInfo;
use super::traits::{CacheBackend, CacheStats};

/// One registered backend as an administrator sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendReport {
    pub name: String,
    /// Raw capability probe
    pub supported: bool,
    /// Selected for this process
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl BackendReport {
    pub fn of(backend: &dyn CacheBackend, active: bool) -> Self {
        let supported = backend.is_supported(true);
        Self {
            name: backend.name().to_string(),
            supported,
            active,
            reason: if supported {
                None
            } else {
                backend.unsupported_reason()
            },
        }
    }

    pub fn to_health_check(&self) -> HealthCheck {
        if self.active {
            HealthCheck::healthy(&self.name)
        } else if self.supported {
            HealthCheck::degraded(&self.name, "available, not selected")
        } else {
            HealthCheck::unhealthy(
                &self.name,
                self.reason.as_deref().unwrap_or("unsupported"),
            )
        }
    }
}

/// Snapshot of the facade, backends and counters.
#[derive(Debug, Clone, Serialize)]
pub struct CacheReport {
    pub active: String,
    pub epoch: u64,
    pub backends: Vec<BackendReport>,
    pub stats: CacheStats,
    pub hit_rate: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub postgres: Option<PgServerInfo>,
}

impl CacheReport {
    pub fn health(&self) -> Vec<HealthCheck> {
        self.backends
            .iter()
            .map(|b| {
                let check = b.to_health_check();
                if b.active {
                    check.with_metadata("epoch", serde_json::json!(self.epoch))
                } else {
                    check
                }
            })
            .collect()
    }
}
