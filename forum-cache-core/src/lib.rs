//! Forum Cache Core - Shared Types
//!
//! Errors, settings, key namespacing and time sources used by every cache
//! backend. This crate contains no storage code.

pub mod clock;
pub mod config;
pub mod error;
pub mod health;
pub mod key;

pub use clock::{duration_millis, Clock, ManualClock, SystemClock};
pub use config::{
    AdminCredentials, BackendKind, BackendPreference, CacheSettings, DbConfig, LmdbSettings,
};
pub use error::{CacheError, CacheResult, ConfigError, StorageError};
pub use health::{HealthCheck, HealthStatus};
pub use key::{KeyNamespace, ScopedKey};
