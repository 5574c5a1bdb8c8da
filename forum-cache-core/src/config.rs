//! Cache layer configuration
//!
//! Settings are loaded from `FORUM_CACHE_*` environment variables with
//! defaults suitable for a single-host development forum.

use crate::error::ConfigError;
use crate::key::KeyNamespace;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

// ============================================================================
// BACKEND SELECTION
// ============================================================================

/// Known cache backend implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// In-process shared memory segment
    #[serde(rename = "shm")]
    SharedMemory,
    /// Unlogged PostgreSQL table
    Postgres,
    /// Memory-mapped LMDB environment with admin-gated clearing
    Lmdb,
    /// Always-miss fallback
    #[serde(rename = "none")]
    Null,
}

impl BackendKind {
    /// Stable identifier used in configuration and diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            BackendKind::SharedMemory => "shm",
            BackendKind::Postgres => "postgres",
            BackendKind::Lmdb => "lmdb",
            BackendKind::Null => "none",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "shm" | "apc" => Ok(BackendKind::SharedMemory),
            "postgres" | "postgresql" => Ok(BackendKind::Postgres),
            "lmdb" | "xcache" => Ok(BackendKind::Lmdb),
            "none" | "null" => Ok(BackendKind::Null),
            other => Err(ConfigError::UnknownBackend {
                name: other.to_string(),
            }),
        }
    }
}

/// Which backend the selector should pick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendPreference {
    /// First supported backend in registration order
    #[default]
    Auto,
    /// Caching disabled, always use the null backend
    Disabled,
    /// A specific backend; falls back to null when unsupported
    Named(BackendKind),
}

impl FromStr for BackendPreference {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "auto" => Ok(BackendPreference::Auto),
            "off" | "disabled" => Ok(BackendPreference::Disabled),
            other => match other.parse::<BackendKind>()? {
                BackendKind::Null => Ok(BackendPreference::Disabled),
                kind => Ok(BackendPreference::Named(kind)),
            },
        }
    }
}

// ============================================================================
// BACKEND-SPECIFIC SETTINGS
// ============================================================================

/// PostgreSQL connection settings for the table-backed cache.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub host: String,
    pub port: u16,
    pub dbname: String,
    pub user: String,
    pub password: String,
    /// Maximum pool size
    pub max_size: usize,
    /// Pool checkout timeout
    pub timeout: Duration,
    /// Schema the cache table lives in
    pub schema: String,
    /// Prefix for the cache and epoch table names
    pub table_prefix: String,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            dbname: "forum".to_string(),
            user: "postgres".to_string(),
            password: "".to_string(),
            max_size: 8,
            timeout: Duration::from_secs(5),
            schema: "public".to_string(),
            table_prefix: "sbb_".to_string(),
        }
    }
}

impl DbConfig {
    /// Create a database configuration from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: env_string("FORUM_CACHE_DB_HOST").unwrap_or(defaults.host),
            port: env_parse("FORUM_CACHE_DB_PORT").unwrap_or(defaults.port),
            dbname: env_string("FORUM_CACHE_DB_NAME").unwrap_or(defaults.dbname),
            user: env_string("FORUM_CACHE_DB_USER").unwrap_or(defaults.user),
            password: env_string("FORUM_CACHE_DB_PASSWORD").unwrap_or_default(),
            max_size: env_parse("FORUM_CACHE_DB_POOL_SIZE").unwrap_or(defaults.max_size),
            timeout: env_parse("FORUM_CACHE_DB_TIMEOUT")
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            schema: env_string("FORUM_CACHE_DB_SCHEMA").unwrap_or(defaults.schema),
            table_prefix: env_string("FORUM_CACHE_DB_TABLE_PREFIX")
                .unwrap_or(defaults.table_prefix),
        }
    }

    /// Schema name as the server stores it.
    ///
    /// Identifiers are rendered unquoted, so PostgreSQL folds them to
    /// lowercase; catalog lookups must use the folded form.
    pub fn schema_name(&self) -> String {
        self.schema.to_ascii_lowercase()
    }

    /// Name of the cache table, lowercased like [`DbConfig::schema_name`].
    pub fn cache_table(&self) -> String {
        format!("{}cache", self.table_prefix).to_ascii_lowercase()
    }

    /// Name of the single-row epoch table.
    pub fn epoch_table(&self) -> String {
        format!("{}cache_epoch", self.table_prefix).to_ascii_lowercase()
    }
}

/// LMDB environment settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LmdbSettings {
    pub path: PathBuf,
    /// Variable storage size; zero disables the backend.
    pub map_size_mb: usize,
}

impl Default for LmdbSettings {
    fn default() -> Self {
        Self {
            path: std::env::temp_dir().join("forum-cache"),
            map_size_mb: 64,
        }
    }
}

/// Administrative credentials required to physically clear the LMDB backend.
///
/// The password is only kept as a SHA-256 digest.
#[derive(Clone, PartialEq, Eq)]
pub struct AdminCredentials {
    user: String,
    password_digest: String,
}

impl AdminCredentials {
    /// Returns `None` when either field is empty.
    pub fn new(user: impl Into<String>, password: &str) -> Option<Self> {
        let user = user.into();
        if user.is_empty() || password.is_empty() {
            return None;
        }
        Some(Self {
            user,
            password_digest: hex::encode(Sha256::digest(password.as_bytes())),
        })
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn password_digest(&self) -> &str {
        &self.password_digest
    }
}

impl fmt::Debug for AdminCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdminCredentials")
            .field("user", &self.user)
            .field("password_digest", &"<redacted>")
            .finish()
    }
}

// ============================================================================
// CACHE SETTINGS
// ============================================================================

/// Top-level settings for the cache layer.
#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub preference: BackendPreference,
    /// Explicit key prefix; derived from `board_url` when absent.
    pub key_prefix: Option<String>,
    pub board_url: String,
    /// TTL used when a caller passes none.
    pub default_ttl: Duration,
    /// How long the facade trusts its cached epoch before re-reading it.
    pub epoch_refresh: Duration,
    /// Timeout on network-backed storage calls.
    pub op_timeout: Duration,
    /// PostgreSQL settings; the table backend is unsupported without them.
    pub db: Option<DbConfig>,
    pub lmdb: LmdbSettings,
    pub admin: Option<AdminCredentials>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            preference: BackendPreference::Auto,
            key_prefix: None,
            board_url: "http://localhost".to_string(),
            default_ttl: Duration::from_secs(120),
            epoch_refresh: Duration::from_secs(1),
            op_timeout: Duration::from_secs(2),
            db: None,
            lmdb: LmdbSettings::default(),
            admin: None,
        }
    }
}

impl CacheSettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create settings from environment variables.
    ///
    /// Environment variables:
    /// - `FORUM_CACHE_BACKEND`: `auto`, `none`, `shm`, `postgres`, `lmdb` (default: auto)
    /// - `FORUM_CACHE_KEY_PREFIX`: explicit key prefix
    /// - `FORUM_CACHE_BOARD_URL`: board URL used to derive the prefix
    /// - `FORUM_CACHE_DEFAULT_TTL_SECS`: default TTL (default: 120)
    /// - `FORUM_CACHE_EPOCH_REFRESH_MS`: epoch refresh interval (default: 1000)
    /// - `FORUM_CACHE_OP_TIMEOUT_MS`: storage call timeout (default: 2000)
    /// - `FORUM_CACHE_DB_HOST` and friends: enable the PostgreSQL backend
    /// - `FORUM_CACHE_LMDB_PATH`, `FORUM_CACHE_LMDB_SIZE_MB`
    /// - `FORUM_CACHE_ADMIN_USER`, `FORUM_CACHE_ADMIN_PASS`
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let preference = match env_string("FORUM_CACHE_BACKEND") {
            Some(raw) => raw.parse()?,
            None => defaults.preference,
        };

        let db = env_string("FORUM_CACHE_DB_HOST").map(|_| DbConfig::from_env());

        let lmdb = LmdbSettings {
            path: env_string("FORUM_CACHE_LMDB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.lmdb.path),
            map_size_mb: env_parse("FORUM_CACHE_LMDB_SIZE_MB")
                .unwrap_or(defaults.lmdb.map_size_mb),
        };

        let admin = match (
            env_string("FORUM_CACHE_ADMIN_USER"),
            env_string("FORUM_CACHE_ADMIN_PASS"),
        ) {
            (Some(user), Some(pass)) => AdminCredentials::new(user, &pass),
            _ => None,
        };

        let settings = Self {
            preference,
            key_prefix: env_string("FORUM_CACHE_KEY_PREFIX"),
            board_url: env_string("FORUM_CACHE_BOARD_URL").unwrap_or(defaults.board_url),
            default_ttl: env_parse("FORUM_CACHE_DEFAULT_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.default_ttl),
            epoch_refresh: env_parse("FORUM_CACHE_EPOCH_REFRESH_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.epoch_refresh),
            op_timeout: env_parse("FORUM_CACHE_OP_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.op_timeout),
            db,
            lmdb,
            admin,
        };

        settings.validate()?;
        Ok(settings)
    }

    pub fn with_preference(mut self, preference: BackendPreference) -> Self {
        self.preference = preference;
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn with_epoch_refresh(mut self, interval: Duration) -> Self {
        self.epoch_refresh = interval;
        self
    }

    pub fn with_db(mut self, db: DbConfig) -> Self {
        self.db = Some(db);
        self
    }

    pub fn with_lmdb(mut self, lmdb: LmdbSettings) -> Self {
        self.lmdb = lmdb;
        self
    }

    pub fn with_admin(mut self, admin: Option<AdminCredentials>) -> Self {
        self.admin = admin;
        self
    }

    /// Key namespace for this forum instance.
    pub fn namespace(&self) -> KeyNamespace {
        match &self.key_prefix {
            Some(prefix) => KeyNamespace::new(prefix.clone()),
            None => KeyNamespace::for_instance(&self.board_url),
        }
    }

    /// Check that values are usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(prefix) = &self.key_prefix {
            if prefix.contains(':') || prefix.contains('/') {
                return Err(ConfigError::InvalidValue {
                    field: "key_prefix".to_string(),
                    value: prefix.clone(),
                    reason: "must not contain ':' or '/'".to_string(),
                });
            }
        }
        if self.default_ttl.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "default_ttl".to_string(),
                value: "0".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.op_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "op_timeout".to_string(),
                value: "0".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        if let Some(db) = &self.db {
            let valid_ident = |s: &str| {
                !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
            };
            if !valid_ident(&db.schema) {
                return Err(ConfigError::InvalidValue {
                    field: "db.schema".to_string(),
                    value: db.schema.clone(),
                    reason: "must be a plain SQL identifier".to_string(),
                });
            }
            if !db.table_prefix.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(ConfigError::InvalidValue {
                    field: "db.table_prefix".to_string(),
                    value: db.table_prefix.clone(),
                    reason: "must be a plain SQL identifier".to_string(),
                });
            }
        }
        Ok(())
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.trim().is_empty())
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}
