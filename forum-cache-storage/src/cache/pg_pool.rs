//! [`CacheTable`] over a deadpool-postgres connection pool.
//!
//! Statements are prepared on first use per pooled connection and reused
//! through the connection's statement cache.

use std::fmt;

use async_trait::async_trait;
use deadpool_postgres::{Config, ManagerConfig, Pool, PoolConfig, RecyclingMethod, Runtime};
use forum_cache_core::{BackendKind, CacheError, CacheResult, DbConfig, StorageError};
use tokio_postgres::error::SqlState;
use tokio_postgres::NoTls;

use super::pg_backend::{CacheTable, PgServerInfo};

/// Create a connection pool from the cache database settings.
pub fn create_pool(config: &DbConfig) -> CacheResult<Pool> {
    let mut cfg = Config::new();
    cfg.host = Some(config.host.clone());
    cfg.port = Some(config.port);
    cfg.dbname = Some(config.dbname.clone());
    cfg.user = Some(config.user.clone());
    cfg.password = Some(config.password.clone());

    cfg.manager = Some(ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    });

    let mut pool_cfg = PoolConfig::new(config.max_size);
    pool_cfg.timeouts.wait = Some(config.timeout);
    pool_cfg.timeouts.create = Some(config.timeout);
    pool_cfg.timeouts.recycle = Some(config.timeout);
    cfg.pool = Some(pool_cfg);

    cfg.create_pool(Some(Runtime::Tokio1), NoTls).map_err(|e| {
        CacheError::from(StorageError::ConnectionFailed {
            backend: BackendKind::Postgres.name().to_string(),
            reason: format!("Failed to create pool: {}", e),
        })
    })
}

/// Log a driver error in full and keep a generic message.
fn pg_error(err: tokio_postgres::Error) -> CacheError {
    tracing::error!("Cache database error: {:?}", err);
    let reason = match err.as_db_error() {
        Some(db) => format!("{} ({})", db.message(), db.code().code()),
        None => "Database operation failed".to_string(),
    };
    CacheError::from(StorageError::QueryFailed {
        backend: BackendKind::Postgres.name().to_string(),
        reason,
    })
}

fn pool_error(err: deadpool_postgres::PoolError) -> CacheError {
    tracing::warn!("Cache connection pool error: {:?}", err);
    let backend = BackendKind::Postgres.name().to_string();
    match err {
        deadpool_postgres::PoolError::Timeout(_) => CacheError::from(StorageError::ConnectionFailed {
            backend,
            reason: "Connection pool exhausted".to_string(),
        }),
        deadpool_postgres::PoolError::Closed => CacheError::from(StorageError::ConnectionFailed {
            backend,
            reason: "Connection pool is closed".to_string(),
        }),
        _ => CacheError::from(StorageError::ConnectionFailed {
            backend,
            reason: "Failed to acquire database connection".to_string(),
        }),
    }
}

/// Another process created the same object between our check and create.
fn is_benign_create_race(err: &tokio_postgres::Error) -> bool {
    err.code().is_some_and(|code| {
        *code == SqlState::DUPLICATE_TABLE
            || *code == SqlState::DUPLICATE_OBJECT
            || *code == SqlState::UNIQUE_VIOLATION
    })
}

/// SQL text, rendered once from the validated schema and table names.
#[derive(Debug, Clone)]
struct Statements {
    schema: String,
    cache_table: String,
    epoch_table: String,
    create_cache: String,
    create_epoch: String,
    select: String,
    upsert: String,
    delete: String,
    truncate: String,
    read_epoch: String,
    advance_epoch: String,
}

impl Statements {
    fn new(config: &DbConfig) -> Self {
        let schema = config.schema_name();
        let cache_table = config.cache_table();
        let epoch_table = config.epoch_table();
        let cache = format!("{}.{}", schema, cache_table);
        let epoch = format!("{}.{}", schema, epoch_table);

        Self {
            create_cache: format!(
                "CREATE UNLOGGED TABLE IF NOT EXISTS {} (\
                 key TEXT NOT NULL, \
                 value BYTEA NOT NULL, \
                 ttl BIGINT NOT NULL, \
                 stored_at BIGINT NOT NULL, \
                 PRIMARY KEY (key))",
                cache
            ),
            create_epoch: format!(
                "CREATE TABLE IF NOT EXISTS {} (\
                 id SMALLINT PRIMARY KEY, \
                 epoch BIGINT NOT NULL)",
                epoch
            ),
            select: format!(
                "SELECT value FROM {} WHERE key = $1 AND ttl > $2 AND stored_at >= $3",
                cache
            ),
            upsert: format!(
                "INSERT INTO {} (key, value, ttl, stored_at) VALUES ($1, $2, $3, $4) \
                 ON CONFLICT (key) DO UPDATE SET \
                 value = EXCLUDED.value, ttl = EXCLUDED.ttl, stored_at = EXCLUDED.stored_at",
                cache
            ),
            delete: format!("DELETE FROM {} WHERE key = $1", cache),
            truncate: format!("TRUNCATE {}", cache),
            read_epoch: format!("SELECT epoch FROM {} WHERE id = 1", epoch),
            advance_epoch: format!(
                "INSERT INTO {} AS e (id, epoch) VALUES (1, 1) \
                 ON CONFLICT (id) DO UPDATE SET epoch = e.epoch + 1 \
                 RETURNING epoch",
                epoch
            ),
            schema,
            cache_table,
            epoch_table,
        }
    }
}

fn epoch_from_row(raw: i64) -> u64 {
    u64::try_from(raw).unwrap_or(0)
}

/// Cache table in a PostgreSQL database reached through a pool.
#[derive(Clone)]
pub struct PooledCacheTable {
    pool: Pool,
    sql: Statements,
}

impl fmt::Debug for PooledCacheTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledCacheTable")
            .field("schema", &self.sql.schema)
            .field("cache_table", &self.sql.cache_table)
            .field("epoch_table", &self.sql.epoch_table)
            .field("pool", &self.pool.status())
            .finish()
    }
}

impl PooledCacheTable {
    pub fn new(pool: Pool, config: &DbConfig) -> Self {
        Self {
            pool,
            sql: Statements::new(config),
        }
    }

    /// Build the pool and wrap it.
    pub fn from_config(config: &DbConfig) -> CacheResult<Self> {
        Ok(Self::new(create_pool(config)?, config))
    }

    async fn get_conn(&self) -> CacheResult<deadpool_postgres::Object> {
        self.pool.get().await.map_err(pool_error)
    }

    async fn create_benign(&self, conn: &deadpool_postgres::Object, sql: &str) -> CacheResult<()> {
        match conn.batch_execute(sql).await {
            Ok(()) => Ok(()),
            Err(e) if is_benign_create_race(&e) => {
                tracing::debug!(error = %e, "Cache table created concurrently");
                Ok(())
            }
            Err(e) => Err(pg_error(e)),
        }
    }
}

#[async_trait]
impl CacheTable for PooledCacheTable {
    async fn server_info(&self) -> CacheResult<PgServerInfo> {
        let conn = self.get_conn().await?;
        let row = conn
            .query_one("SELECT version(), current_setting('server_version_num')", &[])
            .await
            .map_err(pg_error)?;
        let version: String = row.get(0);
        let version_num: String = row.get(1);

        PgServerInfo::parse(&version, &version_num).ok_or_else(|| {
            CacheError::from(StorageError::QueryFailed {
                backend: BackendKind::Postgres.name().to_string(),
                reason: format!("unrecognised server version {:?} / {:?}", version, version_num),
            })
        })
    }

    async fn table_exists(&self) -> CacheResult<bool> {
        let conn = self.get_conn().await?;
        let row = conn
            .query_one(
                "SELECT COUNT(*) FROM pg_tables WHERE schemaname = $1 AND tablename IN ($2, $3)",
                &[&self.sql.schema, &self.sql.cache_table, &self.sql.epoch_table],
            )
            .await
            .map_err(pg_error)?;
        let found: i64 = row.get(0);
        Ok(found == 2)
    }

    async fn create_table(&self) -> CacheResult<()> {
        let conn = self.get_conn().await?;
        self.create_benign(&conn, &self.sql.create_cache).await?;
        self.create_benign(&conn, &self.sql.create_epoch).await
    }

    async fn select(
        &self,
        key: &str,
        now_ms: i64,
        cutoff_ms: i64,
    ) -> CacheResult<Option<Vec<u8>>> {
        let conn = self.get_conn().await?;
        let stmt = conn.prepare_cached(&self.sql.select).await.map_err(pg_error)?;
        let row = conn
            .query_opt(&stmt, &[&key, &now_ms, &cutoff_ms])
            .await
            .map_err(pg_error)?;
        Ok(row.map(|row| row.get::<_, Vec<u8>>(0)))
    }

    async fn upsert(
        &self,
        key: &str,
        value: &[u8],
        stored_at: i64,
        expires_at: i64,
    ) -> CacheResult<()> {
        let conn = self.get_conn().await?;
        let stmt = conn.prepare_cached(&self.sql.upsert).await.map_err(pg_error)?;
        conn.execute(&stmt, &[&key, &value, &expires_at, &stored_at])
            .await
            .map_err(pg_error)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        let conn = self.get_conn().await?;
        let stmt = conn.prepare_cached(&self.sql.delete).await.map_err(pg_error)?;
        let affected = conn.execute(&stmt, &[&key]).await.map_err(pg_error)?;
        Ok(affected > 0)
    }

    async fn truncate(&self) -> CacheResult<()> {
        let conn = self.get_conn().await?;
        conn.batch_execute(&self.sql.truncate)
            .await
            .map_err(pg_error)
    }

    async fn read_epoch(&self) -> CacheResult<u64> {
        let conn = self.get_conn().await?;
        let stmt = conn
            .prepare_cached(&self.sql.read_epoch)
            .await
            .map_err(pg_error)?;
        let row = conn.query_opt(&stmt, &[]).await.map_err(pg_error)?;
        Ok(row.map_or(0, |row| epoch_from_row(row.get(0))))
    }

    async fn advance_epoch(&self) -> CacheResult<u64> {
        let conn = self.get_conn().await?;
        let stmt = conn
            .prepare_cached(&self.sql.advance_epoch)
            .await
            .map_err(pg_error)?;
        let row = conn.query_one(&stmt, &[]).await.map_err(pg_error)?;
        Ok(epoch_from_row(row.get(0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statements_use_configured_names() {
        let config = DbConfig {
            schema: "forum".to_string(),
            table_prefix: "smf_".to_string(),
            ..Default::default()
        };
        let sql = Statements::new(&config);
        assert!(sql
            .create_cache
            .starts_with("CREATE UNLOGGED TABLE IF NOT EXISTS forum.smf_cache ("));
        assert!(sql.create_epoch.contains("forum.smf_cache_epoch"));
        assert!(sql.upsert.contains("ON CONFLICT (key) DO UPDATE"));
        assert!(sql.select.contains("ttl > $2 AND stored_at >= $3"));
        assert_eq!(sql.truncate, "TRUNCATE forum.smf_cache");
    }

    #[test]
    fn test_statements_fold_mixed_case_names() {
        let config = DbConfig {
            schema: "Forum".to_string(),
            table_prefix: "SMF_".to_string(),
            ..Default::default()
        };
        let sql = Statements::new(&config);
        assert_eq!(sql.schema, "forum");
        assert_eq!(sql.cache_table, "smf_cache");
        assert_eq!(sql.epoch_table, "smf_cache_epoch");
        assert_eq!(sql.truncate, "TRUNCATE forum.smf_cache");
    }

    #[test]
    fn test_epoch_from_row_clamps_negative() {
        assert_eq!(epoch_from_row(-1), 0);
        assert_eq!(epoch_from_row(42), 42);
    }

    #[test]
    fn test_create_pool_does_not_connect() {
        // Pool creation is lazy; no server is needed until the first checkout.
        let pool = create_pool(&DbConfig::default()).unwrap();
        assert_eq!(pool.status().size, 0);
    }
}
