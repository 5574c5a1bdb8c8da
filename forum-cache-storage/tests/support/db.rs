use std::sync::Arc;

use forum_cache_storage::cache::{CacheTable, PooledCacheTable};
use forum_cache_storage::DbConfig;

/// Connection settings from the environment with tables private to one test.
pub fn test_db_config(table_prefix: &str) -> DbConfig {
    DbConfig {
        table_prefix: table_prefix.to_string(),
        ..DbConfig::from_env()
    }
}

pub fn test_cache_table(table_prefix: &str) -> Arc<dyn CacheTable> {
    let config = test_db_config(table_prefix);
    Arc::new(PooledCacheTable::from_config(&config).expect("Failed to create cache table pool"))
}
