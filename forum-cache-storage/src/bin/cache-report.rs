//! Cache Report Binary
//!
//! Resolves the cache backend exactly as the forum would and prints the
//! administrative report as JSON to stdout. Logs go to stderr.
//!
//! Usage:
//!   FORUM_CACHE_BACKEND=lmdb cargo run -p forum-cache-storage --bin cache-report

use forum_cache_storage::{CacheSettings, ForumCache};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("forum_cache_storage=info,warn"));

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr),
        )
        .try_init();
}

#[tokio::main]
async fn main() {
    init_tracing();

    let settings = match CacheSettings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Invalid cache configuration: {}", e);
            std::process::exit(2);
        }
    };

    let cache = ForumCache::from_settings(&settings).await;
    let report = cache.report().await;

    match serde_json::to_string_pretty(&report) {
        Ok(json) => println!("{}", json),
        Err(e) => {
            eprintln!("Failed to serialize cache report: {}", e);
            std::process::exit(1);
        }
    }
}
