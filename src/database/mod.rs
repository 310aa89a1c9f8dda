//! Persistence layer: SQLite via sqlx.
//!
//! Connection pool management, typed models, repositories, retry helpers.

pub mod models;
pub mod repositories;
pub mod retry;
pub mod time;

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{ConnectOptions, Pool, Sqlite};
use tracing::info;

use crate::config::DatabaseConfig;
use crate::Result;

/// Database connection pool type alias.
pub type DbPool = Pool<Sqlite>;

/// Default connection pool size.
const DEFAULT_POOL_SIZE: u32 = 10;

/// Default busy timeout in milliseconds.
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 30_000;

/// Compute a sensible default pool size based on available CPU cores.
///
/// SQLite readers don't benefit much beyond ~10 connections.
pub fn default_pool_size() -> u32 {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(2);
    (cores * 2).min(DEFAULT_POOL_SIZE)
}

/// Initialize the connection pool from a database URL.
///
/// Enables WAL journal mode, NORMAL synchronous, foreign keys, a busy
/// timeout, and creates the database file if missing. `query_logging` turns
/// on per-statement logging at DEBUG.
pub async fn init_pool(database_url: &str, query_logging: bool) -> Result<DbPool> {
    let mut connect_options = SqliteConnectOptions::from_str(database_url)?
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS))
        .foreign_keys(true)
        .create_if_missing(true);

    connect_options = if query_logging {
        connect_options.log_statements(log::LevelFilter::Debug)
    } else {
        connect_options.disable_statement_logging()
    };

    let pool = SqlitePoolOptions::new()
        .max_connections(default_pool_size())
        .acquire_timeout(Duration::from_secs(30))
        .connect_with(connect_options)
        .await?;

    info!(
        "Database pool initialized with WAL mode, {} max connections",
        default_pool_size()
    );

    Ok(pool)
}

/// Initialize the pool from a [`DatabaseConfig`], ensuring the parent
/// directory of the database file exists.
pub async fn init_pool_from_config(config: &DatabaseConfig) -> Result<DbPool> {
    let path = std::path::Path::new(&config.path);
    crate::utils::fs::ensure_parent_dir(path).await?;

    let url = format!("sqlite:{}?mode=rwc", config.path.replace('\\', "/"));
    init_pool(&url, config.query_logging).await
}

/// Apply pending schema migrations.
pub async fn run_migrations(pool: &DbPool) -> Result<()> {
    info!("Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| crate::Error::Database(e.to_string()))?;
    info!("Database migrations completed");
    Ok(())
}

/// In-memory pool for tests. Pinned to a single connection so every query
/// sees the same in-memory database.
#[cfg(test)]
pub(crate) async fn test_pool() -> DbPool {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")
        .unwrap()
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await
        .unwrap();
    run_migrations(&pool).await.unwrap();
    pool
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn init_pool_enables_foreign_keys() {
        let pool = test_pool().await;
        let fk: (i64,) = sqlx::query_as("PRAGMA foreign_keys")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(fk.0, 1);
    }
}
