//! Persistent analysis cache.
//!
//! SQLite (WAL) store for parsed jobs, their error records, the derived
//! file index, compressed raw traces and pipeline summaries. Entries are keyed
//! by `(job id, trace hash, parser version)` so a changed trace or parser
//! produces a new snapshot instead of mutating an old one.

use std::{
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
};
use tracing::info;
use utils::assets::database_path;

pub mod cleanup;
pub mod cleanup_scheduler;
pub mod error;
pub mod health;
pub mod models;
pub mod retry;
pub mod store;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use cleanup::{
    CleanupReport, MAX_AGE_HOURS_CAP, cleanup_expired, cleanup_superseded, cutoff_for_age,
};
pub use cleanup_scheduler::{CleanupScheduler, CleanupSchedulerConfig, CleanupSchedulerHandle};
pub use error::CacheError;
pub use health::{HealthReport, HealthStatus, health_check};
pub use retry::{RetryConfig, is_retryable_error, with_retry};
pub use store::{NewJobAnalysis, StoreOutcome};

const DEFAULT_MAX_CONNECTIONS: u32 = 8;
const DEFAULT_MIN_CONNECTIONS: u32 = 1;
const BUSY_TIMEOUT_SECS: u64 = 30;
const ACQUIRE_TIMEOUT_SECS: u64 = 30;

/// Applied to every pooled connection.
///
/// `synchronous` goes after `mmap_size`; with mmap enabled and the default
/// synchronous mode SQLite can report IOERR (522) under write load.
async fn apply_pragmas(conn: &mut SqliteConnection) -> Result<(), sqlx::Error> {
    sqlx::query("PRAGMA temp_store = 2").execute(&mut *conn).await?;
    sqlx::query("PRAGMA mmap_size = 67108864").execute(&mut *conn).await?;
    sqlx::query("PRAGMA synchronous = NORMAL").execute(&mut *conn).await?;
    sqlx::query("PRAGMA cache_size = -16000").execute(&mut *conn).await?;
    sqlx::query("PRAGMA foreign_keys = ON").execute(&mut *conn).await?;
    Ok(())
}

#[derive(Clone)]
pub struct DBService {
    pub pool: SqlitePool,
    path: PathBuf,
}

impl DBService {
    /// Open the cache at `MCP_DATABASE_PATH` (or the default asset location).
    pub async fn new() -> Result<DBService, CacheError> {
        Self::open(&database_path()).await
    }

    /// Open (creating if needed) the cache at `path` and run migrations.
    pub async fn open(path: &Path) -> Result<DBService, CacheError> {
        match Self::connect(path).await {
            Ok(db) => Ok(db),
            Err(e) => {
                health::log_storage_failure(path, &e);
                Err(e)
            }
        }
    }

    async fn connect(path: &Path) -> Result<DBService, CacheError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let database_url = format!("sqlite://{}", path.to_string_lossy());
        let options = SqliteConnectOptions::from_str(&database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(BUSY_TIMEOUT_SECS));

        let pool = SqlitePoolOptions::new()
            .max_connections(DEFAULT_MAX_CONNECTIONS)
            .min_connections(DEFAULT_MIN_CONNECTIONS)
            .acquire_timeout(Duration::from_secs(ACQUIRE_TIMEOUT_SECS))
            .after_connect(|conn, _meta| Box::pin(async move { apply_pragmas(conn).await }))
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        info!(path = %path.display(), "Analysis cache ready");
        Ok(DBService {
            pool,
            path: path.to_path_buf(),
        })
    }

    /// Wrap an already migrated pool.
    pub fn from_pool(pool: SqlitePool, path: PathBuf) -> DBService {
        DBService { pool, path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
