//! Batched removal of expired and superseded cache entries.
//!
//! Every batch commits on its own so a cancelled run leaves the cache valid
//! and no write lock is held across batches.

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqlitePool};
use tracing::{debug, info};

use crate::{
    CacheError, DBService,
    retry::{RetryConfig, with_retry},
};

pub const DEFAULT_BATCH_SIZE: i64 = 200;

/// A century. Longer retention is clamped to this.
pub const MAX_AGE_HOURS_CAP: u64 = 24 * 365 * 100;

/// Cutoff for keeping `max_age_hours` of history. Never panics; an
/// unrepresentable age keeps everything.
pub fn cutoff_for_age(now: DateTime<Utc>, max_age_hours: u64) -> DateTime<Utc> {
    let hours = max_age_hours.min(MAX_AGE_HOURS_CAP) as i64;
    TimeDelta::try_hours(hours)
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct CleanupReport {
    pub jobs_deleted: u64,
    pub errors_deleted: u64,
    pub index_rows_deleted: u64,
    pub traces_deleted: u64,
    pub pipelines_deleted: u64,
    pub batches: u64,
}

impl CleanupReport {
    pub fn is_empty(&self) -> bool {
        self.jobs_deleted == 0 && self.traces_deleted == 0 && self.pipelines_deleted == 0
    }

    fn absorb(&mut self, other: CleanupReport) {
        self.jobs_deleted += other.jobs_deleted;
        self.errors_deleted += other.errors_deleted;
        self.index_rows_deleted += other.index_rows_deleted;
        self.traces_deleted += other.traces_deleted;
        self.pipelines_deleted += other.pipelines_deleted;
        self.batches += other.batches;
    }
}

/// Delete snapshots, traces and pipeline summaries older than `cutoff`.
pub async fn cleanup_expired(
    db: &DBService,
    cutoff: DateTime<Utc>,
    batch_size: i64,
) -> Result<CleanupReport, CacheError> {
    let pool = &db.pool;
    let batch_size = batch_size.max(1);
    let mut report = CleanupReport::default();

    loop {
        let ids: Vec<i64> = sqlx::query_scalar(
            r#"SELECT id FROM parsed_jobs
                WHERE julianday(created_at) < julianday($1)
                ORDER BY id ASC
                LIMIT $2"#,
        )
        .bind(cutoff)
        .bind(batch_size)
        .fetch_all(pool)
        .await?;

        if ids.is_empty() {
            break;
        }
        report.absorb(delete_batch(pool, &ids).await?);
    }

    report.traces_deleted = with_retry(&RetryConfig::for_cleanup(), "cleanup_traces", || async move {
        let result = sqlx::query(
            r#"DELETE FROM job_traces
                WHERE julianday(created_at) < julianday($1)
                  AND NOT EXISTS (
                      SELECT 1 FROM parsed_jobs p
                       WHERE p.project_id = job_traces.project_id
                         AND p.job_id = job_traces.job_id
                         AND p.trace_hash = job_traces.trace_hash)"#,
        )
        .bind(cutoff)
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    })
    .await?;

    report.pipelines_deleted = with_retry(&RetryConfig::for_cleanup(), "cleanup_pipelines", || async move {
        let result = sqlx::query(
            "DELETE FROM pipeline_analyses WHERE julianday(updated_at) < julianday($1)",
        )
        .bind(cutoff)
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    })
    .await?;

    if !report.is_empty() {
        info!(
            cutoff = %cutoff,
            jobs = report.jobs_deleted,
            errors = report.errors_deleted,
            traces = report.traces_deleted,
            pipelines = report.pipelines_deleted,
            batches = report.batches,
            "Expired cache entries removed"
        );
    }
    Ok(report)
}

/// Delete snapshots produced by an older parser when a snapshot of the same
/// job exists at `current_version`.
pub async fn cleanup_superseded(
    db: &DBService,
    current_version: i64,
    batch_size: i64,
) -> Result<CleanupReport, CacheError> {
    let pool = &db.pool;
    let batch_size = batch_size.max(1);
    let mut report = CleanupReport::default();

    loop {
        let ids: Vec<i64> = sqlx::query_scalar(
            r#"SELECT old.id FROM parsed_jobs old
                WHERE old.parser_version < $1
                  AND EXISTS (
                      SELECT 1 FROM parsed_jobs cur
                       WHERE cur.project_id = old.project_id
                         AND cur.job_id = old.job_id
                         AND cur.parser_version = $1)
                ORDER BY old.id ASC
                LIMIT $2"#,
        )
        .bind(current_version)
        .bind(batch_size)
        .fetch_all(pool)
        .await?;

        if ids.is_empty() {
            break;
        }
        report.absorb(delete_batch(pool, &ids).await?);
    }

    if !report.is_empty() {
        info!(
            current_version,
            jobs = report.jobs_deleted,
            batches = report.batches,
            "Superseded cache entries removed"
        );
    }
    Ok(report)
}

async fn delete_batch(pool: &SqlitePool, ids: &[i64]) -> Result<CleanupReport, CacheError> {
    with_retry(&RetryConfig::for_cleanup(), "cleanup_batch", || async move {
        let mut tx = pool.begin().await?;
        let index_rows_deleted = delete_in(&mut tx, "DELETE FROM file_index WHERE parsed_job_id IN (", ids).await?;
        let errors_deleted = delete_in(&mut tx, "DELETE FROM error_records WHERE parsed_job_id IN (", ids).await?;
        let jobs_deleted = delete_in(&mut tx, "DELETE FROM parsed_jobs WHERE id IN (", ids).await?;
        tx.commit().await?;

        debug!(jobs = jobs_deleted, errors = errors_deleted, "Cleanup batch committed");
        Ok(CleanupReport {
            jobs_deleted,
            errors_deleted,
            index_rows_deleted,
            batches: 1,
            ..Default::default()
        })
    })
    .await
}

async fn delete_in(conn: &mut SqliteConnection, prefix: &str, ids: &[i64]) -> Result<u64, sqlx::Error> {
    let mut builder = QueryBuilder::<Sqlite>::new(prefix);
    {
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(*id);
        }
    }
    builder.push(")");
    let result = builder.build().execute(conn).await?;
    Ok(result.rows_affected())
}
