use std::io::{Read, Write};

use chrono::{DateTime, Utc};
use flate2::{Compression, read::DeflateDecoder, write::DeflateEncoder};
use sqlx::{FromRow, SqliteConnection, SqlitePool};

use crate::CacheError;

/// Raw job trace, stored deflate-compressed next to its analyses.
#[derive(Debug, Clone, FromRow)]
pub struct JobTrace {
    pub project_id: String,
    pub job_id: i64,
    pub trace_hash: String,
    pub original_length: i64,
    pub compressed: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

pub fn compress(text: &str) -> Result<Vec<u8>, CacheError> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(text.as_bytes())?;
    Ok(encoder.finish()?)
}

pub fn decompress(bytes: &[u8]) -> Result<String, CacheError> {
    let mut decoder = DeflateDecoder::new(bytes);
    let mut out = String::new();
    decoder.read_to_string(&mut out)?;
    Ok(out)
}

impl JobTrace {
    pub fn text(&self) -> Result<String, CacheError> {
        decompress(&self.compressed)
    }

    /// Store a trace once per `(project, job, hash)`. Returns whether a row
    /// was written.
    pub async fn store(
        conn: &mut SqliteConnection,
        project_id: &str,
        job_id: i64,
        trace_hash: &str,
        text: &str,
        created_at: DateTime<Utc>,
    ) -> Result<bool, CacheError> {
        let compressed = compress(text)?;
        let result = sqlx::query(
            r#"INSERT INTO job_traces (project_id, job_id, trace_hash, original_length, compressed, created_at)
               VALUES ($1, $2, $3, $4, $5, $6)
               ON CONFLICT (project_id, job_id, trace_hash) DO NOTHING"#,
        )
        .bind(project_id)
        .bind(job_id)
        .bind(trace_hash)
        .bind(text.len() as i64)
        .bind(compressed)
        .bind(created_at)
        .execute(conn)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn find(
        pool: &SqlitePool,
        project_id: &str,
        job_id: i64,
        trace_hash: &str,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, JobTrace>(
            r#"SELECT project_id, job_id, trace_hash, original_length, compressed, created_at
                 FROM job_traces
                WHERE project_id = $1 AND job_id = $2 AND trace_hash = $3"#,
        )
        .bind(project_id)
        .bind(job_id)
        .bind(trace_hash)
        .fetch_optional(pool)
        .await
    }

    pub async fn count(pool: &SqlitePool) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar("SELECT COUNT(*) FROM job_traces")
            .fetch_one(pool)
            .await
    }

    /// Traces with no snapshot referencing them.
    pub async fn count_orphaned(pool: &SqlitePool) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar(
            r#"SELECT COUNT(*) FROM job_traces t
                WHERE NOT EXISTS (
                    SELECT 1 FROM parsed_jobs p
                     WHERE p.project_id = t.project_id
                       AND p.job_id = t.job_id
                       AND p.trace_hash = t.trace_hash)"#,
        )
        .fetch_one(pool)
        .await
    }
}
