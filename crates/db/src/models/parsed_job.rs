use std::str::FromStr;

use analyzers::Framework;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Executor, FromRow, Sqlite, SqliteConnection, SqlitePool, types::Json};

use crate::CacheError;

/// One cached analysis of a job trace.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ParsedJob {
    pub id: i64,
    pub project_id: String,
    pub job_id: i64,
    pub pipeline_id: Option<i64>,
    pub job_name: String,
    pub job_stage: String,
    pub job_status: String,
    pub ref_name: Option<String>,
    pub framework: String,
    pub parser_version: i64,
    pub trace_hash: String,
    pub error_count: i64,
    pub warning_count: i64,
    pub parsers_used: Json<Vec<String>>,
    pub hybrid: bool,
    pub duplicates_removed: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CreateParsedJob {
    pub project_id: String,
    pub job_id: i64,
    pub pipeline_id: Option<i64>,
    pub job_name: String,
    pub job_stage: String,
    pub job_status: String,
    pub ref_name: Option<String>,
    pub framework: Framework,
    pub parser_version: i64,
    pub trace_hash: String,
    pub error_count: i64,
    pub warning_count: i64,
    pub parsers_used: Vec<Framework>,
    pub hybrid: bool,
    pub duplicates_removed: i64,
}

/// Snapshot count per parser version.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParserVersionCount {
    pub parser_version: i64,
    pub jobs: i64,
}

const SELECT_COLUMNS: &str = r#"SELECT id, project_id, job_id, pipeline_id, job_name, job_stage, job_status,
       ref_name, framework, parser_version, trace_hash, error_count, warning_count,
       parsers_used, hybrid, duplicates_removed, created_at
  FROM parsed_jobs"#;

impl ParsedJob {
    pub fn framework_kind(&self) -> Result<Framework, CacheError> {
        Framework::from_str(&self.framework).map_err(|_| CacheError::InvalidValue {
            column: "framework",
            value: self.framework.clone(),
        })
    }

    pub async fn find_by_id<'e, E>(executor: E, id: i64) -> Result<Option<Self>, sqlx::Error>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query_as::<_, ParsedJob>(&format!("{SELECT_COLUMNS} WHERE id = $1"))
            .bind(id)
            .fetch_optional(executor)
            .await
    }

    /// Exact cache-key lookup.
    pub async fn find_by_key<'e, E>(
        executor: E,
        job_id: i64,
        trace_hash: &str,
        parser_version: i64,
    ) -> Result<Option<Self>, sqlx::Error>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query_as::<_, ParsedJob>(&format!(
            "{SELECT_COLUMNS} WHERE job_id = $1 AND trace_hash = $2 AND parser_version = $3"
        ))
        .bind(job_id)
        .bind(trace_hash)
        .bind(parser_version)
        .fetch_optional(executor)
        .await
    }

    /// Most recent snapshot of a job, whatever its trace hash or parser version.
    pub async fn find_latest(
        pool: &SqlitePool,
        project_id: &str,
        job_id: i64,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, ParsedJob>(&format!(
            "{SELECT_COLUMNS} WHERE project_id = $1 AND job_id = $2 ORDER BY id DESC LIMIT 1"
        ))
        .bind(project_id)
        .bind(job_id)
        .fetch_optional(pool)
        .await
    }

    /// Latest snapshot of every job of a pipeline, ordered by job id.
    pub async fn list_latest_for_pipeline(
        pool: &SqlitePool,
        project_id: &str,
        pipeline_id: i64,
        job_status: Option<&str>,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, ParsedJob>(&format!(
            r#"{SELECT_COLUMNS}
              WHERE project_id = $1
                AND pipeline_id = $2
                AND ($3 IS NULL OR job_status = $3)
                AND id = (SELECT MAX(q.id) FROM parsed_jobs q
                           WHERE q.project_id = parsed_jobs.project_id
                             AND q.job_id = parsed_jobs.job_id)
              ORDER BY job_id ASC"#
        ))
        .bind(project_id)
        .bind(pipeline_id)
        .bind(job_status)
        .fetch_all(pool)
        .await
    }

    /// Insert a snapshot. Returns `None` when the cache key already exists.
    pub async fn create(
        conn: &mut SqliteConnection,
        data: &CreateParsedJob,
        created_at: DateTime<Utc>,
    ) -> Result<Option<i64>, sqlx::Error> {
        let parsers_used: Vec<String> = data
            .parsers_used
            .iter()
            .map(|f| f.as_str().to_string())
            .collect();

        let result = sqlx::query(
            r#"INSERT INTO parsed_jobs (
                   project_id, job_id, pipeline_id, job_name, job_stage, job_status, ref_name,
                   framework, parser_version, trace_hash, error_count, warning_count,
                   parsers_used, hybrid, duplicates_removed, created_at
               ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
               ON CONFLICT (job_id, trace_hash, parser_version) DO NOTHING"#,
        )
        .bind(&data.project_id)
        .bind(data.job_id)
        .bind(data.pipeline_id)
        .bind(&data.job_name)
        .bind(&data.job_stage)
        .bind(&data.job_status)
        .bind(&data.ref_name)
        .bind(data.framework.as_str())
        .bind(data.parser_version)
        .bind(&data.trace_hash)
        .bind(data.error_count)
        .bind(data.warning_count)
        .bind(Json(parsers_used))
        .bind(data.hybrid)
        .bind(data.duplicates_removed)
        .bind(created_at)
        .execute(conn)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        Ok(Some(result.last_insert_rowid()))
    }

    pub async fn count(pool: &SqlitePool) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar("SELECT COUNT(*) FROM parsed_jobs")
            .fetch_one(pool)
            .await
    }

    pub async fn count_by_parser_version(
        pool: &SqlitePool,
    ) -> Result<Vec<ParserVersionCount>, sqlx::Error> {
        sqlx::query_as::<_, ParserVersionCount>(
            r#"SELECT parser_version, COUNT(*) AS jobs
                 FROM parsed_jobs
                GROUP BY parser_version
                ORDER BY parser_version ASC"#,
        )
        .fetch_all(pool)
        .await
    }
}
