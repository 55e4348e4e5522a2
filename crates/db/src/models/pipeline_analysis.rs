use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool, types::Json};

/// A job that could not be fetched or analyzed during a pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobFailure {
    pub job_id: i64,
    pub job_name: String,
    pub error: String,
}

/// Pipeline-level summary, one row per pipeline. Re-analysis overwrites it.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct PipelineAnalysis {
    pub project_id: String,
    pub pipeline_id: i64,
    pub ref_name: String,
    pub sha: Option<String>,
    pub status: String,
    pub source_branch: Option<String>,
    pub target_branch: Option<String>,
    pub merge_request_iid: Option<i64>,
    /// False when the ref was a merge-request ref whose MR could not be loaded.
    pub can_resolve_branch: bool,
    pub ticket_ids: Json<Vec<String>>,
    pub failed_job_count: i64,
    pub analyzed_job_count: i64,
    pub total_errors: i64,
    pub total_warnings: i64,
    pub category_histogram: Json<BTreeMap<String, i64>>,
    pub parser_usage: Json<BTreeMap<String, i64>>,
    pub job_failures: Json<Vec<JobFailure>>,
    pub parser_version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PipelineAnalysis {
    pub async fn find(
        pool: &SqlitePool,
        project_id: &str,
        pipeline_id: i64,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, PipelineAnalysis>(
            r#"SELECT project_id, pipeline_id, ref_name, sha, status, source_branch, target_branch,
                      merge_request_iid, can_resolve_branch, ticket_ids, failed_job_count,
                      analyzed_job_count, total_errors, total_warnings, category_histogram,
                      parser_usage, job_failures, parser_version, created_at, updated_at
                 FROM pipeline_analyses
                WHERE project_id = $1 AND pipeline_id = $2"#,
        )
        .bind(project_id)
        .bind(pipeline_id)
        .fetch_optional(pool)
        .await
    }

    /// Insert or replace the summary. `created_at` of an existing row is kept.
    pub async fn upsert(pool: &SqlitePool, data: &PipelineAnalysis) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"INSERT INTO pipeline_analyses (
                   project_id, pipeline_id, ref_name, sha, status, source_branch, target_branch,
                   merge_request_iid, can_resolve_branch, ticket_ids, failed_job_count,
                   analyzed_job_count, total_errors, total_warnings, category_histogram,
                   parser_usage, job_failures, parser_version, created_at, updated_at
               ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)
               ON CONFLICT (project_id, pipeline_id) DO UPDATE SET
                   ref_name = excluded.ref_name,
                   sha = excluded.sha,
                   status = excluded.status,
                   source_branch = excluded.source_branch,
                   target_branch = excluded.target_branch,
                   merge_request_iid = excluded.merge_request_iid,
                   can_resolve_branch = excluded.can_resolve_branch,
                   ticket_ids = excluded.ticket_ids,
                   failed_job_count = excluded.failed_job_count,
                   analyzed_job_count = excluded.analyzed_job_count,
                   total_errors = excluded.total_errors,
                   total_warnings = excluded.total_warnings,
                   category_histogram = excluded.category_histogram,
                   parser_usage = excluded.parser_usage,
                   job_failures = excluded.job_failures,
                   parser_version = excluded.parser_version,
                   updated_at = excluded.updated_at"#,
        )
        .bind(&data.project_id)
        .bind(data.pipeline_id)
        .bind(&data.ref_name)
        .bind(&data.sha)
        .bind(&data.status)
        .bind(&data.source_branch)
        .bind(&data.target_branch)
        .bind(data.merge_request_iid)
        .bind(data.can_resolve_branch)
        .bind(&data.ticket_ids)
        .bind(data.failed_job_count)
        .bind(data.analyzed_job_count)
        .bind(data.total_errors)
        .bind(data.total_warnings)
        .bind(&data.category_histogram)
        .bind(&data.parser_usage)
        .bind(&data.job_failures)
        .bind(data.parser_version)
        .bind(data.created_at)
        .bind(data.updated_at)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn count(pool: &SqlitePool) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar("SELECT COUNT(*) FROM pipeline_analyses")
            .fetch_one(pool)
            .await
    }
}
