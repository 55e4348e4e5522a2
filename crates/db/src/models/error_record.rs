use std::{collections::BTreeMap, str::FromStr};

use analyzers::{Framework, Severity, StandardError, TracebackFrame};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, QueryBuilder, Sqlite, SqliteConnection, SqlitePool, types::Json};

use super::Page;
use crate::CacheError;

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub id: i64,
    pub parsed_job_id: i64,
    pub job_id: i64,
    pub ordinal: i64,
    pub level: String,
    pub category: String,
    pub message: String,
    pub exception_type: Option<String>,
    pub test_name: Option<String>,
    pub file_path: String,
    pub line_number: Option<i64>,
    pub column_number: Option<i64>,
    pub rule: Option<String>,
    pub context_snippet: String,
    pub traceback: Json<Vec<TracebackFrame>>,
    pub fingerprint: String,
    pub source_parser: String,
}

const SELECT_COLUMNS: &str = r#"SELECT e.id, e.parsed_job_id, e.job_id, e.ordinal, e.level, e.category,
       e.message, e.exception_type, e.test_name, e.file_path, e.line_number,
       e.column_number, e.rule, e.context_snippet, e.traceback, e.fingerprint,
       e.source_parser
  FROM error_records e"#;

impl ErrorRecord {
    /// Back to the analyzer's record type.
    pub fn to_standard(&self) -> Result<StandardError, CacheError> {
        let level = Severity::from_str(&self.level).map_err(|_| CacheError::InvalidValue {
            column: "level",
            value: self.level.clone(),
        })?;
        let source_parser =
            Framework::from_str(&self.source_parser).map_err(|_| CacheError::InvalidValue {
                column: "source_parser",
                value: self.source_parser.clone(),
            })?;

        Ok(StandardError {
            ordinal: self.ordinal.max(0) as usize,
            level,
            category: self.category.clone(),
            message: self.message.clone(),
            exception_type: self.exception_type.clone(),
            test_name: self.test_name.clone(),
            file_path: self.file_path.clone(),
            line_number: self.line_number.and_then(|n| u32::try_from(n).ok()),
            column: self.column_number.and_then(|n| u32::try_from(n).ok()),
            rule: self.rule.clone(),
            context_snippet: self.context_snippet.clone(),
            traceback: self.traceback.0.clone(),
            fingerprint: self.fingerprint.clone(),
            source_parser,
        })
    }

    /// Insert a snapshot's records. Returns `(row id, file path)` per record in
    /// ordinal order so the file index can be rebuilt from it.
    pub async fn create_many(
        conn: &mut SqliteConnection,
        parsed_job_id: i64,
        job_id: i64,
        errors: &[StandardError],
    ) -> Result<Vec<(i64, String)>, sqlx::Error> {
        let mut inserted = Vec::with_capacity(errors.len());
        for error in errors {
            let result = sqlx::query(
                r#"INSERT INTO error_records (
                       parsed_job_id, job_id, ordinal, level, category, message,
                       exception_type, test_name, file_path, line_number, column_number,
                       rule, context_snippet, traceback, fingerprint, source_parser
                   ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)"#,
            )
            .bind(parsed_job_id)
            .bind(job_id)
            .bind(error.ordinal as i64)
            .bind(error.level.as_str())
            .bind(&error.category)
            .bind(&error.message)
            .bind(&error.exception_type)
            .bind(&error.test_name)
            .bind(&error.file_path)
            .bind(error.line_number.map(i64::from))
            .bind(error.column.map(i64::from))
            .bind(&error.rule)
            .bind(&error.context_snippet)
            .bind(Json(&error.traceback))
            .bind(&error.fingerprint)
            .bind(error.source_parser.as_str())
            .execute(&mut *conn)
            .await?;
            inserted.push((result.last_insert_rowid(), error.file_path.clone()));
        }
        Ok(inserted)
    }

    pub async fn find_by_ordinal(
        pool: &SqlitePool,
        parsed_job_id: i64,
        ordinal: i64,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, ErrorRecord>(&format!(
            "{SELECT_COLUMNS} WHERE e.parsed_job_id = $1 AND e.ordinal = $2"
        ))
        .bind(parsed_job_id)
        .bind(ordinal)
        .fetch_optional(pool)
        .await
    }

    pub async fn list_for_job(
        pool: &SqlitePool,
        parsed_job_id: i64,
        page: Page,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, ErrorRecord>(&format!(
            "{SELECT_COLUMNS} WHERE e.parsed_job_id = $1 ORDER BY e.ordinal ASC LIMIT $2 OFFSET $3"
        ))
        .bind(parsed_job_id)
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(pool)
        .await
    }

    pub async fn count_for_job(pool: &SqlitePool, parsed_job_id: i64) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar("SELECT COUNT(*) FROM error_records WHERE parsed_job_id = $1")
            .bind(parsed_job_id)
            .fetch_one(pool)
            .await
    }

    /// Records of several snapshots, ordered by job then ordinal.
    pub async fn list_for_jobs(
        pool: &SqlitePool,
        parsed_job_ids: &[i64],
        page: Page,
    ) -> Result<Vec<Self>, sqlx::Error> {
        if parsed_job_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut builder = QueryBuilder::<Sqlite>::new(SELECT_COLUMNS);
        builder.push(" WHERE e.parsed_job_id IN (");
        {
            let mut separated = builder.separated(", ");
            for id in parsed_job_ids {
                separated.push_bind(*id);
            }
        }
        builder.push(") ORDER BY e.job_id ASC, e.ordinal ASC LIMIT ");
        builder.push_bind(page.limit);
        builder.push(" OFFSET ");
        builder.push_bind(page.offset);

        builder.build_query_as::<ErrorRecord>().fetch_all(pool).await
    }

    pub async fn count_for_jobs(pool: &SqlitePool, parsed_job_ids: &[i64]) -> Result<i64, sqlx::Error> {
        if parsed_job_ids.is_empty() {
            return Ok(0);
        }

        let mut builder =
            QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM error_records WHERE parsed_job_id IN (");
        {
            let mut separated = builder.separated(", ");
            for id in parsed_job_ids {
                separated.push_bind(*id);
            }
        }
        builder.push(")");

        builder.build_query_scalar::<i64>().fetch_one(pool).await
    }

    /// Records of one snapshot attributed to `file_path`, via the file index.
    pub async fn list_for_file(
        pool: &SqlitePool,
        parsed_job_id: i64,
        file_path: &str,
        page: Page,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, ErrorRecord>(&format!(
            r#"{SELECT_COLUMNS}
                 JOIN file_index f ON f.error_id = e.id
                WHERE f.parsed_job_id = $1 AND f.file_path = $2
                ORDER BY e.ordinal ASC
                LIMIT $3 OFFSET $4"#
        ))
        .bind(parsed_job_id)
        .bind(file_path)
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(pool)
        .await
    }

    pub async fn count_for_file(
        pool: &SqlitePool,
        parsed_job_id: i64,
        file_path: &str,
    ) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar(
            "SELECT COUNT(*) FROM file_index WHERE parsed_job_id = $1 AND file_path = $2",
        )
        .bind(parsed_job_id)
        .bind(file_path)
        .fetch_one(pool)
        .await
    }

    /// Record count per category over several snapshots.
    pub async fn category_counts(
        pool: &SqlitePool,
        parsed_job_ids: &[i64],
    ) -> Result<BTreeMap<String, i64>, sqlx::Error> {
        if parsed_job_ids.is_empty() {
            return Ok(BTreeMap::new());
        }

        let mut builder = QueryBuilder::<Sqlite>::new(
            "SELECT category, COUNT(*) FROM error_records WHERE parsed_job_id IN (",
        );
        {
            let mut separated = builder.separated(", ");
            for id in parsed_job_ids {
                separated.push_bind(*id);
            }
        }
        builder.push(") GROUP BY category");

        let rows: Vec<(String, i64)> = builder.build_query_as().fetch_all(pool).await?;
        Ok(rows.into_iter().collect())
    }

    pub async fn count(pool: &SqlitePool) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar("SELECT COUNT(*) FROM error_records")
            .fetch_one(pool)
            .await
    }

    /// Records whose parent snapshot no longer exists.
    pub async fn count_orphaned(pool: &SqlitePool) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar(
            r#"SELECT COUNT(*) FROM error_records e
                 LEFT JOIN parsed_jobs p ON p.id = e.parsed_job_id
                WHERE p.id IS NULL"#,
        )
        .fetch_one(pool)
        .await
    }
}
