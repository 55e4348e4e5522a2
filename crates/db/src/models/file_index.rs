use serde::{Deserialize, Serialize};
use sqlx::{FromRow, QueryBuilder, Sqlite, SqliteConnection, SqlitePool};

use super::Page;

/// A file and how many records point at it.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileErrorCount {
    pub file_path: String,
    pub error_count: i64,
}

pub struct FileIndex;

impl FileIndex {
    /// Replace the index of one snapshot. Records with no file are skipped.
    pub async fn rebuild(
        conn: &mut SqliteConnection,
        parsed_job_id: i64,
        entries: &[(i64, String)],
    ) -> Result<u64, sqlx::Error> {
        sqlx::query("DELETE FROM file_index WHERE parsed_job_id = $1")
            .bind(parsed_job_id)
            .execute(&mut *conn)
            .await?;

        let rows: Vec<&(i64, String)> = entries
            .iter()
            .filter(|(_, path)| !path.is_empty())
            .collect();
        if rows.is_empty() {
            return Ok(0);
        }

        let mut builder =
            QueryBuilder::<Sqlite>::new("INSERT INTO file_index (parsed_job_id, file_path, error_id) ");
        builder.push_values(rows, |mut b, (error_id, path)| {
            b.push_bind(parsed_job_id)
                .push_bind(path.as_str())
                .push_bind(*error_id);
        });
        let result = builder.build().execute(&mut *conn).await?;
        Ok(result.rows_affected())
    }

    /// Files of one snapshot, most errors first.
    pub async fn files_for_job(
        pool: &SqlitePool,
        parsed_job_id: i64,
        page: Page,
    ) -> Result<Vec<FileErrorCount>, sqlx::Error> {
        sqlx::query_as::<_, FileErrorCount>(
            r#"SELECT file_path, COUNT(*) AS error_count
                 FROM file_index
                WHERE parsed_job_id = $1
                GROUP BY file_path
                ORDER BY error_count DESC, file_path ASC
                LIMIT $2 OFFSET $3"#,
        )
        .bind(parsed_job_id)
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(pool)
        .await
    }

    pub async fn count_files_for_job(pool: &SqlitePool, parsed_job_id: i64) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar(
            "SELECT COUNT(DISTINCT file_path) FROM file_index WHERE parsed_job_id = $1",
        )
        .bind(parsed_job_id)
        .fetch_one(pool)
        .await
    }

    /// Files across several snapshots, counts summed.
    pub async fn files_for_jobs(
        pool: &SqlitePool,
        parsed_job_ids: &[i64],
        page: Page,
    ) -> Result<Vec<FileErrorCount>, sqlx::Error> {
        if parsed_job_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut builder = QueryBuilder::<Sqlite>::new(
            "SELECT file_path, COUNT(*) AS error_count FROM file_index WHERE parsed_job_id IN (",
        );
        {
            let mut separated = builder.separated(", ");
            for id in parsed_job_ids {
                separated.push_bind(*id);
            }
        }
        builder.push(") GROUP BY file_path ORDER BY error_count DESC, file_path ASC LIMIT ");
        builder.push_bind(page.limit);
        builder.push(" OFFSET ");
        builder.push_bind(page.offset);

        builder.build_query_as::<FileErrorCount>().fetch_all(pool).await
    }

    pub async fn count_files_for_jobs(
        pool: &SqlitePool,
        parsed_job_ids: &[i64],
    ) -> Result<i64, sqlx::Error> {
        if parsed_job_ids.is_empty() {
            return Ok(0);
        }

        let mut builder = QueryBuilder::<Sqlite>::new(
            "SELECT COUNT(DISTINCT file_path) FROM file_index WHERE parsed_job_id IN (",
        );
        {
            let mut separated = builder.separated(", ");
            for id in parsed_job_ids {
                separated.push_bind(*id);
            }
        }
        builder.push(")");

        builder.build_query_scalar::<i64>().fetch_one(pool).await
    }

    pub async fn count(pool: &SqlitePool) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar("SELECT COUNT(*) FROM file_index")
            .fetch_one(pool)
            .await
    }

    /// Index rows whose snapshot or error record is gone.
    pub async fn count_orphaned(pool: &SqlitePool) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar(
            r#"SELECT COUNT(*) FROM file_index f
                 LEFT JOIN parsed_jobs p ON p.id = f.parsed_job_id
                 LEFT JOIN error_records e ON e.id = f.error_id
                WHERE p.id IS NULL OR e.id IS NULL"#,
        )
        .fetch_one(pool)
        .await
    }
}
