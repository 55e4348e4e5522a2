//! Atomic write of one job analysis.

use analyzers::TraceAnalysis;
use chrono::Utc;
use sqlx::SqlitePool;
use tracing::debug;

use crate::{
    CacheError, DBService,
    models::{
        error_record::ErrorRecord,
        file_index::FileIndex,
        job_trace::JobTrace,
        parsed_job::{CreateParsedJob, ParsedJob},
    },
    retry::{RetryConfig, with_retry},
};

/// Job metadata plus the analysis to cache for it.
#[derive(Debug, Clone, Copy)]
pub struct NewJobAnalysis<'a> {
    pub project_id: &'a str,
    pub job_id: i64,
    pub pipeline_id: Option<i64>,
    pub job_name: &'a str,
    pub job_stage: &'a str,
    pub job_status: &'a str,
    pub ref_name: Option<&'a str>,
    pub trace_hash: &'a str,
    /// Raw trace, kept compressed when present.
    pub raw_trace: Option<&'a str>,
    pub analysis: &'a TraceAnalysis,
}

#[derive(Debug, Clone)]
pub enum StoreOutcome {
    Inserted(ParsedJob),
    /// A snapshot with the same job, trace hash and parser version existed.
    Unchanged(ParsedJob),
}

impl StoreOutcome {
    pub fn job(&self) -> &ParsedJob {
        match self {
            StoreOutcome::Inserted(job) | StoreOutcome::Unchanged(job) => job,
        }
    }

    pub fn into_job(self) -> ParsedJob {
        match self {
            StoreOutcome::Inserted(job) | StoreOutcome::Unchanged(job) => job,
        }
    }

    pub fn was_inserted(&self) -> bool {
        matches!(self, StoreOutcome::Inserted(_))
    }
}

impl DBService {
    /// Write a snapshot, its records, its file index and the raw trace in one
    /// transaction. Readers see either none of it or all of it.
    pub async fn store_job_analysis(
        &self,
        new: &NewJobAnalysis<'_>,
    ) -> Result<StoreOutcome, CacheError> {
        let pool = &self.pool;
        with_retry(&RetryConfig::default(), "store_job_analysis", || async move {
            store_once(pool, new).await
        })
        .await
    }

    /// Cache lookup by `(job id, trace hash, parser version)`.
    pub async fn find_job_analysis(
        &self,
        job_id: i64,
        trace_hash: &str,
        parser_version: i64,
    ) -> Result<Option<ParsedJob>, CacheError> {
        Ok(ParsedJob::find_by_key(&self.pool, job_id, trace_hash, parser_version).await?)
    }
}

async fn store_once(pool: &SqlitePool, new: &NewJobAnalysis<'_>) -> Result<StoreOutcome, CacheError> {
    let analysis = new.analysis;
    let now = Utc::now();
    let mut tx = pool.begin().await?;

    if let Some(raw) = new.raw_trace {
        JobTrace::store(&mut tx, new.project_id, new.job_id, new.trace_hash, raw, now).await?;
    }

    let data = CreateParsedJob {
        project_id: new.project_id.to_string(),
        job_id: new.job_id,
        pipeline_id: new.pipeline_id,
        job_name: new.job_name.to_string(),
        job_stage: new.job_stage.to_string(),
        job_status: new.job_status.to_string(),
        ref_name: new.ref_name.map(str::to_string),
        framework: analysis.framework,
        parser_version: analysis.parser_version,
        trace_hash: new.trace_hash.to_string(),
        error_count: analysis.error_count() as i64,
        warning_count: analysis.warning_count() as i64,
        parsers_used: analysis.parsers_used.clone(),
        hybrid: analysis.hybrid,
        duplicates_removed: analysis.duplicates_removed as i64,
    };

    let Some(parsed_job_id) = ParsedJob::create(&mut tx, &data, now).await? else {
        let existing =
            ParsedJob::find_by_key(&mut *tx, new.job_id, new.trace_hash, analysis.parser_version)
                .await?
                .ok_or(sqlx::Error::RowNotFound)?;
        tx.commit().await?;
        debug!(job_id = new.job_id, parser_version = analysis.parser_version, "Analysis already cached");
        return Ok(StoreOutcome::Unchanged(existing));
    };

    let inserted = ErrorRecord::create_many(&mut tx, parsed_job_id, new.job_id, &analysis.errors).await?;
    FileIndex::rebuild(&mut tx, parsed_job_id, &inserted).await?;

    let job = ParsedJob::find_by_id(&mut *tx, parsed_job_id)
        .await?
        .ok_or(sqlx::Error::RowNotFound)?;
    tx.commit().await?;

    debug!(
        job_id = new.job_id,
        parsed_job_id,
        errors = inserted.len(),
        "Stored job analysis"
    );
    Ok(StoreOutcome::Inserted(job))
}
