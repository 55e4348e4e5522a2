//! Job and pipeline analysis.
//!
//! [`AnalysisService::analyze_job`] is the only path that fetches a trace,
//! runs the analyzers and writes the cache. Pipeline analysis fans out over
//! the failed jobs with bounded concurrency and persists a summary.

use std::{collections::BTreeMap, sync::Arc};

use analyzers::{AnalysisEngine, PARSER_VERSION};
use chrono::Utc;
use db::{
    CacheError, DBService, NewJobAnalysis,
    models::{
        error_record::ErrorRecord,
        pipeline_analysis::{JobFailure, PipelineAnalysis},
    },
};
use futures::{StreamExt, stream};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use sqlx::types::Json;
use thiserror::Error;
use utils::hash::{content_hash, short_hash};

use super::gitlab::{GitLabApi, GitLabError, JobInfo, MergeRequestInfo, PipelineInfo};

lazy_static! {
    static ref MERGE_REQUEST_REF: Regex =
        Regex::new(r"^refs/merge-requests/(\d+)/(?:head|merge|train)$").expect("valid regex");
    static ref TICKET_ID: Regex = Regex::new(r"\b([A-Z][A-Z0-9]+)-(\d+)\b").expect("valid regex");
}

const MAX_TICKET_KEY_LEN: usize = 10;

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("fetch failed: {0}")]
    Fetch(#[from] GitLabError),
    #[error("cache failed: {0}")]
    Cache(#[from] CacheError),
    #[error("analysis task failed: {0}")]
    Task(String),
}

impl From<sqlx::Error> for AnalysisError {
    fn from(e: sqlx::Error) -> Self {
        Self::Cache(CacheError::from(e))
    }
}

/// Outcome of analyzing one job.
#[derive(Debug, Clone, Serialize)]
pub struct JobAnalysisSummary {
    pub project_id: String,
    pub job_id: i64,
    pub pipeline_id: Option<i64>,
    pub job_name: String,
    pub job_stage: String,
    pub job_status: String,
    pub parsed_job_id: i64,
    pub framework: String,
    pub parser_version: i64,
    pub trace_hash: String,
    pub error_count: i64,
    pub warning_count: i64,
    pub parsers_used: Vec<String>,
    pub hybrid: bool,
    pub duplicates_removed: i64,
    /// Served from an existing snapshot without re-parsing.
    pub cached: bool,
    pub resource_uri: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub summary: PipelineAnalysis,
    pub jobs: Vec<JobAnalysisSummary>,
    pub resource_uri: String,
}

/// Branch context of a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BranchContext {
    pub source_branch: Option<String>,
    pub target_branch: Option<String>,
    pub merge_request_iid: Option<i64>,
    pub can_resolve_branch: bool,
    pub ticket_ids: Vec<String>,
}

/// Merge-request iid encoded in a `refs/merge-requests/{iid}/...` ref.
pub fn merge_request_iid(ref_name: &str) -> Option<i64> {
    MERGE_REQUEST_REF
        .captures(ref_name)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Ticket ids like `PROJ-123`, in order of first appearance.
pub fn extract_ticket_ids<'a>(texts: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut tickets: Vec<String> = Vec::new();
    for text in texts {
        for caps in TICKET_ID.captures_iter(text) {
            if caps[1].len() > MAX_TICKET_KEY_LEN {
                continue;
            }
            let ticket = caps[0].to_string();
            if !tickets.contains(&ticket) {
                tickets.push(ticket);
            }
        }
    }
    tickets
}

fn branch_context_from_mr(mr: &MergeRequestInfo) -> BranchContext {
    let texts = [Some(mr.title.as_str()), mr.description.as_deref()];
    BranchContext {
        source_branch: Some(mr.source_branch.clone()),
        target_branch: Some(mr.target_branch.clone()),
        merge_request_iid: Some(mr.iid),
        can_resolve_branch: true,
        ticket_ids: extract_ticket_ids(texts.into_iter().flatten()),
    }
}

#[derive(Clone)]
pub struct AnalysisService {
    gitlab: Arc<dyn GitLabApi>,
    db: DBService,
    engine: AnalysisEngine,
    max_concurrent_jobs: usize,
}

impl AnalysisService {
    pub fn new(gitlab: Arc<dyn GitLabApi>, db: DBService, max_concurrent_jobs: usize) -> Self {
        Self {
            gitlab,
            db,
            engine: AnalysisEngine::default(),
            max_concurrent_jobs: max_concurrent_jobs.max(1),
        }
    }

    pub fn with_engine(mut self, engine: AnalysisEngine) -> Self {
        self.engine = engine;
        self
    }

    pub fn db(&self) -> &DBService {
        &self.db
    }

    /// Fetch, analyze and cache one job.
    pub async fn analyze_job(&self, project_id: &str, job_id: i64) -> Result<JobAnalysisSummary, AnalysisError> {
        let job = self.gitlab.fetch_job(project_id, job_id).await?;
        self.analyze_fetched_job(project_id, &job).await
    }

    async fn analyze_fetched_job(
        &self,
        project_id: &str,
        job: &JobInfo,
    ) -> Result<JobAnalysisSummary, AnalysisError> {
        let trace = self.gitlab.fetch_job_trace(project_id, job.id).await?;
        let trace_hash = content_hash(trace.as_bytes());
        let parser_version = self.engine.parser_version();

        if let Some(existing) = self
            .db
            .find_job_analysis(job.id, &trace_hash, parser_version)
            .await?
        {
            tracing::debug!(
                project_id,
                job_id = job.id,
                trace_hash = short_hash(&trace_hash),
                "Analysis cache hit"
            );
            return Ok(summary_from_row(&existing, true));
        }

        let engine = self.engine.clone();
        let name = job.name.clone();
        let stage = job.stage.clone();
        let (analysis, trace) = tokio::task::spawn_blocking(move || {
            let analysis = engine.analyze(&name, &stage, &trace);
            (analysis, trace)
        })
        .await
        .map_err(|e| AnalysisError::Task(e.to_string()))?;

        let outcome = self
            .db
            .store_job_analysis(&NewJobAnalysis {
                project_id,
                job_id: job.id,
                pipeline_id: job.pipeline_id(),
                job_name: &job.name,
                job_stage: &job.stage,
                job_status: &job.status,
                ref_name: job.ref_name.as_deref(),
                trace_hash: &trace_hash,
                raw_trace: Some(&trace),
                analysis: &analysis,
            })
            .await?;

        tracing::info!(
            project_id,
            job_id = job.id,
            job_name = %job.name,
            framework = %analysis.framework,
            errors = analysis.error_count(),
            warnings = analysis.warning_count(),
            hybrid = analysis.hybrid,
            "Job analyzed"
        );

        let cached = !outcome.was_inserted();
        Ok(summary_from_row(outcome.job(), cached))
    }

    /// Analyze every failed job of a pipeline and persist the summary.
    ///
    /// A job whose fetch or cache write fails is recorded in
    /// `job_failures`; it never aborts the other jobs.
    pub async fn analyze_pipeline(
        &self,
        project_id: &str,
        pipeline_id: i64,
    ) -> Result<PipelineReport, AnalysisError> {
        let pipeline = self.gitlab.fetch_pipeline(project_id, pipeline_id).await?;
        let failed_jobs = self.gitlab.fetch_failed_jobs(project_id, pipeline_id).await?;
        let branch = self.resolve_branch(project_id, &pipeline).await;

        tracing::info!(
            project_id,
            pipeline_id,
            failed_jobs = failed_jobs.len(),
            concurrency = self.max_concurrent_jobs,
            "Analyzing pipeline"
        );

        let mut results: Vec<(JobInfo, Result<JobAnalysisSummary, AnalysisError>)> =
            stream::iter(failed_jobs.iter().cloned())
                .map(|job| async move {
                    let result = self.analyze_fetched_job(project_id, &job).await;
                    (job, result)
                })
                .buffer_unordered(self.max_concurrent_jobs)
                .collect()
                .await;
        results.sort_by_key(|(job, _)| job.id);

        let mut jobs = Vec::new();
        let mut job_failures = Vec::new();
        for (job, result) in results {
            match result {
                Ok(summary) => jobs.push(summary),
                Err(e) => {
                    tracing::warn!(project_id, pipeline_id, job_id = job.id, error = %e, "Job analysis failed");
                    job_failures.push(JobFailure {
                        job_id: job.id,
                        job_name: job.name.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        let parsed_job_ids: Vec<i64> = jobs.iter().map(|j| j.parsed_job_id).collect();
        let category_histogram = ErrorRecord::category_counts(&self.db.pool, &parsed_job_ids).await?;

        let mut parser_usage: BTreeMap<String, i64> = BTreeMap::new();
        for job in &jobs {
            for parser in &job.parsers_used {
                *parser_usage.entry(parser.clone()).or_default() += 1;
            }
        }

        let now = Utc::now();
        let summary = PipelineAnalysis {
            project_id: project_id.to_string(),
            pipeline_id,
            ref_name: pipeline.ref_name.clone(),
            sha: pipeline.sha.clone(),
            status: pipeline.status.clone(),
            source_branch: branch.source_branch,
            target_branch: branch.target_branch,
            merge_request_iid: branch.merge_request_iid,
            can_resolve_branch: branch.can_resolve_branch,
            ticket_ids: Json(branch.ticket_ids),
            failed_job_count: failed_jobs.len() as i64,
            analyzed_job_count: jobs.len() as i64,
            total_errors: jobs.iter().map(|j| j.error_count).sum(),
            total_warnings: jobs.iter().map(|j| j.warning_count).sum(),
            category_histogram: Json(category_histogram),
            parser_usage: Json(parser_usage),
            job_failures: Json(job_failures),
            parser_version: PARSER_VERSION,
            created_at: now,
            updated_at: now,
        };
        PipelineAnalysis::upsert(&self.db.pool, &summary).await?;

        tracing::info!(
            project_id,
            pipeline_id,
            analyzed = summary.analyzed_job_count,
            failed = summary.job_failures.0.len(),
            total_errors = summary.total_errors,
            "Pipeline analyzed"
        );

        Ok(PipelineReport {
            summary,
            jobs,
            resource_uri: format!("gl://pipeline/{}/{}", encode_project(project_id), pipeline_id),
        })
    }

    /// Source/target branch and tickets for the pipeline's ref.
    async fn resolve_branch(&self, project_id: &str, pipeline: &PipelineInfo) -> BranchContext {
        let Some(iid) = merge_request_iid(&pipeline.ref_name) else {
            return BranchContext {
                source_branch: Some(pipeline.ref_name.clone()),
                can_resolve_branch: true,
                ..Default::default()
            };
        };

        match self.gitlab.fetch_merge_request(project_id, iid).await {
            Ok(mr) => branch_context_from_mr(&mr),
            Err(e) => {
                tracing::warn!(project_id, iid, error = %e, "Could not resolve merge request branch");
                BranchContext {
                    merge_request_iid: Some(iid),
                    can_resolve_branch: false,
                    ..Default::default()
                }
            }
        }
    }
}

/// Project ids go into resource URIs percent-encoded.
pub fn encode_project(project_id: &str) -> String {
    urlencoding::encode(project_id).into_owned()
}

fn summary_from_row(row: &db::models::parsed_job::ParsedJob, cached: bool) -> JobAnalysisSummary {
    JobAnalysisSummary {
        project_id: row.project_id.clone(),
        job_id: row.job_id,
        pipeline_id: row.pipeline_id,
        job_name: row.job_name.clone(),
        job_stage: row.job_stage.clone(),
        job_status: row.job_status.clone(),
        parsed_job_id: row.id,
        framework: row.framework.clone(),
        parser_version: row.parser_version,
        trace_hash: row.trace_hash.clone(),
        error_count: row.error_count,
        warning_count: row.warning_count,
        parsers_used: row.parsers_used.0.clone(),
        hybrid: row.hybrid,
        duplicates_removed: row.duplicates_removed,
        cached,
        resource_uri: format!("gl://job/{}/{}", encode_project(&row.project_id), row.job_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_request_refs() {
        assert_eq!(merge_request_iid("refs/merge-requests/42/head"), Some(42));
        assert_eq!(merge_request_iid("refs/merge-requests/7/merge"), Some(7));
        assert_eq!(merge_request_iid("refs/merge-requests/9/train"), Some(9));
        assert_eq!(merge_request_iid("refs/merge-requests/9/other"), None);
        assert_eq!(merge_request_iid("main"), None);
        assert_eq!(merge_request_iid("feature/refs/merge-requests/1/head"), None);
    }

    #[test]
    fn test_ticket_extraction_dedups_in_order() {
        let tickets = extract_ticket_ids(["APP-12: fix login (see CORE-7)", "Also APP-12 and OPS2-3"]);
        assert_eq!(tickets, vec!["APP-12", "CORE-7", "OPS2-3"]);
    }

    #[test]
    fn test_ticket_extraction_rejects_bad_keys() {
        let tickets = extract_ticket_ids([
            "lowercase app-1, single letter A-1, too long ABCDEFGHIJK-1, embedded xAPP-3",
        ]);
        assert!(tickets.is_empty());
    }

    #[test]
    fn test_mr_context_reads_title_then_description() {
        let mr = MergeRequestInfo {
            iid: 3,
            title: "DEV-2 tidy".to_string(),
            description: Some("Closes DEV-1 and DEV-2".to_string()),
            source_branch: "feature/dev-2".to_string(),
            target_branch: "main".to_string(),
        };
        let ctx = branch_context_from_mr(&mr);
        assert_eq!(ctx.ticket_ids, vec!["DEV-2", "DEV-1"]);
        assert_eq!(ctx.source_branch.as_deref(), Some("feature/dev-2"));
        assert!(ctx.can_resolve_branch);
    }
}
