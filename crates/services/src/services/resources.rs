//! `gl://` resource URIs served from the analysis cache.
//!
//! Resolution never talks to GitLab and never triggers analysis: a job or
//! pipeline that is not in the cache resolves to a `not_analyzed` payload.
//!
//! ```text
//! gl://pipeline/{project}/{pipeline}
//! gl://jobs/{project}/pipeline/{pipeline}[/{status}]
//! gl://job/{project}/[{pipeline}/]{job}
//! gl://files/{project}/{job}          gl://files/{project}/pipeline/{pipeline}
//! gl://file/{project}/{job}/{path...}
//! gl://error/{project}/{job}/{ordinal}
//! gl://errors/{project}/{job}         gl://errors/{project}/pipeline/{pipeline}
//! gl://analysis/{project}/pipeline/{pipeline}   gl://analysis/{project}/job/{job}
//! ```
//!
//! Every URI accepts `?mode=minimal|balanced|fixing|detailed`; listings accept
//! `page` (1-based) and `limit` (default 20, max 100).

use analyzers::{normalize, strip_ci_section_markers};
use db::{
    CacheError, DBService,
    models::{
        Page,
        error_record::ErrorRecord,
        file_index::{FileErrorCount, FileIndex},
        job_trace::JobTrace,
        parsed_job::ParsedJob,
        pipeline_analysis::PipelineAnalysis,
    },
};
use serde::Serialize;
use serde_json::{Map, Value, json};
use strum_macros::{Display, EnumString};
use thiserror::Error;

use super::analysis::encode_project;

pub const SCHEME: &str = "gl://";
pub const DEFAULT_LIMIT: u32 = 20;
pub const MAX_LIMIT: u32 = 100;
const FIXING_TRACEBACK_FRAMES: usize = 10;
const DETAILED_TRACE_LINES: usize = 50;
const MINIMAL_MESSAGE_CHARS: usize = 200;

#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error("malformed resource URI {uri:?}: {reason}")]
    Malformed { uri: String, reason: String },
    #[error("unknown resource kind {0:?}")]
    UnknownKind(String),
    #[error("invalid value {value:?} for parameter {name}")]
    BadParameter { name: &'static str, value: String },
    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl From<sqlx::Error> for ResolutionError {
    fn from(e: sqlx::Error) -> Self {
        Self::Cache(CacheError::from(e))
    }
}

/// Verbosity of a resolved resource, least to most.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, EnumString, Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ResponseMode {
    /// Id, level, category, truncated message, file and line.
    Minimal,
    /// Adds exception type, test name, rule, fingerprint and parser.
    #[default]
    Balanced,
    /// Adds context snippet and the first traceback frames.
    Fixing,
    /// Everything, plus the tail of the trace on job detail.
    Detailed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceKind {
    Pipeline { pipeline_id: i64 },
    Jobs { pipeline_id: i64, status: Option<String> },
    Job { pipeline_id: Option<i64>, job_id: i64 },
    JobFiles { job_id: i64 },
    PipelineFiles { pipeline_id: i64 },
    File { job_id: i64, file_path: String },
    Error { job_id: i64, ordinal: i64 },
    JobErrors { job_id: i64 },
    PipelineErrors { pipeline_id: i64 },
    PipelineAnalysis { pipeline_id: i64 },
    JobAnalysis { job_id: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceUri {
    pub project_id: String,
    pub kind: ResourceKind,
    pub mode: ResponseMode,
    pub page: u32,
    pub limit: u32,
}

fn malformed(uri: &str, reason: impl Into<String>) -> ResolutionError {
    ResolutionError::Malformed {
        uri: uri.to_string(),
        reason: reason.into(),
    }
}

fn decode(uri: &str, segment: &str) -> Result<String, ResolutionError> {
    urlencoding::decode(segment)
        .map(|s| s.into_owned())
        .map_err(|_| malformed(uri, format!("invalid percent-encoding in {segment:?}")))
}

fn parse_id(name: &'static str, value: &str) -> Result<i64, ResolutionError> {
    value
        .parse::<i64>()
        .ok()
        .filter(|id| *id >= 0)
        .ok_or_else(|| ResolutionError::BadParameter {
            name,
            value: value.to_string(),
        })
}

impl ResourceUri {
    pub fn parse(uri: &str) -> Result<Self, ResolutionError> {
        let rest = uri
            .trim()
            .strip_prefix(SCHEME)
            .ok_or_else(|| malformed(uri, "expected gl:// scheme"))?;
        let (path, query) = match rest.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (rest, None),
        };

        let segments: Vec<&str> = path.trim_end_matches('/').split('/').collect();
        if segments.len() < 2 || segments.iter().any(|s| s.is_empty()) {
            return Err(malformed(uri, "expected gl://{kind}/{project}/..."));
        }
        let project_id = decode(uri, segments[1])?;
        let tail = &segments[2..];

        let kind = match (segments[0], tail) {
            ("pipeline", [pipeline]) => ResourceKind::Pipeline {
                pipeline_id: parse_id("pipeline", pipeline)?,
            },
            ("jobs", ["pipeline", pipeline]) => ResourceKind::Jobs {
                pipeline_id: parse_id("pipeline", pipeline)?,
                status: None,
            },
            ("jobs", ["pipeline", pipeline, status]) => ResourceKind::Jobs {
                pipeline_id: parse_id("pipeline", pipeline)?,
                status: Some(decode(uri, status)?),
            },
            ("job", [job]) => ResourceKind::Job {
                pipeline_id: None,
                job_id: parse_id("job", job)?,
            },
            ("job", [pipeline, job]) => ResourceKind::Job {
                pipeline_id: Some(parse_id("pipeline", pipeline)?),
                job_id: parse_id("job", job)?,
            },
            ("files", ["pipeline", pipeline]) => ResourceKind::PipelineFiles {
                pipeline_id: parse_id("pipeline", pipeline)?,
            },
            ("files", [job]) => ResourceKind::JobFiles {
                job_id: parse_id("job", job)?,
            },
            ("file", [job, path @ ..]) if !path.is_empty() => ResourceKind::File {
                job_id: parse_id("job", job)?,
                file_path: path
                    .iter()
                    .map(|segment| decode(uri, segment))
                    .collect::<Result<Vec<_>, _>>()?
                    .join("/"),
            },
            ("error", [job, ordinal]) => ResourceKind::Error {
                job_id: parse_id("job", job)?,
                ordinal: parse_id("error", ordinal)?,
            },
            ("errors", ["pipeline", pipeline]) => ResourceKind::PipelineErrors {
                pipeline_id: parse_id("pipeline", pipeline)?,
            },
            ("errors", [job]) => ResourceKind::JobErrors {
                job_id: parse_id("job", job)?,
            },
            ("analysis", ["pipeline", pipeline]) => ResourceKind::PipelineAnalysis {
                pipeline_id: parse_id("pipeline", pipeline)?,
            },
            ("analysis", ["job", job]) => ResourceKind::JobAnalysis {
                job_id: parse_id("job", job)?,
            },
            ("pipeline" | "jobs" | "job" | "files" | "file" | "error" | "errors" | "analysis", _) => {
                return Err(malformed(uri, format!("unexpected path for {:?}", segments[0])));
            }
            (other, _) => return Err(ResolutionError::UnknownKind(other.to_string())),
        };

        let mut parsed = ResourceUri {
            project_id,
            kind,
            mode: ResponseMode::default(),
            page: 1,
            limit: DEFAULT_LIMIT,
        };
        if let Some(query) = query {
            parsed.apply_query(uri, query)?;
        }
        Ok(parsed)
    }

    fn apply_query(&mut self, uri: &str, query: &str) -> Result<(), ResolutionError> {
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, raw_value) = pair.split_once('=').unwrap_or((pair, ""));
            let value = decode(uri, raw_value)?;
            match key {
                "mode" => {
                    self.mode = value.parse().map_err(|_| ResolutionError::BadParameter {
                        name: "mode",
                        value: value.clone(),
                    })?;
                }
                "page" => {
                    self.page = value
                        .parse::<u32>()
                        .ok()
                        .filter(|p| *p >= 1)
                        .ok_or(ResolutionError::BadParameter {
                            name: "page",
                            value: value.clone(),
                        })?;
                }
                "limit" => {
                    let limit = value
                        .parse::<u32>()
                        .ok()
                        .filter(|l| *l >= 1)
                        .ok_or(ResolutionError::BadParameter {
                            name: "limit",
                            value: value.clone(),
                        })?;
                    self.limit = limit.min(MAX_LIMIT);
                }
                "status" => {
                    if let ResourceKind::Jobs { status, .. } = &mut self.kind
                        && status.is_none()
                        && !value.is_empty()
                    {
                        *status = Some(value);
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn db_page(&self) -> Page {
        let limit = i64::from(self.limit);
        Page::new(limit, (i64::from(self.page) - 1) * limit)
    }

    fn pagination(&self, total: i64) -> Pagination {
        Pagination {
            total,
            page: self.page,
            limit: self.limit,
            has_more: i64::from(self.page) * i64::from(self.limit) < total,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub total: i64,
    pub page: u32,
    pub limit: u32,
    pub has_more: bool,
}

/// Static description of a URI family, for resource template listings.
#[derive(Debug, Clone, Copy)]
pub struct ResourceTemplate {
    pub uri_template: &'static str,
    pub name: &'static str,
    pub description: &'static str,
}

pub const RESOURCE_TEMPLATES: &[ResourceTemplate] = &[
    ResourceTemplate {
        uri_template: "gl://pipeline/{project_id}/{pipeline_id}",
        name: "pipeline",
        description: "Pipeline overview with analyzed failed jobs",
    },
    ResourceTemplate {
        uri_template: "gl://jobs/{project_id}/pipeline/{pipeline_id}/{status}",
        name: "pipeline-jobs",
        description: "Analyzed jobs of a pipeline, optionally filtered by status",
    },
    ResourceTemplate {
        uri_template: "gl://job/{project_id}/{pipeline_id}/{job_id}",
        name: "job",
        description: "Job detail with its errors",
    },
    ResourceTemplate {
        uri_template: "gl://files/{project_id}/{job_id}",
        name: "job-files",
        description: "Files with errors in a job",
    },
    ResourceTemplate {
        uri_template: "gl://files/{project_id}/pipeline/{pipeline_id}",
        name: "pipeline-files",
        description: "Files with errors across a pipeline",
    },
    ResourceTemplate {
        uri_template: "gl://file/{project_id}/{job_id}/{file_path}",
        name: "file-errors",
        description: "Errors attributed to one file",
    },
    ResourceTemplate {
        uri_template: "gl://error/{project_id}/{job_id}/{error_id}",
        name: "error",
        description: "Single error detail",
    },
    ResourceTemplate {
        uri_template: "gl://errors/{project_id}/{job_id}",
        name: "job-errors",
        description: "All errors of a job",
    },
    ResourceTemplate {
        uri_template: "gl://errors/{project_id}/pipeline/{pipeline_id}",
        name: "pipeline-errors",
        description: "All errors across a pipeline",
    },
    ResourceTemplate {
        uri_template: "gl://analysis/{project_id}/pipeline/{pipeline_id}",
        name: "pipeline-analysis",
        description: "Pipeline analysis summary",
    },
    ResourceTemplate {
        uri_template: "gl://analysis/{project_id}/job/{job_id}",
        name: "job-analysis",
        description: "Job analysis summary",
    },
];

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

fn render_error(project: &str, record: &ErrorRecord, mode: ResponseMode) -> Value {
    let mut obj = Map::new();
    obj.insert("id".into(), json!(record.ordinal));
    obj.insert("level".into(), json!(record.level));
    obj.insert("category".into(), json!(record.category));
    let message = if mode == ResponseMode::Minimal {
        truncate_chars(&record.message, MINIMAL_MESSAGE_CHARS)
    } else {
        record.message.clone()
    };
    obj.insert("message".into(), json!(message));
    obj.insert("file_path".into(), json!(record.file_path));
    obj.insert("line_number".into(), json!(record.line_number));

    if mode >= ResponseMode::Balanced {
        obj.insert("column".into(), json!(record.column_number));
        obj.insert("exception_type".into(), json!(record.exception_type));
        obj.insert("test_name".into(), json!(record.test_name));
        obj.insert("rule".into(), json!(record.rule));
        obj.insert("fingerprint".into(), json!(record.fingerprint));
        obj.insert("source_parser".into(), json!(record.source_parser));
    }

    if mode >= ResponseMode::Fixing {
        obj.insert("context_snippet".into(), json!(record.context_snippet));
        let frames = &record.traceback.0;
        let frames = if mode == ResponseMode::Detailed {
            &frames[..]
        } else {
            &frames[..frames.len().min(FIXING_TRACEBACK_FRAMES)]
        };
        obj.insert("traceback".into(), json!(frames));
    }

    if mode == ResponseMode::Detailed {
        obj.insert("job_id".into(), json!(record.job_id));
        obj.insert(
            "resource_uri".into(),
            json!(format!(
                "gl://error/{}/{}/{}",
                encode_project(project),
                record.job_id,
                record.ordinal
            )),
        );
    }

    Value::Object(obj)
}

fn render_job(job: &ParsedJob, mode: ResponseMode) -> Value {
    let mut obj = Map::new();
    obj.insert("job_id".into(), json!(job.job_id));
    obj.insert("job_name".into(), json!(job.job_name));
    obj.insert("job_stage".into(), json!(job.job_stage));
    obj.insert("status".into(), json!(job.job_status));
    obj.insert("error_count".into(), json!(job.error_count));
    obj.insert("warning_count".into(), json!(job.warning_count));
    obj.insert(
        "resource_uri".into(),
        json!(format!("gl://job/{}/{}", encode_project(&job.project_id), job.job_id)),
    );

    if mode >= ResponseMode::Balanced {
        obj.insert("pipeline_id".into(), json!(job.pipeline_id));
        obj.insert("framework".into(), json!(job.framework));
        obj.insert("parser_version".into(), json!(job.parser_version));
    }
    if mode >= ResponseMode::Fixing {
        obj.insert("parsers_used".into(), json!(job.parsers_used.0));
        obj.insert("hybrid".into(), json!(job.hybrid));
        obj.insert("duplicates_removed".into(), json!(job.duplicates_removed));
    }
    if mode == ResponseMode::Detailed {
        obj.insert("ref".into(), json!(job.ref_name));
        obj.insert("trace_hash".into(), json!(job.trace_hash));
        obj.insert("analyzed_at".into(), json!(job.created_at));
    }

    Value::Object(obj)
}

fn render_files(project: &str, job_id: Option<i64>, files: &[FileErrorCount]) -> Vec<Value> {
    files
        .iter()
        .map(|f| {
            let mut obj = json!({
                "file_path": f.file_path,
                "error_count": f.error_count,
            });
            if let (Some(job_id), Some(map)) = (job_id, obj.as_object_mut()) {
                map.insert(
                    "resource_uri".into(),
                    json!(format!(
                        "gl://file/{}/{}/{}",
                        encode_project(project),
                        job_id,
                        encode_file_path(&f.file_path)
                    )),
                );
            }
            obj
        })
        .collect()
}

/// Path segments stay readable. A path that would leave an empty segment
/// (absolute, trailing slash, `//`) is encoded as a single segment instead.
fn encode_file_path(path: &str) -> String {
    if path.split('/').any(str::is_empty) {
        return urlencoding::encode(path).into_owned();
    }
    path.split('/')
        .map(|s| urlencoding::encode(s).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Last `n` non-empty lines of the normalized trace.
fn trace_tail(raw: &str, n: usize) -> Vec<String> {
    let normalized = normalize(raw);
    let lines: Vec<&str> = strip_ci_section_markers(&normalized.cleaned_text)
        .into_iter()
        .filter(|line| !line.trim().is_empty())
        .collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].iter().map(|l| l.to_string()).collect()
}

fn not_analyzed(uri: &str, what: String) -> Value {
    json!({
        "status": "not_analyzed",
        "resource_uri": uri,
        "message": format!("{what} has not been analyzed yet. Run analyze_job or analyze_pipeline first."),
    })
}

/// Serves resource URIs from a [`DBService`].
#[derive(Clone)]
pub struct ResourceResolver {
    db: DBService,
}

impl ResourceResolver {
    pub fn new(db: DBService) -> Self {
        Self { db }
    }

    pub async fn resolve(&self, uri: &str) -> Result<Value, ResolutionError> {
        let parsed = ResourceUri::parse(uri)?;
        tracing::debug!(uri, mode = %parsed.mode, "Resolving resource");
        self.resolve_parsed(uri, &parsed).await
    }

    pub async fn resolve_parsed(&self, uri: &str, res: &ResourceUri) -> Result<Value, ResolutionError> {
        let project = res.project_id.as_str();
        match &res.kind {
            ResourceKind::Pipeline { pipeline_id } => self.pipeline_overview(uri, res, *pipeline_id).await,
            ResourceKind::Jobs { pipeline_id, status } => {
                self.pipeline_jobs(uri, res, *pipeline_id, status.as_deref()).await
            }
            ResourceKind::Job { pipeline_id, job_id } => {
                self.job_detail(uri, res, *pipeline_id, *job_id).await
            }
            ResourceKind::JobFiles { job_id } => {
                let Some(job) = self.latest_job(project, *job_id).await? else {
                    return Ok(not_analyzed(uri, format!("Job {job_id}")));
                };
                let total = FileIndex::count_files_for_job(&self.db.pool, job.id).await?;
                let files = FileIndex::files_for_job(&self.db.pool, job.id, res.db_page()).await?;
                Ok(json!({
                    "resource_uri": uri,
                    "mode": res.mode,
                    "job_id": job_id,
                    "files": render_files(project, Some(*job_id), &files),
                    "pagination": res.pagination(total),
                }))
            }
            ResourceKind::PipelineFiles { pipeline_id } => {
                let ids = self.pipeline_snapshot_ids(project, *pipeline_id).await?;
                if ids.is_empty() {
                    return Ok(not_analyzed(uri, format!("Pipeline {pipeline_id}")));
                }
                let total = FileIndex::count_files_for_jobs(&self.db.pool, &ids).await?;
                let files = FileIndex::files_for_jobs(&self.db.pool, &ids, res.db_page()).await?;
                Ok(json!({
                    "resource_uri": uri,
                    "mode": res.mode,
                    "pipeline_id": pipeline_id,
                    "files": render_files(project, None, &files),
                    "pagination": res.pagination(total),
                }))
            }
            ResourceKind::File { job_id, file_path } => {
                let Some(job) = self.latest_job(project, *job_id).await? else {
                    return Ok(not_analyzed(uri, format!("Job {job_id}")));
                };
                let total = ErrorRecord::count_for_file(&self.db.pool, job.id, file_path).await?;
                let records =
                    ErrorRecord::list_for_file(&self.db.pool, job.id, file_path, res.db_page()).await?;
                Ok(json!({
                    "resource_uri": uri,
                    "mode": res.mode,
                    "job_id": job_id,
                    "file_path": file_path,
                    "errors": records.iter().map(|r| render_error(project, r, res.mode)).collect::<Vec<_>>(),
                    "pagination": res.pagination(total),
                }))
            }
            ResourceKind::Error { job_id, ordinal } => {
                let Some(job) = self.latest_job(project, *job_id).await? else {
                    return Ok(not_analyzed(uri, format!("Job {job_id}")));
                };
                match ErrorRecord::find_by_ordinal(&self.db.pool, job.id, *ordinal).await? {
                    Some(record) => Ok(json!({
                        "resource_uri": uri,
                        "mode": res.mode,
                        "job": render_job(&job, ResponseMode::Minimal),
                        "error": render_error(project, &record, res.mode),
                    })),
                    None => Ok(json!({
                        "status": "not_found",
                        "resource_uri": uri,
                        "message": format!("Job {job_id} has {} errors; no error with id {ordinal}", job.error_count + job.warning_count),
                    })),
                }
            }
            ResourceKind::JobErrors { job_id } => {
                let Some(job) = self.latest_job(project, *job_id).await? else {
                    return Ok(not_analyzed(uri, format!("Job {job_id}")));
                };
                let total = ErrorRecord::count_for_job(&self.db.pool, job.id).await?;
                let records = ErrorRecord::list_for_job(&self.db.pool, job.id, res.db_page()).await?;
                Ok(json!({
                    "resource_uri": uri,
                    "mode": res.mode,
                    "job": render_job(&job, ResponseMode::Minimal),
                    "errors": records.iter().map(|r| render_error(project, r, res.mode)).collect::<Vec<_>>(),
                    "pagination": res.pagination(total),
                }))
            }
            ResourceKind::PipelineErrors { pipeline_id } => {
                let ids = self.pipeline_snapshot_ids(project, *pipeline_id).await?;
                if ids.is_empty() {
                    return Ok(not_analyzed(uri, format!("Pipeline {pipeline_id}")));
                }
                let total = ErrorRecord::count_for_jobs(&self.db.pool, &ids).await?;
                let records = ErrorRecord::list_for_jobs(&self.db.pool, &ids, res.db_page()).await?;
                Ok(json!({
                    "resource_uri": uri,
                    "mode": res.mode,
                    "pipeline_id": pipeline_id,
                    "errors": records.iter().map(|r| render_error(project, r, res.mode)).collect::<Vec<_>>(),
                    "pagination": res.pagination(total),
                }))
            }
            ResourceKind::PipelineAnalysis { pipeline_id } => {
                match PipelineAnalysis::find(&self.db.pool, project, *pipeline_id).await? {
                    Some(summary) => Ok(json!({
                        "resource_uri": uri,
                        "mode": res.mode,
                        "analysis": summary,
                    })),
                    None => Ok(not_analyzed(uri, format!("Pipeline {pipeline_id}"))),
                }
            }
            ResourceKind::JobAnalysis { job_id } => {
                let Some(job) = self.latest_job(project, *job_id).await? else {
                    return Ok(not_analyzed(uri, format!("Job {job_id}")));
                };
                let categories = ErrorRecord::category_counts(&self.db.pool, &[job.id]).await?;
                Ok(json!({
                    "resource_uri": uri,
                    "mode": res.mode,
                    "job": render_job(&job, ResponseMode::Detailed),
                    "category_histogram": categories,
                }))
            }
        }
    }

    async fn latest_job(&self, project: &str, job_id: i64) -> Result<Option<ParsedJob>, ResolutionError> {
        Ok(ParsedJob::find_latest(&self.db.pool, project, job_id).await?)
    }

    async fn pipeline_snapshot_ids(&self, project: &str, pipeline_id: i64) -> Result<Vec<i64>, ResolutionError> {
        let jobs = ParsedJob::list_latest_for_pipeline(&self.db.pool, project, pipeline_id, None).await?;
        Ok(jobs.into_iter().map(|j| j.id).collect())
    }

    async fn pipeline_overview(&self, uri: &str, res: &ResourceUri, pipeline_id: i64) -> Result<Value, ResolutionError> {
        let project = res.project_id.as_str();
        let summary = PipelineAnalysis::find(&self.db.pool, project, pipeline_id).await?;
        let jobs = ParsedJob::list_latest_for_pipeline(&self.db.pool, project, pipeline_id, None).await?;
        if summary.is_none() && jobs.is_empty() {
            return Ok(not_analyzed(uri, format!("Pipeline {pipeline_id}")));
        }

        let mut obj = Map::new();
        obj.insert("resource_uri".into(), json!(uri));
        obj.insert("mode".into(), json!(res.mode));
        obj.insert("pipeline_id".into(), json!(pipeline_id));
        if let Some(summary) = &summary {
            obj.insert("ref".into(), json!(summary.ref_name));
            obj.insert("status".into(), json!(summary.status));
            obj.insert("source_branch".into(), json!(summary.source_branch));
            obj.insert("target_branch".into(), json!(summary.target_branch));
            obj.insert("can_resolve_branch".into(), json!(summary.can_resolve_branch));
            obj.insert("failed_job_count".into(), json!(summary.failed_job_count));
            obj.insert("total_errors".into(), json!(summary.total_errors));
            obj.insert("total_warnings".into(), json!(summary.total_warnings));
            if res.mode >= ResponseMode::Balanced {
                obj.insert("category_histogram".into(), json!(summary.category_histogram));
                obj.insert("ticket_ids".into(), json!(summary.ticket_ids));
            }
            if res.mode >= ResponseMode::Fixing {
                obj.insert("parser_usage".into(), json!(summary.parser_usage));
                obj.insert("job_failures".into(), json!(summary.job_failures));
            }
            if res.mode == ResponseMode::Detailed {
                obj.insert("sha".into(), json!(summary.sha));
                obj.insert("merge_request_iid".into(), json!(summary.merge_request_iid));
                obj.insert("analyzed_at".into(), json!(summary.updated_at));
            }
        }
        if res.mode >= ResponseMode::Balanced {
            let rendered: Vec<Value> = jobs.iter().map(|j| render_job(j, ResponseMode::Minimal)).collect();
            obj.insert("jobs".into(), json!(rendered));
        }
        obj.insert(
            "links".into(),
            json!({
                "jobs": format!("gl://jobs/{}/pipeline/{}", encode_project(project), pipeline_id),
                "errors": format!("gl://errors/{}/pipeline/{}", encode_project(project), pipeline_id),
                "files": format!("gl://files/{}/pipeline/{}", encode_project(project), pipeline_id),
            }),
        );
        Ok(Value::Object(obj))
    }

    async fn pipeline_jobs(
        &self,
        uri: &str,
        res: &ResourceUri,
        pipeline_id: i64,
        status: Option<&str>,
    ) -> Result<Value, ResolutionError> {
        let project = res.project_id.as_str();
        let all = ParsedJob::list_latest_for_pipeline(&self.db.pool, project, pipeline_id, None).await?;
        if all.is_empty() {
            return Ok(not_analyzed(uri, format!("Pipeline {pipeline_id}")));
        }

        let matching: Vec<&ParsedJob> = all
            .iter()
            .filter(|j| status.is_none_or(|s| j.job_status.eq_ignore_ascii_case(s)))
            .collect();
        let total = matching.len() as i64;
        let page = res.db_page();
        let rendered: Vec<Value> = matching
            .into_iter()
            .skip(page.offset as usize)
            .take(page.limit as usize)
            .map(|j| render_job(j, res.mode))
            .collect();

        Ok(json!({
            "resource_uri": uri,
            "mode": res.mode,
            "pipeline_id": pipeline_id,
            "status_filter": status,
            "jobs": rendered,
            "pagination": res.pagination(total),
        }))
    }

    async fn job_detail(
        &self,
        uri: &str,
        res: &ResourceUri,
        pipeline_id: Option<i64>,
        job_id: i64,
    ) -> Result<Value, ResolutionError> {
        let project = res.project_id.as_str();
        let job = match self.latest_job(project, job_id).await? {
            Some(job) if pipeline_id.is_none() || job.pipeline_id == pipeline_id => job,
            _ => return Ok(not_analyzed(uri, format!("Job {job_id}"))),
        };

        let total = ErrorRecord::count_for_job(&self.db.pool, job.id).await?;
        let records = ErrorRecord::list_for_job(&self.db.pool, job.id, res.db_page()).await?;

        let mut obj = Map::new();
        obj.insert("resource_uri".into(), json!(uri));
        obj.insert("mode".into(), json!(res.mode));
        obj.insert("job".into(), render_job(&job, res.mode));
        obj.insert(
            "errors".into(),
            json!(records.iter().map(|r| render_error(project, r, res.mode)).collect::<Vec<_>>()),
        );
        obj.insert("pagination".into(), json!(res.pagination(total)));

        if res.mode >= ResponseMode::Balanced {
            let files = FileIndex::files_for_job(&self.db.pool, job.id, Page::new(i64::from(DEFAULT_LIMIT), 0)).await?;
            obj.insert("files".into(), json!(render_files(project, Some(job_id), &files)));
        }

        if res.mode == ResponseMode::Detailed
            && let Some(trace) = JobTrace::find(&self.db.pool, project, job_id, &job.trace_hash).await?
        {
            obj.insert("trace_tail".into(), json!(trace_tail(&trace.text()?, DETAILED_TRACE_LINES)));
        }

        Ok(Value::Object(obj))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_job_forms() {
        let short = ResourceUri::parse("gl://job/123/456").unwrap();
        assert_eq!(short.project_id, "123");
        assert_eq!(short.kind, ResourceKind::Job { pipeline_id: None, job_id: 456 });
        assert_eq!(short.mode, ResponseMode::Balanced);
        assert_eq!((short.page, short.limit), (1, DEFAULT_LIMIT));

        let long = ResourceUri::parse("gl://job/group%2Fapp/9/456?mode=fixing").unwrap();
        assert_eq!(long.project_id, "group/app");
        assert_eq!(long.kind, ResourceKind::Job { pipeline_id: Some(9), job_id: 456 });
        assert_eq!(long.mode, ResponseMode::Fixing);
    }

    #[test]
    fn test_parse_file_path_keeps_slashes() {
        let uri = ResourceUri::parse("gl://file/1/2/src/app/main%20file.py?page=2&limit=10").unwrap();
        assert_eq!(
            uri.kind,
            ResourceKind::File { job_id: 2, file_path: "src/app/main file.py".to_string() }
        );
        assert_eq!((uri.page, uri.limit), (2, 10));
        assert_eq!(uri.db_page(), Page::new(10, 10));
    }

    #[test]
    fn test_parse_pipeline_scoped_kinds() {
        assert_eq!(
            ResourceUri::parse("gl://jobs/1/pipeline/5/failed").unwrap().kind,
            ResourceKind::Jobs { pipeline_id: 5, status: Some("failed".into()) }
        );
        assert_eq!(
            ResourceUri::parse("gl://jobs/1/pipeline/5?status=success").unwrap().kind,
            ResourceKind::Jobs { pipeline_id: 5, status: Some("success".into()) }
        );
        assert_eq!(
            ResourceUri::parse("gl://errors/1/pipeline/5").unwrap().kind,
            ResourceKind::PipelineErrors { pipeline_id: 5 }
        );
        assert_eq!(
            ResourceUri::parse("gl://files/1/pipeline/5").unwrap().kind,
            ResourceKind::PipelineFiles { pipeline_id: 5 }
        );
        assert_eq!(
            ResourceUri::parse("gl://analysis/1/job/8").unwrap().kind,
            ResourceKind::JobAnalysis { job_id: 8 }
        );
    }

    #[test]
    fn test_limit_is_capped() {
        assert_eq!(ResourceUri::parse("gl://errors/1/2?limit=500").unwrap().limit, MAX_LIMIT);
    }

    #[test]
    fn test_malformed_uris() {
        assert!(matches!(
            ResourceUri::parse("http://job/1/2"),
            Err(ResolutionError::Malformed { .. })
        ));
        assert!(matches!(
            ResourceUri::parse("gl://job/1"),
            Err(ResolutionError::Malformed { .. })
        ));
        assert!(matches!(
            ResourceUri::parse("gl://widgets/1/2"),
            Err(ResolutionError::UnknownKind(kind)) if kind == "widgets"
        ));
        assert!(matches!(
            ResourceUri::parse("gl://job/1/abc"),
            Err(ResolutionError::BadParameter { name: "job", .. })
        ));
        assert!(matches!(
            ResourceUri::parse("gl://errors/1/2?mode=verbose"),
            Err(ResolutionError::BadParameter { name: "mode", .. })
        ));
        assert!(matches!(
            ResourceUri::parse("gl://errors/1/2?page=0"),
            Err(ResolutionError::BadParameter { name: "page", .. })
        ));
    }

    #[test]
    fn test_file_links_parse_back() {
        for path in ["src/app/main file.py", "/builds/app/src/a.js", "a//b.rs"] {
            let files = [FileErrorCount { file_path: path.to_string(), error_count: 1 }];
            let rendered = render_files("group/app", Some(5), &files);
            let link = rendered[0]["resource_uri"].as_str().unwrap();
            assert_eq!(
                ResourceUri::parse(link).unwrap().kind,
                ResourceKind::File { job_id: 5, file_path: path.to_string() },
                "{link}"
            );
        }
    }

    #[test]
    fn test_pagination_has_more() {
        let uri = ResourceUri::parse("gl://errors/1/2?page=2&limit=10").unwrap();
        assert!(uri.pagination(25).has_more);
        assert!(!uri.pagination(20).has_more);
    }

    #[test]
    fn test_truncate_is_char_safe() {
        assert_eq!(truncate_chars("héllo", 2), "hé...");
        assert_eq!(truncate_chars("short", 10), "short");
    }

    #[test]
    fn test_trace_tail_drops_section_markers() {
        let raw = "\x1b[0Ksection_start:1:step\r\x1b[0Kstep\nline a\n\nline b\nsection_end:1:step\r\x1b[0K\n";
        assert_eq!(trace_tail(raw, 2), vec!["line a", "line b"]);
    }
}
