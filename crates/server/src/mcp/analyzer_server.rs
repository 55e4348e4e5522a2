use std::future::Future;

use analyzers::PARSER_VERSION;
use chrono::Utc;
use db::{
    CleanupReport, CleanupSchedulerConfig, DBService, MAX_AGE_HOURS_CAP, cleanup_expired,
    cleanup_superseded, cutoff_for_age, health_check,
};
use rmcp::{
    ErrorData, RoleServer, ServerHandler,
    handler::server::tool::{Parameters, ToolRouter},
    model::{
        AnnotateAble, CallToolResult, Content, Implementation, ListResourceTemplatesResult,
        PaginatedRequestParam, ProtocolVersion, RawResourceTemplate, ReadResourceRequestParam,
        ReadResourceResult, ResourceContents, ServerCapabilities, ServerInfo,
    },
    schemars,
    service::RequestContext,
    tool, tool_handler, tool_router,
};
use serde::{Deserialize, Serialize};
use services::services::{
    analysis::{AnalysisError, AnalysisService},
    resources::{RESOURCE_TEMPLATES, ResolutionError, ResourceResolver},
};

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct AnalyzePipelineRequest {
    #[schemars(description = "GitLab project id or full path, e.g. 123 or group/app")]
    pub project_id: String,
    #[schemars(description = "Pipeline id")]
    pub pipeline_id: i64,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct AnalyzeJobRequest {
    #[schemars(description = "GitLab project id or full path, e.g. 123 or group/app")]
    pub project_id: String,
    #[schemars(description = "Job id")]
    pub job_id: i64,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct GetResourceRequest {
    #[schemars(
        description = "Resource URI, e.g. gl://job/123/456?mode=fixing or gl://errors/123/pipeline/789?page=2&limit=10"
    )]
    pub uri: String,
}

#[derive(Debug, Default, Deserialize, schemars::JsonSchema)]
pub struct CleanupCacheRequest {
    #[schemars(description = "Delete analyses older than this many hours (default: MCP_AUTO_CLEANUP_MAX_AGE_HOURS)")]
    pub max_age_hours: Option<u64>,
    #[schemars(description = "Also delete snapshots from older parser versions (default: true)")]
    pub include_superseded: Option<bool>,
}

#[derive(Debug, Serialize)]
struct CleanupResponse {
    max_age_hours: u64,
    expired: CleanupReport,
    superseded: Option<CleanupReport>,
}

#[derive(Clone)]
pub struct AnalyzerServer {
    analysis: AnalysisService,
    resolver: ResourceResolver,
    cleanup: CleanupSchedulerConfig,
    tool_router: ToolRouter<AnalyzerServer>,
}

impl AnalyzerServer {
    pub fn new(analysis: AnalysisService, cleanup: CleanupSchedulerConfig) -> Self {
        let resolver = ResourceResolver::new(analysis.db().clone());
        Self {
            analysis,
            resolver,
            cleanup,
            tool_router: Self::tool_router(),
        }
    }

    fn db(&self) -> &DBService {
        self.analysis.db()
    }

    fn success<T: Serialize>(data: &T) -> Result<CallToolResult, ErrorData> {
        Ok(CallToolResult::success(vec![Content::text(
            serde_json::to_string_pretty(data)
                .unwrap_or_else(|_| "Failed to serialize response".to_string()),
        )]))
    }

    fn err(msg: impl Into<String>, details: Option<String>) -> Result<CallToolResult, ErrorData> {
        let mut v = serde_json::json!({"success": false, "error": msg.into()});
        if let Some(d) = details {
            v["details"] = serde_json::json!(d);
        }
        Ok(CallToolResult::error(vec![Content::text(
            serde_json::to_string_pretty(&v)
                .unwrap_or_else(|_| "Failed to serialize error".to_string()),
        )]))
    }

    fn analysis_err(context: &str, e: AnalysisError) -> Result<CallToolResult, ErrorData> {
        tracing::warn!(error = %e, "{context}");
        Self::err(context, Some(e.to_string()))
    }
}

#[tool_router]
impl AnalyzerServer {
    #[tool(
        description = "Analyze every failed job of a GitLab pipeline. Results are cached; the response links gl:// resources for drill-down."
    )]
    async fn analyze_pipeline(
        &self,
        Parameters(AnalyzePipelineRequest {
            project_id,
            pipeline_id,
        }): Parameters<AnalyzePipelineRequest>,
    ) -> Result<CallToolResult, ErrorData> {
        match self.analysis.analyze_pipeline(&project_id, pipeline_id).await {
            Ok(report) => Self::success(&report),
            Err(e) => Self::analysis_err("Failed to analyze pipeline", e),
        }
    }

    #[tool(description = "Analyze a single GitLab job and cache its errors.")]
    async fn analyze_job(
        &self,
        Parameters(AnalyzeJobRequest { project_id, job_id }): Parameters<AnalyzeJobRequest>,
    ) -> Result<CallToolResult, ErrorData> {
        match self.analysis.analyze_job(&project_id, job_id).await {
            Ok(summary) => Self::success(&summary),
            Err(e) => Self::analysis_err("Failed to analyze job", e),
        }
    }

    #[tool(
        description = "Read a cached gl:// resource. Never contacts GitLab; unanalyzed jobs return status not_analyzed."
    )]
    async fn get_resource(
        &self,
        Parameters(GetResourceRequest { uri }): Parameters<GetResourceRequest>,
    ) -> Result<CallToolResult, ErrorData> {
        match self.resolver.resolve(&uri).await {
            Ok(value) => Self::success(&value),
            Err(ResolutionError::Cache(e)) => Self::err("Failed to read analysis cache", Some(e.to_string())),
            Err(e) => Self::err("Invalid resource URI", Some(e.to_string())),
        }
    }

    #[tool(description = "Report analysis cache health: sizes, free disk space, row and orphan counts.")]
    async fn cache_health(&self) -> Result<CallToolResult, ErrorData> {
        Self::success(&health_check(self.db()).await)
    }

    #[tool(description = "Delete expired analyses and, optionally, snapshots from older parser versions.")]
    async fn cleanup_cache(
        &self,
        Parameters(CleanupCacheRequest {
            max_age_hours,
            include_superseded,
        }): Parameters<CleanupCacheRequest>,
    ) -> Result<CallToolResult, ErrorData> {
        let max_age_hours = max_age_hours
            .unwrap_or(self.cleanup.max_age_hours)
            .min(MAX_AGE_HOURS_CAP);
        let cutoff = cutoff_for_age(Utc::now(), max_age_hours);

        let expired = match cleanup_expired(self.db(), cutoff, self.cleanup.batch_size).await {
            Ok(report) => report,
            Err(e) => return Self::err("Cleanup failed", Some(e.to_string())),
        };

        let superseded = if include_superseded.unwrap_or(true) {
            match cleanup_superseded(self.db(), PARSER_VERSION, self.cleanup.batch_size).await {
                Ok(report) => Some(report),
                Err(e) => return Self::err("Superseded cleanup failed", Some(e.to_string())),
            }
        } else {
            None
        };

        tracing::info!(max_age_hours, jobs_deleted = expired.jobs_deleted, "Manual cache cleanup");
        Self::success(&CleanupResponse {
            max_age_hours,
            expired,
            superseded,
        })
    }
}

#[tool_handler]
impl ServerHandler for AnalyzerServer {
    fn get_info(&self) -> ServerInfo {
        let instruction = "GitLab CI failure analyzer. Call 'analyze_pipeline' (or 'analyze_job') once to fetch, parse and cache failed job logs, then drill down with 'get_resource' or resource reads on gl:// URIs: gl://pipeline/{project}/{pipeline}, gl://job/{project}/{job}, gl://errors/{project}/{job}, gl://file/{project}/{job}/{path}, gl://error/{project}/{job}/{id}. Add ?mode=minimal|balanced|fixing|detailed to control detail and ?page=&limit= to paginate. 'cache_health' and 'cleanup_cache' maintain the local cache.".to_string();

        ServerInfo {
            protocol_version: ProtocolVersion::V_2025_03_26,
            capabilities: ServerCapabilities::builder()
                .enable_tools()
                .enable_resources()
                .build(),
            server_info: Implementation {
                name: "gitlab-pipeline-analyzer".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            instructions: Some(instruction),
        }
    }

    async fn list_resource_templates(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListResourceTemplatesResult, ErrorData> {
        let resource_templates = RESOURCE_TEMPLATES
            .iter()
            .map(|t| {
                RawResourceTemplate {
                    uri_template: t.uri_template.to_string(),
                    name: t.name.to_string(),
                    description: Some(t.description.to_string()),
                    mime_type: Some("application/json".to_string()),
                }
                .no_annotation()
            })
            .collect();

        Ok(ListResourceTemplatesResult {
            resource_templates,
            next_cursor: None,
        })
    }

    async fn read_resource(
        &self,
        ReadResourceRequestParam { uri }: ReadResourceRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<ReadResourceResult, ErrorData> {
        match self.resolver.resolve(&uri).await {
            Ok(value) => {
                let text = serde_json::to_string_pretty(&value)
                    .map_err(|e| ErrorData::internal_error(e.to_string(), None))?;
                Ok(ReadResourceResult {
                    contents: vec![ResourceContents::text(text, uri)],
                })
            }
            Err(ResolutionError::Cache(e)) => {
                tracing::error!(uri, error = %e, "Resource read failed");
                Err(ErrorData::internal_error(e.to_string(), None))
            }
            Err(e) => Err(ErrorData::invalid_params(
                e.to_string(),
                Some(serde_json::json!({ "uri": uri })),
            )),
        }
    }
}
