//! GitLab REST v4 client.
//!
//! Only the handful of read endpoints the analyzer needs. Requests retry with
//! exponential backoff on rate limiting, server errors and transport failures.

use std::time::Duration;

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use reqwest::{Client, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;

use super::config::AnalyzerConfig;

#[derive(Debug, Clone, Error)]
pub enum GitLabError {
    #[error("GitLab request timed out")]
    Timeout,
    #[error("GitLab request failed: {0}")]
    Transport(String),
    #[error("GitLab resource not found: {0}")]
    NotFound(String),
    #[error("GitLab rejected credentials (HTTP {0})")]
    Unauthorized(u16),
    #[error("GitLab rate limit exceeded")]
    RateLimited,
    #[error("GitLab server error: HTTP {status} - {body}")]
    Server { status: u16, body: String },
    #[error("GitLab returned HTTP {status} - {body}")]
    Http { status: u16, body: String },
    #[error("Failed to decode GitLab response: {0}")]
    Decode(String),
}

impl GitLabError {
    /// Worth retrying with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::Transport(_) | Self::RateLimited | Self::Server { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineInfo {
    pub id: i64,
    pub status: String,
    #[serde(rename = "ref")]
    pub ref_name: String,
    #[serde(default)]
    pub sha: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub web_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineRef {
    pub id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInfo {
    pub id: i64,
    pub name: String,
    pub stage: String,
    pub status: String,
    #[serde(rename = "ref", default)]
    pub ref_name: Option<String>,
    #[serde(default)]
    pub pipeline: Option<PipelineRef>,
    #[serde(default)]
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub web_url: Option<String>,
}

impl JobInfo {
    pub fn pipeline_id(&self) -> Option<i64> {
        self.pipeline.as_ref().map(|p| p.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeRequestInfo {
    pub iid: i64,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub source_branch: String,
    pub target_branch: String,
}

/// Read access to GitLab used by the orchestrator.
#[async_trait]
pub trait GitLabApi: Send + Sync {
    async fn fetch_pipeline(&self, project_id: &str, pipeline_id: i64) -> Result<PipelineInfo, GitLabError>;

    /// Jobs of the pipeline whose status is `failed`.
    async fn fetch_failed_jobs(&self, project_id: &str, pipeline_id: i64) -> Result<Vec<JobInfo>, GitLabError>;

    async fn fetch_job(&self, project_id: &str, job_id: i64) -> Result<JobInfo, GitLabError>;

    async fn fetch_job_trace(&self, project_id: &str, job_id: i64) -> Result<String, GitLabError>;

    async fn fetch_merge_request(&self, project_id: &str, iid: i64) -> Result<MergeRequestInfo, GitLabError>;
}

#[derive(Clone)]
pub struct GitLabClient {
    http: Client,
    base_url: String,
    token: Option<SecretString>,
}

impl std::fmt::Debug for GitLabClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitLabClient")
            .field("base_url", &self.base_url)
            .field("token", &self.token.as_ref().map(|_| "<secret>"))
            .finish()
    }
}

impl GitLabClient {
    const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
    const PER_PAGE: usize = 100;
    const MAX_PAGES: u32 = 50;
    const MAX_RETRIES: usize = 4;

    pub fn new(base_url: &str, token: Option<SecretString>) -> Result<Self, GitLabError> {
        let http = Client::builder()
            .timeout(Self::REQUEST_TIMEOUT)
            .user_agent(concat!("gitlab-pipeline-analyzer/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| GitLabError::Transport(e.to_string()))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    pub fn from_config(config: &AnalyzerConfig) -> Result<Self, GitLabError> {
        Self::new(&config.gitlab_url, config.gitlab_token.clone())
    }

    fn project_url(&self, project_id: &str, rest: &str) -> String {
        format!(
            "{}/api/v4/projects/{}/{}",
            self.base_url,
            urlencoding::encode(project_id),
            rest
        )
    }

    fn backoff() -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(500))
            .with_max_delay(Duration::from_secs(10))
            .with_max_times(Self::MAX_RETRIES)
            .with_jitter()
    }

    async fn send_once(&self, url: &str, query: &[(&str, String)]) -> Result<Response, GitLabError> {
        let mut request = self.http.get(url).query(query);
        if let Some(token) = &self.token {
            request = request.header("PRIVATE-TOKEN", token.expose_secret());
        }

        let response = request.send().await.map_err(map_reqwest_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(match status {
            StatusCode::NOT_FOUND => GitLabError::NotFound(url.to_string()),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => GitLabError::Unauthorized(status.as_u16()),
            StatusCode::TOO_MANY_REQUESTS => GitLabError::RateLimited,
            s if s.is_server_error() => GitLabError::Server {
                status: s.as_u16(),
                body,
            },
            s => GitLabError::Http {
                status: s.as_u16(),
                body,
            },
        })
    }

    async fn get(&self, url: &str, query: &[(&str, String)]) -> Result<Response, GitLabError> {
        let this = self;
        (|| async move { this.send_once(url, query).await })
            .retry(Self::backoff())
            .sleep(tokio::time::sleep)
            .when(GitLabError::is_retryable)
            .notify(|err, delay| {
                tracing::warn!(url, error = %err, delay_ms = delay.as_millis() as u64, "Retrying GitLab request");
            })
            .await
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, GitLabError> {
        self.get(url, &[])
            .await?
            .json::<T>()
            .await
            .map_err(|e| GitLabError::Decode(e.to_string()))
    }
}

#[async_trait]
impl GitLabApi for GitLabClient {
    async fn fetch_pipeline(&self, project_id: &str, pipeline_id: i64) -> Result<PipelineInfo, GitLabError> {
        self.get_json(&self.project_url(project_id, &format!("pipelines/{pipeline_id}")))
            .await
    }

    async fn fetch_failed_jobs(&self, project_id: &str, pipeline_id: i64) -> Result<Vec<JobInfo>, GitLabError> {
        let url = self.project_url(project_id, &format!("pipelines/{pipeline_id}/jobs"));
        let mut jobs = Vec::new();
        let mut page = 1u32;

        loop {
            let query = [
                ("scope[]", "failed".to_string()),
                ("per_page", Self::PER_PAGE.to_string()),
                ("page", page.to_string()),
            ];
            let response = self.get(&url, &query).await?;
            let next_page = response
                .headers()
                .get("x-next-page")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u32>().ok());

            let batch: Vec<JobInfo> = response
                .json()
                .await
                .map_err(|e| GitLabError::Decode(e.to_string()))?;
            let short_page = batch.len() < Self::PER_PAGE;
            jobs.extend(batch);

            match next_page {
                Some(next) if next > page && page < Self::MAX_PAGES && !short_page => page = next,
                _ => break,
            }
        }

        tracing::debug!(project_id, pipeline_id, failed_jobs = jobs.len(), "Fetched failed jobs");
        Ok(jobs)
    }

    async fn fetch_job(&self, project_id: &str, job_id: i64) -> Result<JobInfo, GitLabError> {
        self.get_json(&self.project_url(project_id, &format!("jobs/{job_id}")))
            .await
    }

    async fn fetch_job_trace(&self, project_id: &str, job_id: i64) -> Result<String, GitLabError> {
        let url = self.project_url(project_id, &format!("jobs/{job_id}/trace"));
        self.get(&url, &[])
            .await?
            .text()
            .await
            .map_err(|e| GitLabError::Decode(e.to_string()))
    }

    async fn fetch_merge_request(&self, project_id: &str, iid: i64) -> Result<MergeRequestInfo, GitLabError> {
        self.get_json(&self.project_url(project_id, &format!("merge_requests/{iid}")))
            .await
    }
}

fn map_reqwest_error(e: reqwest::Error) -> GitLabError {
    if e.is_timeout() {
        GitLabError::Timeout
    } else {
        GitLabError::Transport(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_project_paths_are_encoded() {
        let client = GitLabClient::new("https://gitlab.example.com/", None).unwrap();
        assert_eq!(
            client.project_url("group/sub/app", "jobs/5/trace"),
            "https://gitlab.example.com/api/v4/projects/group%2Fsub%2Fapp/jobs/5/trace"
        );
        assert_eq!(
            client.project_url("123", "pipelines/9"),
            "https://gitlab.example.com/api/v4/projects/123/pipelines/9"
        );
    }

    #[test]
    fn test_retryable_errors() {
        assert!(GitLabError::RateLimited.is_retryable());
        assert!(GitLabError::Timeout.is_retryable());
        assert!(GitLabError::Server { status: 502, body: String::new() }.is_retryable());
        assert!(!GitLabError::NotFound("x".into()).is_retryable());
        assert!(!GitLabError::Unauthorized(401).is_retryable());
        assert!(!GitLabError::Http { status: 400, body: String::new() }.is_retryable());
    }

    #[test]
    fn test_token_is_not_debug_printed() {
        let client = GitLabClient::new("https://gitlab.com", Some(SecretString::from("glpat-abc"))).unwrap();
        let printed = format!("{client:?}");
        assert!(!printed.contains("glpat-abc"));
        assert!(printed.contains("<secret>"));
    }

    #[test]
    fn test_job_payload_decodes() {
        let job: JobInfo = serde_json::from_str(
            r#"{"id": 7, "name": "pytest", "stage": "test", "status": "failed",
                "ref": "main", "pipeline": {"id": 3, "status": "failed"},
                "failure_reason": "script_failure", "web_url": "https://x/-/jobs/7"}"#,
        )
        .unwrap();
        assert_eq!(job.pipeline_id(), Some(3));
        assert_eq!(job.ref_name.as_deref(), Some("main"));
    }
}
