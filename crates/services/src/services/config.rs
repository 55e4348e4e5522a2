use std::path::PathBuf;

use db::CleanupSchedulerConfig;
use secrecy::SecretString;
use utils::assets::database_path;

const DEFAULT_GITLAB_URL: &str = "https://gitlab.com";
const DEFAULT_MAX_CONCURRENT_JOBS: usize = 4;

/// Process configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct AnalyzerConfig {
    /// Base URL of the GitLab instance, without the `/api/v4` suffix.
    pub gitlab_url: String,
    pub gitlab_token: Option<SecretString>,
    pub database_path: PathBuf,
    pub cleanup: CleanupSchedulerConfig,
    /// Upper bound on jobs analyzed at once within one pipeline.
    pub max_concurrent_jobs: usize,
    /// 0 = warn, 1 = info, 2 = debug, 3 = trace. Affects logging only.
    pub debug_level: u8,
}

impl AnalyzerConfig {
    /// Load configuration from environment variables.
    ///
    /// - `GITLAB_URL` (default `https://gitlab.com`)
    /// - `GITLAB_TOKEN`: private or project access token
    /// - `MCP_DATABASE_PATH`: cache location
    /// - `MCP_AUTO_CLEANUP_ENABLED`, `MCP_AUTO_CLEANUP_INTERVAL_MINUTES`,
    ///   `MCP_AUTO_CLEANUP_MAX_AGE_HOURS`
    /// - `MCP_MAX_CONCURRENT_JOBS` (default 4, minimum 1)
    /// - `MCP_DEBUG_LEVEL` (0-3)
    pub fn from_env() -> Self {
        let gitlab_url = std::env::var("GITLAB_URL")
            .ok()
            .map(|url| url.trim().trim_end_matches('/').to_string())
            .filter(|url| !url.is_empty())
            .unwrap_or_else(|| DEFAULT_GITLAB_URL.to_string());

        let gitlab_token = std::env::var("GITLAB_TOKEN")
            .ok()
            .filter(|token| !token.trim().is_empty())
            .map(SecretString::from);

        let max_concurrent_jobs = std::env::var("MCP_MAX_CONCURRENT_JOBS")
            .ok()
            .and_then(|s| s.trim().parse::<usize>().ok())
            .unwrap_or(DEFAULT_MAX_CONCURRENT_JOBS)
            .max(1);

        let debug_level = std::env::var("MCP_DEBUG_LEVEL")
            .ok()
            .and_then(|s| s.trim().parse::<u8>().ok())
            .unwrap_or(0)
            .min(3);

        Self {
            gitlab_url,
            gitlab_token,
            database_path: database_path(),
            cleanup: CleanupSchedulerConfig::default(),
            max_concurrent_jobs,
            debug_level,
        }
    }

    /// `tracing` filter directive for `debug_level`.
    pub fn log_level(&self) -> &'static str {
        match self.debug_level {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    }
}
