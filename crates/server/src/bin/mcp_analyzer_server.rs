use std::sync::Arc;

use anyhow::Context;
use db::{CleanupScheduler, DBService};
use rmcp::transport::streamable_http_server::{
    StreamableHttpServerConfig, StreamableHttpService, session::local::LocalSessionManager,
};
use rmcp::{ServiceExt, transport::stdio};
use server::{file_logging::init_logging, mcp::analyzer_server::AnalyzerServer};
use services::services::{analysis::AnalysisService, config::AnalyzerConfig, gitlab::GitLabClient};

/// CLI arguments for the MCP analyzer server
struct Args {
    /// Run in HTTP mode instead of stdio
    http: bool,
    /// Port for HTTP server (only used with --http)
    port: Option<u16>,
}

impl Args {
    fn parse() -> Self {
        let args: Vec<String> = std::env::args().collect();
        let mut http = false;
        let mut port = None;

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--http" => http = true,
                "--port" => {
                    i += 1;
                    if i < args.len() {
                        port = args[i].parse().ok();
                    }
                }
                _ => {}
            }
            i += 1;
        }

        Args { http, port }
    }
}

/// Run the MCP server in stdio mode (default)
async fn run_stdio_server(server: AnalyzerServer) -> anyhow::Result<()> {
    let service = server.serve(stdio()).await.map_err(|e| {
        tracing::error!("serving error: {:?}", e);
        e
    })?;

    service.waiting().await?;
    Ok(())
}

/// Run the MCP server in HTTP mode
async fn run_http_server(server: AnalyzerServer, port: u16) -> anyhow::Result<()> {
    let host = std::env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let bind_address = format!("{}:{}", host, port);

    let server = Arc::new(server);
    let service = StreamableHttpService::new(
        move || Ok(server.as_ref().clone()),
        LocalSessionManager::default().into(),
        StreamableHttpServerConfig::default(),
    );

    let router = axum::Router::new().nest_service("/mcp", service);
    let tcp_listener = tokio::net::TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("Failed to bind {bind_address}"))?;

    tracing::info!("[MCP] HTTP server listening at http://{}/mcp", bind_address);

    axum::serve(tcp_listener, router)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
            tracing::info!("[MCP] Received shutdown signal, stopping HTTP server...");
        })
        .await?;

    Ok(())
}

fn main() -> anyhow::Result<()> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?
        .block_on(async {
            let config = AnalyzerConfig::from_env();
            let _log_guard = init_logging(config.log_level());

            let version = env!("CARGO_PKG_VERSION");
            tracing::info!(
                version,
                gitlab_url = %config.gitlab_url,
                database = %config.database_path.display(),
                "[MCP] Starting GitLab pipeline analyzer"
            );
            if config.gitlab_token.is_none() {
                tracing::warn!("GITLAB_TOKEN is not set; only public projects are reachable");
            }

            let db = DBService::open(&config.database_path)
                .await
                .context("Failed to open analysis cache")?;
            let gitlab = GitLabClient::from_config(&config).context("Failed to build GitLab client")?;
            let analysis = AnalysisService::new(Arc::new(gitlab), db.clone(), config.max_concurrent_jobs);
            let cleanup = CleanupScheduler::spawn(db, config.cleanup.clone());
            let server = AnalyzerServer::new(analysis, config.cleanup.clone());

            let args = Args::parse();
            let result = if args.http {
                run_http_server(server, args.port.unwrap_or(8080)).await
            } else {
                run_stdio_server(server).await
            };

            cleanup.shutdown().await;
            result
        })
}
