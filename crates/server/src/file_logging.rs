//! Logging setup.
//!
//! Console output always goes to stderr so the stdio MCP transport keeps
//! stdout to itself. When `ANALYZER_FILE_LOGGING` is set, logs are also
//! written as JSON lines to daily rotating files.
//!
//! # Configuration
//!
//! - `ANALYZER_FILE_LOGGING`: "true" or "1" enables file logging
//! - `ANALYZER_LOG_DIR`: log directory (defaults to `{asset_dir}/logs`)
//! - `ANALYZER_LOG_MAX_FILES`: daily files to retain (default: 7)
//! - `RUST_LOG`: overrides the level derived from `MCP_DEBUG_LEVEL`

use std::path::{Path, PathBuf};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};
use utils::assets::log_dir;

const LOG_FILE_PREFIX: &str = "gitlab-analyzer.log";

#[derive(Debug, Clone)]
pub struct FileLoggingConfig {
    pub enabled: bool,
    pub log_dir: PathBuf,
    pub max_files: usize,
}

impl Default for FileLoggingConfig {
    fn default() -> Self {
        let enabled = std::env::var("ANALYZER_FILE_LOGGING")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        let max_files = std::env::var("ANALYZER_LOG_MAX_FILES")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(7);

        Self {
            enabled,
            log_dir: log_dir(),
            max_files,
        }
    }
}

/// Filter directives for the workspace crates at `log_level`.
pub fn filter_directives(log_level: &str) -> String {
    format!(
        "warn,server={level},services={level},db={level},analyzers={level},utils={level}",
        level = log_level
    )
}

fn build_filter(log_level: &str) -> EnvFilter {
    if std::env::var("RUST_LOG").is_ok_and(|v| !v.trim().is_empty()) {
        if let Ok(filter) = EnvFilter::try_from_default_env() {
            return filter;
        }
    }
    EnvFilter::try_new(filter_directives(log_level)).unwrap_or_else(|_| EnvFilter::new("warn"))
}

/// Install the global subscriber.
///
/// Hold the returned guard for the lifetime of the process so buffered file
/// output is flushed on shutdown. `None` when file logging is off.
pub fn init_logging(log_level: &str) -> Option<WorkerGuard> {
    let config = FileLoggingConfig::default();

    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(build_filter(log_level));

    if !config.enabled {
        tracing_subscriber::registry().with(console_layer).init();
        return None;
    }

    if let Err(e) = std::fs::create_dir_all(&config.log_dir) {
        eprintln!("Failed to create log directory {:?}: {}", config.log_dir, e);
        tracing_subscriber::registry().with(console_layer).init();
        return None;
    }

    let file_appender = tracing_appender::rolling::daily(&config.log_dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(build_filter(log_level));

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .init();

    tracing::info!(
        log_dir = ?config.log_dir,
        max_files = config.max_files,
        "File logging enabled"
    );

    let log_dir = config.log_dir.clone();
    let max_files = config.max_files;
    std::thread::spawn(move || {
        cleanup_old_logs(&log_dir, max_files);
    });

    Some(guard)
}

/// Keep only the `max_files` most recently modified log files.
fn cleanup_old_logs(log_dir: &Path, max_files: usize) {
    let entries = match std::fs::read_dir(log_dir) {
        Ok(entries) => entries,
        Err(_) => return,
    };

    let mut log_files: Vec<_> = entries
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.file_name()
                .to_str()
                .is_some_and(|n| n.starts_with(LOG_FILE_PREFIX))
        })
        .filter_map(|e| {
            e.metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .map(|t| (e.path(), t))
        })
        .collect();

    log_files.sort_by(|a, b| b.1.cmp(&a.1));

    for (path, _) in log_files.into_iter().skip(max_files) {
        if let Err(e) = std::fs::remove_file(&path) {
            tracing::warn!("Failed to remove old log file {:?}: {}", path, e);
        } else {
            tracing::debug!("Removed old log file: {:?}", path);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{fs, thread, time::Duration};

    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_filter_directives_cover_workspace_crates() {
        let directives = filter_directives("debug");
        for krate in ["server", "services", "db", "analyzers", "utils"] {
            assert!(directives.contains(&format!("{krate}=debug")), "{krate}");
        }
        assert!(directives.starts_with("warn,"));
    }

    #[test]
    fn test_cleanup_keeps_newest_files() {
        let dir = TempDir::new().unwrap();
        for day in 1..=4 {
            fs::write(dir.path().join(format!("{LOG_FILE_PREFIX}.2025-01-0{day}")), "x").unwrap();
            thread::sleep(Duration::from_millis(20));
        }
        fs::write(dir.path().join("other.txt"), "keep").unwrap();

        cleanup_old_logs(dir.path(), 2);

        let mut remaining: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        remaining.sort();
        assert_eq!(
            remaining,
            vec![
                format!("{LOG_FILE_PREFIX}.2025-01-03"),
                format!("{LOG_FILE_PREFIX}.2025-01-04"),
                "other.txt".to_string(),
            ]
        );
    }
}
