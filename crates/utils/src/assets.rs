use std::path::PathBuf;

use directories::ProjectDirs;

const PROJECT_ROOT: &str = env!("CARGO_MANIFEST_DIR");

/// Directory holding the analysis cache and log files.
///
/// Debug builds keep everything under `dev_assets/` in the workspace so local
/// runs never touch the user's real cache.
pub fn asset_dir() -> PathBuf {
    let path = if cfg!(debug_assertions) {
        PathBuf::from(PROJECT_ROOT).join("../../dev_assets")
    } else {
        match ProjectDirs::from("dev", "ci-analyzer", "gitlab-pipeline-analyzer") {
            Some(dirs) => dirs.data_dir().to_path_buf(),
            None => std::env::temp_dir().join("gitlab-pipeline-analyzer"),
        }
    };

    if !path.exists() {
        if let Err(e) = std::fs::create_dir_all(&path) {
            tracing::warn!(path = %path.display(), error = %e, "Failed to create asset directory");
        }
    }

    path
    // ✔ macOS → ~/Library/Application Support/gitlab-pipeline-analyzer
    // ✔ Linux → ~/.local/share/gitlab-pipeline-analyzer (respects XDG_DATA_HOME)
    // ✔ Windows → %APPDATA%\ci-analyzer\gitlab-pipeline-analyzer
}

/// Get the analysis cache database path.
///
/// Respects the `MCP_DATABASE_PATH` environment variable for custom locations.
/// Supports tilde expansion (e.g., `~/analyzer/cache.db`).
///
/// Default: `{asset_dir}/analysis_cache.db`
pub fn database_path() -> PathBuf {
    if let Ok(path) = std::env::var("MCP_DATABASE_PATH") {
        if !path.trim().is_empty() {
            return crate::path::expand_tilde(path.trim());
        }
    }
    asset_dir().join("analysis_cache.db")
}

/// Get the log directory path.
///
/// Respects `ANALYZER_LOG_DIR`; defaults to `{asset_dir}/logs`.
pub fn log_dir() -> PathBuf {
    if let Ok(path) = std::env::var("ANALYZER_LOG_DIR") {
        return crate::path::expand_tilde(&path);
    }
    asset_dir().join("logs")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    #[test]
    #[serial]
    fn test_database_path_default() {
        // SAFETY: Tests run serially via #[serial] attribute
        unsafe { env::remove_var("MCP_DATABASE_PATH") };
        let path = database_path();
        assert!(path.ends_with("analysis_cache.db"));
    }

    #[test]
    #[serial]
    fn test_database_path_env_override() {
        // SAFETY: Tests run serially via #[serial] attribute
        unsafe { env::set_var("MCP_DATABASE_PATH", "/custom/path/cache.db") };
        let path = database_path();
        unsafe { env::remove_var("MCP_DATABASE_PATH") };
        assert_eq!(path, PathBuf::from("/custom/path/cache.db"));
    }

    #[test]
    #[serial]
    fn test_database_path_tilde_expansion() {
        // SAFETY: Tests run serially via #[serial] attribute
        unsafe { env::set_var("MCP_DATABASE_PATH", "~/analyzer/cache.db") };
        let path = database_path();
        unsafe { env::remove_var("MCP_DATABASE_PATH") };
        assert!(!path.to_string_lossy().contains('~'));
        assert!(path.is_absolute());
    }

    #[test]
    #[serial]
    fn test_log_dir_env_override() {
        // SAFETY: Tests run serially via #[serial] attribute
        unsafe { env::set_var("ANALYZER_LOG_DIR", "/custom/logs") };
        let dir = log_dir();
        unsafe { env::remove_var("ANALYZER_LOG_DIR") };
        assert_eq!(dir, PathBuf::from("/custom/logs"));
    }
}
