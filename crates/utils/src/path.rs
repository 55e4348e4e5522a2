use std::path::PathBuf;

/// Expand a leading `~` or `~/` to the current user's home directory.
///
/// Paths without a tilde prefix are returned unchanged. When the home
/// directory cannot be determined the input is returned as-is.
pub fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" {
        if let Some(home) = home_dir() {
            return home;
        }
    } else if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

fn home_dir() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|dirs| dirs.home_dir().to_path_buf())
}
