//! Cache health and storage diagnostics.

use std::path::{Path, PathBuf};

use serde::Serialize;
use strum_macros::Display;
use sysinfo::Disks;

use crate::{
    CacheError, DBService,
    models::{
        error_record::ErrorRecord,
        file_index::FileIndex,
        job_trace::JobTrace,
        parsed_job::{ParsedJob, ParserVersionCount},
        pipeline_analysis::PipelineAnalysis,
    },
};

/// Below this much free space the cache is reported as degraded.
const LOW_DISK_BYTES: u64 = 100 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct TableCounts {
    pub parsed_jobs: i64,
    pub error_records: i64,
    pub file_index: i64,
    pub job_traces: i64,
    pub pipeline_analyses: i64,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct OrphanCounts {
    pub error_records: i64,
    pub file_index: i64,
    pub job_traces: i64,
}

impl OrphanCounts {
    pub fn total(&self) -> i64 {
        self.error_records + self.file_index + self.job_traces
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub reachable: bool,
    pub database_path: String,
    pub database_size_bytes: u64,
    pub wal_size_bytes: u64,
    pub free_disk_bytes: Option<u64>,
    /// Octal permission bits of the database file, e.g. `644`.
    pub permissions: Option<String>,
    pub counts: TableCounts,
    pub orphans: OrphanCounts,
    pub parser_versions: Vec<ParserVersionCount>,
    pub issues: Vec<String>,
}

pub fn wal_path(db_path: &Path) -> PathBuf {
    let mut name = db_path.as_os_str().to_owned();
    name.push("-wal");
    PathBuf::from(name)
}

fn file_size(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

#[cfg(unix)]
fn permission_bits(path: &Path) -> Option<String> {
    use std::os::unix::fs::PermissionsExt;
    let mode = std::fs::metadata(path).ok()?.permissions().mode();
    Some(format!("{:o}", mode & 0o777))
}

#[cfg(not(unix))]
fn permission_bits(_path: &Path) -> Option<String> {
    None
}

/// Available space on the volume holding `dir`, from the longest matching mount point.
fn free_disk_bytes(dir: &Path) -> Option<u64> {
    let dir = std::fs::canonicalize(dir).ok()?;
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|disk| dir.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}

/// Log a storage failure with what is known about the file and its volume.
pub fn log_storage_failure(path: &Path, error: &CacheError) {
    tracing::error!(
        path = %path.display(),
        exists = path.exists(),
        permissions = permission_bits(path).as_deref().unwrap_or("unknown"),
        free_disk_bytes = free_disk_bytes(parent_dir(path)),
        error = %error,
        "Analysis cache storage failure"
    );
}

async fn collect_counts(db: &DBService) -> Result<(TableCounts, OrphanCounts, Vec<ParserVersionCount>), sqlx::Error> {
    let pool = &db.pool;
    let counts = TableCounts {
        parsed_jobs: ParsedJob::count(pool).await?,
        error_records: ErrorRecord::count(pool).await?,
        file_index: FileIndex::count(pool).await?,
        job_traces: JobTrace::count(pool).await?,
        pipeline_analyses: PipelineAnalysis::count(pool).await?,
    };
    let orphans = OrphanCounts {
        error_records: ErrorRecord::count_orphaned(pool).await?,
        file_index: FileIndex::count_orphaned(pool).await?,
        job_traces: JobTrace::count_orphaned(pool).await?,
    };
    let versions = ParsedJob::count_by_parser_version(pool).await?;
    Ok((counts, orphans, versions))
}

/// Inspect reachability, file sizes, disk space, permissions and integrity.
/// Never fails; problems are reported in [`HealthReport::issues`].
pub async fn health_check(db: &DBService) -> HealthReport {
    let path = db.path();
    let mut issues = Vec::new();

    let reachable = match sqlx::query_scalar::<_, i64>("SELECT 1").fetch_one(&db.pool).await {
        Ok(_) => true,
        Err(e) => {
            issues.push(format!("database unreachable: {e}"));
            false
        }
    };

    let free_disk = free_disk_bytes(parent_dir(path));
    if let Some(free) = free_disk
        && free < LOW_DISK_BYTES
    {
        issues.push(format!("low disk space: {free} bytes free"));
    }

    let permissions = permission_bits(path);
    if let Ok(meta) = std::fs::metadata(path)
        && meta.permissions().readonly()
    {
        issues.push("database file is read-only".to_string());
    }

    let (counts, orphans, parser_versions) = if reachable {
        match collect_counts(db).await {
            Ok(collected) => collected,
            Err(e) => {
                issues.push(format!("count query failed: {e}"));
                Default::default()
            }
        }
    } else {
        Default::default()
    };

    if orphans.total() > 0 {
        issues.push(format!(
            "orphaned rows: {} error records, {} file index rows, {} traces",
            orphans.error_records, orphans.file_index, orphans.job_traces
        ));
    }

    let status = if !reachable {
        HealthStatus::Unhealthy
    } else if issues.is_empty() {
        HealthStatus::Healthy
    } else {
        HealthStatus::Degraded
    };

    if status != HealthStatus::Healthy {
        tracing::warn!(%status, issues = ?issues, "Analysis cache health check found problems");
    }

    HealthReport {
        status,
        reachable,
        database_path: path.display().to_string(),
        database_size_bytes: file_size(path),
        wal_size_bytes: file_size(&wal_path(path)),
        free_disk_bytes: free_disk,
        permissions,
        counts,
        orphans,
        parser_versions,
        issues,
    }
}
