//! Periodic cache cleanup.
//!
//! Runs once at startup and then every `MCP_AUTO_CLEANUP_INTERVAL_MINUTES`,
//! removing entries older than `MCP_AUTO_CLEANUP_MAX_AGE_HOURS` plus any
//! snapshot superseded by the current parser version.

use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;

use crate::{
    DBService,
    cleanup::{DEFAULT_BATCH_SIZE, MAX_AGE_HOURS_CAP, cleanup_expired, cleanup_superseded, cutoff_for_age},
};

const DEFAULT_INTERVAL_MINUTES: u64 = 60;
const DEFAULT_MAX_AGE_HOURS: u64 = 24;
/// One year.
const MAX_INTERVAL_MINUTES: u64 = 60 * 24 * 365;

#[derive(Clone, Debug)]
pub struct CleanupSchedulerConfig {
    pub enabled: bool,
    pub interval_minutes: u64,
    pub max_age_hours: u64,
    pub batch_size: i64,
    /// Snapshots below this version are deleted once the job has a newer one.
    pub parser_version: i64,
}

impl Default for CleanupSchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: std::env::var("MCP_AUTO_CLEANUP_ENABLED")
                .map(|v| !matches!(v.to_ascii_lowercase().as_str(), "false" | "0" | "no" | "off"))
                .unwrap_or(true),
            interval_minutes: std::env::var("MCP_AUTO_CLEANUP_INTERVAL_MINUTES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_INTERVAL_MINUTES),
            max_age_hours: std::env::var("MCP_AUTO_CLEANUP_MAX_AGE_HOURS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_MAX_AGE_HOURS),
            batch_size: DEFAULT_BATCH_SIZE,
            parser_version: analyzers::PARSER_VERSION,
        }
        .clamped()
    }
}

impl CleanupSchedulerConfig {
    /// Bound the interval and retention so timer and cutoff math cannot overflow.
    pub fn clamped(self) -> Self {
        Self {
            interval_minutes: self.interval_minutes.min(MAX_INTERVAL_MINUTES),
            max_age_hours: self.max_age_hours.min(MAX_AGE_HOURS_CAP),
            ..self
        }
    }

    fn period(&self) -> Duration {
        Duration::from_secs(self.interval_minutes.min(MAX_INTERVAL_MINUTES).saturating_mul(60))
    }
}

#[derive(Clone)]
pub struct CleanupSchedulerHandle {
    tx: Option<mpsc::Sender<CleanupCommand>>,
}

enum CleanupCommand {
    RunNow,
    Shutdown,
}

impl CleanupSchedulerHandle {
    /// Handle for a scheduler that never started.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub async fn run_now(&self) {
        if let Some(ref tx) = self.tx {
            let _ = tx.send(CleanupCommand::RunNow).await;
        }
    }

    /// Stop the scheduler. A batch in flight is rolled back, never half-applied.
    pub async fn shutdown(&self) {
        if let Some(ref tx) = self.tx {
            let _ = tx.send(CleanupCommand::Shutdown).await;
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }
}

pub struct CleanupScheduler;

impl CleanupScheduler {
    pub fn spawn(db: DBService, config: CleanupSchedulerConfig) -> CleanupSchedulerHandle {
        if !config.enabled {
            tracing::info!("Automatic cache cleanup disabled (MCP_AUTO_CLEANUP_ENABLED=false)");
            return CleanupSchedulerHandle::disabled();
        }

        if config.interval_minutes == 0 {
            tracing::info!("Automatic cache cleanup disabled (MCP_AUTO_CLEANUP_INTERVAL_MINUTES=0)");
            return CleanupSchedulerHandle::disabled();
        }

        let (tx, rx) = mpsc::channel(4);
        tokio::spawn(Self::run(db, config.clamped(), rx));
        CleanupSchedulerHandle { tx: Some(tx) }
    }

    async fn run(db: DBService, config: CleanupSchedulerConfig, mut rx: mpsc::Receiver<CleanupCommand>) {
        let mut interval = tokio::time::interval(config.period());

        tracing::info!(
            interval_minutes = config.interval_minutes,
            max_age_hours = config.max_age_hours,
            "Cache cleanup scheduler started"
        );

        loop {
            let trigger = tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(CleanupCommand::RunNow) => "manual",
                    Some(CleanupCommand::Shutdown) | None => break,
                },
                _ = interval.tick() => "scheduled",
            };

            let run = Self::run_once(&db, &config, trigger);
            tokio::pin!(run);
            let mut shutdown = false;
            loop {
                tokio::select! {
                    _ = &mut run => break,
                    cmd = rx.recv() => match cmd {
                        // Already running.
                        Some(CleanupCommand::RunNow) => {}
                        Some(CleanupCommand::Shutdown) | None => {
                            tracing::info!("Cache cleanup interrupted by shutdown");
                            shutdown = true;
                            break;
                        }
                    },
                }
            }
            if shutdown {
                break;
            }
        }

        tracing::info!("Cache cleanup scheduler stopped");
    }

    async fn run_once(db: &DBService, config: &CleanupSchedulerConfig, trigger: &'static str) {
        let cutoff = cutoff_for_age(Utc::now(), config.max_age_hours);
        tracing::debug!(trigger, cutoff = %cutoff, "Running cache cleanup");

        if let Err(e) = cleanup_expired(db, cutoff, config.batch_size).await {
            tracing::error!(error = %e, "Expired cache cleanup failed");
        }
        if let Err(e) = cleanup_superseded(db, config.parser_version, config.batch_size).await {
            tracing::error!(error = %e, "Superseded cache cleanup failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{models::parsed_job::ParsedJob, test_utils::create_test_db};

    #[tokio::test]
    async fn test_disabled_scheduler_has_no_sender() {
        let (db, _dir) = create_test_db().await;
        let config = CleanupSchedulerConfig {
            enabled: false,
            ..CleanupSchedulerConfig::default()
        };
        let handle = CleanupScheduler::spawn(db, config);
        assert!(!handle.is_enabled());
        handle.run_now().await;
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_zero_interval_disables_scheduler() {
        let (db, _dir) = create_test_db().await;
        let config = CleanupSchedulerConfig {
            enabled: true,
            interval_minutes: 0,
            ..CleanupSchedulerConfig::default()
        };
        assert!(!CleanupScheduler::spawn(db, config).is_enabled());
    }

    #[tokio::test]
    async fn test_running_scheduler_accepts_commands() {
        let (db, _dir) = create_test_db().await;
        let config = CleanupSchedulerConfig {
            enabled: true,
            interval_minutes: 60,
            ..CleanupSchedulerConfig::default()
        };
        let handle = CleanupScheduler::spawn(db, config);
        assert!(handle.is_enabled());
        handle.run_now().await;
        handle.shutdown().await;
    }

    #[test]
    fn test_clamped_bounds_interval_and_age() {
        let config = CleanupSchedulerConfig {
            interval_minutes: u64::MAX,
            max_age_hours: u64::MAX,
            ..CleanupSchedulerConfig::default()
        }
        .clamped();
        assert_eq!(config.interval_minutes, MAX_INTERVAL_MINUTES);
        assert_eq!(config.max_age_hours, MAX_AGE_HOURS_CAP);
        assert_eq!(config.period(), Duration::from_secs(MAX_INTERVAL_MINUTES * 60));
    }

    #[tokio::test]
    async fn test_run_once_survives_huge_max_age() {
        let (db, _dir) = create_test_db().await;
        let config = CleanupSchedulerConfig {
            max_age_hours: 10_000_000_000,
            ..CleanupSchedulerConfig::default()
        };
        CleanupScheduler::run_once(&db, &config, "manual").await;
        assert_eq!(ParsedJob::count(&db.pool).await.unwrap(), 0);
    }
}
