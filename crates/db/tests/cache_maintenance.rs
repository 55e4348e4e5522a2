//! Integration tests for cache maintenance:
//! - age-based cleanup in batches, including traces and pipeline summaries
//! - removal of snapshots superseded by a newer parser version
//! - health report counts, file sizes and orphan detection

use std::collections::BTreeMap;

use analyzers::{Framework, Severity, StandardError, TraceAnalysis};
use chrono::{Duration, Utc};
use db::{
    DBService, HealthStatus, MAX_AGE_HOURS_CAP, NewJobAnalysis, cleanup_expired,
    cleanup_superseded, cutoff_for_age, health_check,
    models::{
        error_record::ErrorRecord,
        file_index::FileIndex,
        job_trace::JobTrace,
        parsed_job::ParsedJob,
        pipeline_analysis::PipelineAnalysis,
    },
};
use sqlx::types::Json;
use tempfile::TempDir;

async fn open_db() -> (DBService, TempDir) {
    let dir = TempDir::new().unwrap();
    let db = DBService::open(&dir.path().join("analysis_cache.db")).await.unwrap();
    (db, dir)
}

fn analysis(parser_version: i64, count: usize) -> TraceAnalysis {
    let errors = (0..count)
        .map(|i| StandardError {
            ordinal: i,
            level: Severity::Error,
            category: "lint_error".to_string(),
            message: format!("problem {i}"),
            exception_type: None,
            test_name: None,
            file_path: "src/index.ts".to_string(),
            line_number: Some(i as u32 + 1),
            column: Some(1),
            rule: Some("no-unused-vars".to_string()),
            context_snippet: String::new(),
            traceback: Vec::new(),
            fingerprint: format!("problem {i}|index.ts"),
            source_parser: Framework::EsLint,
        })
        .collect();
    TraceAnalysis {
        framework: Framework::EsLint,
        parser_version,
        original_length: 10,
        cleaned_length: 10,
        sequences_removed: 0,
        parsers_used: vec![Framework::EsLint],
        hybrid: false,
        duplicates_removed: 0,
        errors,
    }
}

async fn store(db: &DBService, job_id: i64, hash: &str, analysis: &TraceAnalysis) -> ParsedJob {
    db.store_job_analysis(&NewJobAnalysis {
        project_id: "group/app",
        job_id,
        pipeline_id: Some(1),
        job_name: "eslint",
        job_stage: "lint",
        job_status: "failed",
        ref_name: Some("main"),
        trace_hash: hash,
        raw_trace: Some("src/index.ts\n  1:1  error  x  no-unused-vars"),
        analysis,
    })
    .await
    .unwrap()
    .into_job()
}

fn summary(pipeline_id: i64) -> PipelineAnalysis {
    let now = Utc::now();
    PipelineAnalysis {
        project_id: "group/app".to_string(),
        pipeline_id,
        ref_name: "main".to_string(),
        sha: Some("abc123".to_string()),
        status: "failed".to_string(),
        source_branch: None,
        target_branch: None,
        merge_request_iid: None,
        can_resolve_branch: true,
        ticket_ids: Json(vec!["APP-1".to_string()]),
        failed_job_count: 1,
        analyzed_job_count: 1,
        total_errors: 3,
        total_warnings: 0,
        category_histogram: Json(BTreeMap::from([("lint_error".to_string(), 3)])),
        parser_usage: Json(BTreeMap::from([("eslint".to_string(), 1)])),
        job_failures: Json(Vec::new()),
        parser_version: 3,
        created_at: now,
        updated_at: now,
    }
}

#[tokio::test]
async fn future_cutoff_removes_everything_in_batches() {
    let (db, _dir) = open_db().await;
    for job_id in 0..5 {
        store(&db, job_id, &format!("h{job_id}"), &analysis(3, 3)).await;
    }
    PipelineAnalysis::upsert(&db.pool, &summary(1)).await.unwrap();

    let report = cleanup_expired(&db, Utc::now() + Duration::hours(1), 2).await.unwrap();

    assert_eq!(report.jobs_deleted, 5);
    assert_eq!(report.errors_deleted, 15);
    assert_eq!(report.index_rows_deleted, 15);
    assert_eq!(report.batches, 3);
    assert_eq!(report.traces_deleted, 5);
    assert_eq!(report.pipelines_deleted, 1);

    assert_eq!(ParsedJob::count(&db.pool).await.unwrap(), 0);
    assert_eq!(ErrorRecord::count(&db.pool).await.unwrap(), 0);
    assert_eq!(FileIndex::count(&db.pool).await.unwrap(), 0);
    assert_eq!(JobTrace::count(&db.pool).await.unwrap(), 0);
}

#[tokio::test]
async fn past_cutoff_keeps_fresh_entries() {
    let (db, _dir) = open_db().await;
    store(&db, 1, "h", &analysis(3, 2)).await;
    PipelineAnalysis::upsert(&db.pool, &summary(1)).await.unwrap();

    let report = cleanup_expired(&db, Utc::now() - Duration::hours(24), 100).await.unwrap();

    assert!(report.is_empty());
    assert_eq!(ParsedJob::count(&db.pool).await.unwrap(), 1);
    assert!(PipelineAnalysis::find(&db.pool, "group/app", 1).await.unwrap().is_some());
}

#[tokio::test]
async fn oversized_max_age_keeps_everything() {
    let (db, _dir) = open_db().await;
    store(&db, 1, "h", &analysis(3, 2)).await;

    let now = Utc::now();
    let cutoff = cutoff_for_age(now, u64::MAX);
    assert_eq!(cutoff, cutoff_for_age(now, MAX_AGE_HOURS_CAP));
    assert!(cutoff < now);

    let report = cleanup_expired(&db, cutoff, 100).await.unwrap();
    assert!(report.is_empty());
    assert_eq!(ParsedJob::count(&db.pool).await.unwrap(), 1);
}

#[tokio::test]
async fn superseded_snapshots_are_removed_only_when_replaced() {
    let (db, _dir) = open_db().await;
    store(&db, 1, "h", &analysis(2, 1)).await;
    store(&db, 1, "h", &analysis(3, 1)).await;
    // Job 2 was never re-analyzed, so its old snapshot stays.
    store(&db, 2, "h", &analysis(2, 1)).await;

    let report = cleanup_superseded(&db, 3, 10).await.unwrap();

    assert_eq!(report.jobs_deleted, 1);
    assert!(db.find_job_analysis(1, "h", 2).await.unwrap().is_none());
    assert!(db.find_job_analysis(1, "h", 3).await.unwrap().is_some());
    assert!(db.find_job_analysis(2, "h", 2).await.unwrap().is_some());
}

#[tokio::test]
async fn pipeline_upsert_replaces_summary() {
    let (db, _dir) = open_db().await;
    let first = summary(9);
    PipelineAnalysis::upsert(&db.pool, &first).await.unwrap();

    let mut second = summary(9);
    second.total_errors = 10;
    second.created_at = first.created_at + Duration::minutes(5);
    PipelineAnalysis::upsert(&db.pool, &second).await.unwrap();

    let stored = PipelineAnalysis::find(&db.pool, "group/app", 9).await.unwrap().unwrap();
    assert_eq!(stored.total_errors, 10);
    assert_eq!(stored.created_at, first.created_at);
    assert_eq!(stored.ticket_ids.0, vec!["APP-1".to_string()]);
    assert_eq!(PipelineAnalysis::count(&db.pool).await.unwrap(), 1);
}

#[tokio::test]
async fn health_report_on_fresh_cache() {
    let (db, _dir) = open_db().await;
    store(&db, 1, "h", &analysis(3, 4)).await;

    let report = health_check(&db).await;

    assert!(report.reachable);
    assert!(report.database_size_bytes > 0);
    assert_eq!(report.counts.parsed_jobs, 1);
    assert_eq!(report.counts.error_records, 4);
    assert_eq!(report.counts.file_index, 4);
    assert_eq!(report.counts.job_traces, 1);
    assert_eq!(report.orphans.total(), 0);
    assert_eq!(report.parser_versions.len(), 1);
    assert_eq!(report.parser_versions[0].parser_version, 3);
    assert!(report.database_path.ends_with("analysis_cache.db"));
}

#[tokio::test]
async fn health_report_flags_orphans() {
    let (db, _dir) = open_db().await;

    let mut conn = db.pool.acquire().await.unwrap();
    sqlx::query("PRAGMA foreign_keys = OFF").execute(&mut *conn).await.unwrap();
    sqlx::query(
        r#"INSERT INTO error_records (parsed_job_id, job_id, ordinal, level, category, message, fingerprint, source_parser)
           VALUES (999, 1, 0, 'error', 'exception', 'lost', 'lost|', 'generic')"#,
    )
    .execute(&mut *conn)
    .await
    .unwrap();
    sqlx::query("PRAGMA foreign_keys = ON").execute(&mut *conn).await.unwrap();
    drop(conn);

    let report = health_check(&db).await;

    assert_eq!(report.orphans.error_records, 1);
    assert_eq!(report.status, HealthStatus::Degraded);
    assert!(report.issues.iter().any(|i| i.contains("orphaned")));
}
