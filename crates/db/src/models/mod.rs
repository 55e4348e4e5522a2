//! Cache tables.
//!
//! - [`parsed_job`] - one row per `(job, trace hash, parser version)` snapshot
//! - [`error_record`] - standardized errors of a snapshot, addressed by ordinal
//! - [`file_index`] - file path to error lookup, rebuilt with every write
//! - [`job_trace`] - deflate-compressed raw traces
//! - [`pipeline_analysis`] - pipeline-level summaries

pub mod error_record;
pub mod file_index;
pub mod job_trace;
pub mod parsed_job;
pub mod pipeline_analysis;

/// A `LIMIT`/`OFFSET` window over a listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub limit: i64,
    pub offset: i64,
}

impl Page {
    pub fn new(limit: i64, offset: i64) -> Self {
        Self {
            limit: limit.max(0),
            offset: offset.max(0),
        }
    }

    pub fn all() -> Self {
        Self {
            limit: -1,
            offset: 0,
        }
    }
}
