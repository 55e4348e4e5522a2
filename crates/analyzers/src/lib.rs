//! Trace analysis: normalization, framework detection, parsing and
//! deduplication of CI job output.
//!
//! The entry point is [`engine::AnalysisEngine`], which takes a raw job trace
//! plus the job's name and stage and produces a list of standardized error
//! records. Everything in this crate is synchronous and side-effect free so
//! results can be cached by `(trace hash, parser version)`.

pub mod detector;
pub mod engine;
pub mod model;
pub mod normalize;
pub mod parsers;
pub mod standardize;

pub use detector::detect_framework;
pub use engine::{AnalysisEngine, TraceAnalysis};
pub use model::{
    Framework, ParseError, ParseOptions, ParsedError, Severity, StandardError, TracebackFrame,
};
pub use normalize::{NormalizedTrace, normalize, strip_ci_section_markers};
pub use parsers::{TraceParser, parser_for};

/// Version of the parsing logic.
///
/// Bump whenever a parser, the detector ordering or the dedup rules change so
/// cached analyses produced by older logic are superseded.
pub const PARSER_VERSION: i64 = 3;
