//! Best-effort line categoriser used for unknown tooling and as the second
//! pass over test-runner output.

use lazy_static::lazy_static;
use regex::Regex;

use super::{TraceParser, context_window, finish, parse_number};
use crate::{
    model::{Framework, ParseError, ParseOptions, ParsedError, Severity, TracebackFrame},
    normalize::strip_ci_section_markers,
};

lazy_static! {
    static ref PYTEST_MARKER: Regex = Regex::new(r"^E\s+").expect("valid regex");
    static ref FAILED: Regex = Regex::new(r"\bFAILED\b").expect("valid regex");
    static ref FAILED_PATH: Regex =
        Regex::new(r"\bFAILED\s+([^\s:]+\.\w+)(?:::|\s|$)").expect("valid regex");
    static ref EXCEPTION: Regex =
        Regex::new(r"^\s*((?:[A-Za-z_]\w*\.)*[A-Z]\w*(?:Error|Exception)):\s*(.*)$")
            .expect("valid regex");
    static ref BUILD_FAILURE: Regex = Regex::new(
        r"(?i:\bfatal error\b)|^error(?:\[\w+\])?:|:\s*error:|npm ERR!|^make(?:\[\d+\])?: \*\*\*.*Error \d+|exit(?:ed with)? (?:code|status) [1-9]\d*|^ERROR:"
    )
    .expect("valid regex");
    /// `src/main.c:12:5: error: ...` as printed by compilers.
    static ref COMPILER_LOCATION: Regex =
        Regex::new(r"^([^\s:]+\.\w+):(\d+)(?::(\d+))?:\s*(?:fatal )?error").expect("valid regex");
    static ref DEPRECATION: Regex = Regex::new(r"\bDeprecationWarning\b").expect("valid regex");
    static ref WARNING: Regex =
        Regex::new(r"\b[A-Z]\w*Warning\b|\bWarning:|\bwarning:|^WARNING\b").expect("valid regex");
    /// Python traceback frame: `File "app/x.py", line 3, in run`
    static ref PY_FRAME: Regex =
        Regex::new(r#"^\s*File "([^"]+)", line (\d+)(?:, in (\S+))?"#).expect("valid regex");
    /// `tests/test_x.py:12: AssertionError` as printed after a pytest failure.
    static ref TRAILING_LOCATION: Regex =
        Regex::new(r"^([^\s:]+\.\w+):(\d+): (?:[A-Za-z_]\w*\.)*[A-Z]\w*$").expect("valid regex");
}

const LOOK_BACK: usize = 10;
const LOOK_AHEAD: usize = 5;
const MAX_RADIUS: usize = 3;

/// Runner bookkeeping that repeats the job status rather than a cause.
const IGNORED_PREFIXES: &[&str] = &["ERROR: Job failed", "Traceback (most recent call last):"];

pub struct GenericParser;

impl TraceParser for GenericParser {
    fn framework(&self) -> Framework {
        Framework::Generic
    }

    /// Never errors on non-empty input: an unrecognized trace yields no records.
    fn parse(&self, text: &str, options: &ParseOptions) -> Result<Vec<ParsedError>, ParseError> {
        if text.trim().is_empty() {
            return Err(ParseError::Empty);
        }

        let lines = strip_ci_section_markers(text);
        let radius = options.context_lines.min(MAX_RADIUS);
        let mut records = Vec::new();

        for (index, raw_line) in lines.iter().enumerate() {
            let trimmed = raw_line.trim();
            if trimmed.is_empty()
                || trimmed.starts_with("$ ")
                || IGNORED_PREFIXES.iter().any(|p| trimmed.starts_with(p))
            {
                continue;
            }
            let line = PYTEST_MARKER.replace(trimmed, "");
            let line = line.trim();

            let Some(mut record) = classify(line, &lines, index, options) else {
                continue;
            };
            record.context = context_window(&lines, index, radius);
            records.push(record);

            if records.len() >= options.max_errors {
                break;
            }
        }

        if records.is_empty() {
            return Ok(records);
        }
        finish(Framework::Generic, records, options)
    }
}

fn classify(
    line: &str,
    lines: &[&str],
    index: usize,
    options: &ParseOptions,
) -> Option<ParsedError> {
    if FAILED.is_match(line) {
        let file_path = FAILED_PATH
            .captures(line)
            .map(|caps| caps[1].to_string())
            .unwrap_or_default();
        return Some(
            ParsedError::new(Framework::Generic, Severity::Error, "test_failure", line)
                .at(file_path, None),
        );
    }

    if let Some(caps) = EXCEPTION.captures(line) {
        let exception_type = caps[1].to_string();
        let short_type = exception_type.rsplit('.').next().unwrap_or_default();
        let category = match short_type {
            "ImportError" | "ModuleNotFoundError" => "import_error",
            "SyntaxError" | "IndentationError" | "TabError" => "syntax_error",
            "AssertionError" => "test_failure",
            _ => "exception",
        };
        let (file_path, line_number, traceback) = locate_exception(lines, index, options);
        let mut record = ParsedError::new(Framework::Generic, Severity::Error, category, line)
            .at(file_path, line_number);
        record.exception_type = Some(exception_type);
        if options.include_traceback {
            record.traceback = traceback;
        }
        return Some(record);
    }

    if BUILD_FAILURE.is_match(line) {
        let mut record = ParsedError::new(Framework::Generic, Severity::Error, "build_error", line);
        if let Some(caps) = COMPILER_LOCATION.captures(line) {
            record.file_path = caps[1].to_string();
            record.line_number = parse_number(&caps[2]);
            record.column = caps.get(3).and_then(|m| parse_number(m.as_str()));
        }
        return Some(record);
    }

    if DEPRECATION.is_match(line) {
        return Some(ParsedError::new(
            Framework::Generic,
            Severity::Warning,
            "deprecation_warning",
            line,
        ));
    }
    if WARNING.is_match(line) {
        return Some(ParsedError::new(
            Framework::Generic,
            Severity::Warning,
            "warning",
            line,
        ));
    }

    None
}

/// Attribute an exception line to a file: the closest Python traceback frame
/// above it, else a pytest-style `path:line: Type` line below it.
fn locate_exception(
    lines: &[&str],
    index: usize,
    options: &ParseOptions,
) -> (String, Option<u32>, Vec<TracebackFrame>) {
    let start = index.saturating_sub(LOOK_BACK);
    let mut frames: Vec<TracebackFrame> = Vec::new();
    for (offset, line) in lines[start..index].iter().enumerate() {
        let Some(caps) = PY_FRAME.captures(line) else {
            continue;
        };
        let path = caps[1].to_string();
        if options.is_excluded(&path) {
            continue;
        }
        let code_line = lines
            .get(start + offset + 1)
            .map(|l| l.trim())
            .filter(|l| !l.is_empty() && !PY_FRAME.is_match(l))
            .map(str::to_string);
        frames.push(TracebackFrame {
            file_path: path,
            line_number: parse_number(&caps[2]),
            code_line,
            function: caps.get(3).map(|m| m.as_str().to_string()),
        });
    }
    if let Some(frame) = frames.last() {
        return (frame.file_path.clone(), frame.line_number, frames);
    }

    let end = (index + 1 + LOOK_AHEAD).min(lines.len());
    for line in &lines[index + 1..end] {
        if let Some(caps) = TRAILING_LOCATION.captures(line.trim()) {
            return (caps[1].to_string(), parse_number(&caps[2]), frames);
        }
    }

    (String::new(), None, frames)
}
