//! Converts parser output to [`StandardError`] and removes the overlap between
//! a specialised parse and the generic pass over the same trace.

use std::collections::HashSet;

use lazy_static::lazy_static;
use regex::Regex;

use crate::{
    model::{ParsedError, StandardError},
    parsers::base_name,
};

lazy_static! {
    static ref FAILED_WITH_TYPE: Regex =
        Regex::new(r"^FAILED\s+\S+\s+-\s+[A-Za-z_][\w.]*:\s*(.*)$").expect("valid regex");
    static ref TYPE_PREFIX: Regex =
        Regex::new(r"^[A-Za-z_][\w.]*:\s+(.*)$").expect("valid regex");
    static ref FAILED_PATH: Regex = Regex::new(r"^FAILED\s+(\S+)").expect("valid regex");
}

pub const MAX_MESSAGE_CHARS: usize = 2_000;
pub const MAX_CONTEXT_CHARS: usize = 4_000;

/// The part of a message that identifies the failure independent of which
/// parser reported it.
pub fn core_message(message: &str) -> &str {
    let message = message.trim();
    if let Some(caps) = FAILED_WITH_TYPE.captures(message) {
        return caps.get(1).map_or(message, |m| m.as_str());
    }
    if let Some(caps) = TYPE_PREFIX.captures(message) {
        return caps.get(1).map_or(message, |m| m.as_str());
    }
    message
}

/// Base name of `file_path`, or of the node id in a `FAILED <path>` message.
pub fn normalized_file_name(file_path: &str, message: &str) -> String {
    let name = base_name(file_path.trim());
    if !name.is_empty() {
        return name.to_string();
    }
    FAILED_PATH
        .captures(message.trim())
        .and_then(|caps| caps.get(1))
        .map(|m| {
            let path = m.as_str();
            let path = path.split("::").next().unwrap_or(path);
            base_name(path).to_string()
        })
        .unwrap_or_default()
}

pub fn fingerprint(message: &str, file_path: &str) -> String {
    format!(
        "{}|{}",
        core_message(message).trim().to_lowercase(),
        normalized_file_name(file_path, message).to_lowercase()
    )
}

/// Keep the first record for every fingerprint; returns the survivors in
/// their original order and how many were dropped.
pub fn deduplicate(records: Vec<ParsedError>) -> (Vec<ParsedError>, usize) {
    let before = records.len();
    let mut seen = HashSet::new();
    let kept: Vec<ParsedError> = records
        .into_iter()
        .filter(|record| {
            seen.insert(fingerprint(&stored_message(&record.message), &record.file_path))
        })
        .collect();
    let removed = before - kept.len();
    (kept, removed)
}

/// Final shape of a job's records: bounded text, ordinals in list order,
/// fingerprints on every record.
pub fn standardize(records: Vec<ParsedError>) -> Vec<StandardError> {
    records
        .into_iter()
        .enumerate()
        .map(|(ordinal, record)| {
            let message = stored_message(&record.message);
            let fingerprint = fingerprint(&message, &record.file_path);
            StandardError {
                ordinal,
                level: record.level,
                category: record.category,
                message,
                exception_type: record.exception_type,
                test_name: record.test_name,
                file_path: record.file_path,
                line_number: record.line_number,
                column: record.column,
                rule: record.rule,
                context_snippet: truncate_chars(&record.context, MAX_CONTEXT_CHARS),
                traceback: record.traceback,
                fingerprint,
                source_parser: record.source,
            }
        })
        .collect()
}

/// Message as persisted. Dedup fingerprints use the same text so two records
/// never survive dedup only to store identical fingerprints.
fn stored_message(message: &str) -> String {
    truncate_chars(message.trim(), MAX_MESSAGE_CHARS)
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((end, _)) => text[..end].to_string(),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Framework, Severity};

    fn record(source: Framework, message: &str, file_path: &str) -> ParsedError {
        ParsedError::new(source, Severity::Error, "test_failure", message).at(file_path, None)
    }

    #[test]
    fn test_core_message() {
        assert_eq!(
            core_message("FAILED tests/test_a.py::test_x - AssertionError: assert 1 == 2"),
            "assert 1 == 2"
        );
        assert_eq!(core_message("ValueError: bad"), "bad");
        assert_eq!(core_message("  plain message "), "plain message");
    }

    #[test]
    fn test_normalized_file_name() {
        assert_eq!(normalized_file_name("tests/unit/test_a.py", ""), "test_a.py");
        assert_eq!(
            normalized_file_name("", "FAILED tests/unit/test_a.py::test_x - boom"),
            "test_a.py"
        );
        assert_eq!(normalized_file_name("", "no file here"), "");
    }

    #[test]
    fn test_cross_parser_duplicates_collapse() {
        let records = vec![
            record(Framework::Pytest, "assert 1 == 2", "tests/test_a.py"),
            record(
                Framework::Generic,
                "FAILED tests/test_a.py::test_x - AssertionError: assert 1 == 2",
                "",
            ),
            record(Framework::Generic, "AssertionError: assert 1 == 2", "tests/test_a.py"),
            record(Framework::Generic, "AssertionError: assert 1 == 2", "tests/test_b.py"),
        ];
        let (kept, removed) = deduplicate(records);
        assert_eq!(removed, 2);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].source, Framework::Pytest);
        assert_eq!(kept[1].file_path, "tests/test_b.py");
    }

    #[test]
    fn test_dedup_matches_stored_fingerprints_for_long_messages() {
        let prefix = "x".repeat(MAX_MESSAGE_CHARS);
        let records = vec![
            record(Framework::Pytest, &format!("{prefix} first tail"), "tests/test_a.py"),
            record(Framework::Generic, &format!("{prefix} second tail"), "tests/test_a.py"),
        ];

        let (kept, removed) = deduplicate(records);
        assert_eq!(removed, 1);

        let stored = standardize(kept);
        let fingerprints: HashSet<&str> = stored.iter().map(|e| e.fingerprint.as_str()).collect();
        assert_eq!(fingerprints.len(), stored.len());
    }

    #[test]
    fn test_standardize_assigns_ordinals_and_bounds_text() {
        let long = "x".repeat(MAX_MESSAGE_CHARS + 10);
        let standardized = standardize(vec![
            record(Framework::Jest, "  first  ", "a.test.js"),
            record(Framework::Jest, &long, "a.test.js"),
        ]);
        assert_eq!(standardized[0].ordinal, 0);
        assert_eq!(standardized[0].message, "first");
        assert_eq!(standardized[0].fingerprint, "first|a.test.js");
        assert_eq!(standardized[1].ordinal, 1);
        assert_eq!(standardized[1].message.chars().count(), MAX_MESSAGE_CHARS);
        assert_eq!(standardized[1].source_parser, Framework::Jest);
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("hi", 5), "hi");
    }
}
