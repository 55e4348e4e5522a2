use std::collections::HashSet;

use lazy_static::lazy_static;
use regex::Regex;

use super::{TraceParser, base_name, context_window, finish, parse_number, split_exception};
use crate::{
    model::{Framework, ParseError, ParseOptions, ParsedError, Severity, TracebackFrame},
    normalize::strip_ci_section_markers,
};

lazy_static! {
    static ref SUITE: Regex = Regex::new(r"^\s*(PASS|FAIL)\s+(\S+)").expect("valid regex");
    static ref FAILURE_HEADER: Regex = Regex::new(r"^\s*● (.+?)\s*$").expect("valid regex");
    /// `at fn (path:line:col)` or `at path:line:col`
    static ref STACK_FRAME: Regex =
        Regex::new(r"^\s*at (?:(.+?) \()?([^\s()]+):(\d+):(\d+)\)?\s*$").expect("valid regex");
    static ref CODE_FRAME: Regex = Regex::new(r"^\s*>\s*(\d+)\s*\|(.*)$").expect("valid regex");
    static ref CODE_FRAME_ANY: Regex = Regex::new(r"^\s*>?\s*\d*\s*\|").expect("valid regex");
    static ref RUN_SUMMARY: Regex =
        Regex::new(r"^\s*(?:Test Suites|Tests|Snapshots|Time|Ran all test suites)\b")
            .expect("valid regex");
}

const SUMMARY_OF_FAILURES: &str = "Summary of all failing tests";
const SUITE_FAILED: &str = "Test suite failed to run";

struct Block<'a> {
    suite: Option<&'a str>,
    title: &'a str,
    lines: Vec<&'a str>,
}

pub struct JestParser;

impl TraceParser for JestParser {
    fn framework(&self) -> Framework {
        Framework::Jest
    }

    fn parse(&self, text: &str, options: &ParseOptions) -> Result<Vec<ParsedError>, ParseError> {
        if text.trim().is_empty() {
            return Err(ParseError::Empty);
        }

        let lines = strip_ci_section_markers(text);
        let mut records = Vec::new();
        let mut seen: HashSet<(String, String)> = HashSet::new();
        let mut failed_suites: Vec<&str> = Vec::new();
        let mut suite: Option<&str> = None;
        let mut current: Option<Block> = None;

        let mut flush = |block: Option<Block>, records: &mut Vec<ParsedError>| {
            if let Some(block) = block {
                let signature = (
                    block.suite.map(base_name).unwrap_or_default().to_string(),
                    block.title.to_string(),
                );
                if seen.insert(signature) {
                    records.push(block_record(&block, options));
                }
            }
        };

        for &line in &lines {
            if let Some(caps) = SUITE.captures(line) {
                flush(current.take(), &mut records);
                let path = caps.get(2).map_or("", |m| m.as_str());
                if &caps[1] == "FAIL" {
                    if !failed_suites.contains(&path) {
                        failed_suites.push(path);
                    }
                    suite = Some(path);
                } else {
                    suite = None;
                }
                continue;
            }

            if let Some(caps) = FAILURE_HEADER.captures(line) {
                flush(current.take(), &mut records);
                current = Some(Block {
                    suite,
                    title: caps.get(1).map_or("", |m| m.as_str()),
                    lines: vec![line],
                });
                continue;
            }

            if line.trim() == SUMMARY_OF_FAILURES || RUN_SUMMARY.is_match(line) {
                flush(current.take(), &mut records);
                continue;
            }

            if let Some(block) = current.as_mut() {
                block.lines.push(line);
            }
        }
        flush(current.take(), &mut records);

        // A suite can fail without any `●` block, e.g. when the run is killed.
        for path in failed_suites {
            let reported = records.iter().any(|r: &ParsedError| {
                r.file_path == path || r.context.contains(path)
            });
            if !reported {
                records.push(
                    ParsedError::new(Framework::Jest, Severity::Error, "suite_error", "Test suite failed")
                        .at(path, None)
                        .with_context(format!("FAIL {path}")),
                );
            }
        }

        finish(Framework::Jest, records, options)
    }
}

fn block_record(block: &Block<'_>, options: &ParseOptions) -> ParsedError {
    let suite_failed = block.title == SUITE_FAILED;

    let mut paragraph: Vec<&str> = Vec::new();
    let mut paragraph_done = false;
    let mut frames: Vec<TracebackFrame> = Vec::new();
    let mut code_line: Option<(u32, String)> = None;
    let mut marker_index = 0;

    for (index, line) in block.lines.iter().enumerate().skip(1) {
        if let Some(caps) = STACK_FRAME.captures(line) {
            let path = caps[2].to_string();
            if !options.is_excluded(&path) {
                frames.push(TracebackFrame {
                    file_path: path,
                    line_number: parse_number(&caps[3]),
                    code_line: None,
                    function: caps.get(1).map(|m| m.as_str().to_string()),
                });
            }
            paragraph_done |= !paragraph.is_empty();
            continue;
        }

        if let Some(caps) = CODE_FRAME.captures(line) {
            if code_line.is_none()
                && let Some(number) = parse_number(&caps[1])
            {
                code_line = Some((number, caps[2].trim().to_string()));
                marker_index = index;
            }
            paragraph_done |= !paragraph.is_empty();
            continue;
        }
        if CODE_FRAME_ANY.is_match(line) {
            paragraph_done |= !paragraph.is_empty();
            continue;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            paragraph_done |= !paragraph.is_empty();
            continue;
        }
        if !paragraph_done {
            paragraph.push(trimmed);
        }
    }

    let raw_message = if paragraph.is_empty() {
        block.title.to_string()
    } else {
        paragraph.join(" ")
    };
    let (exception_type, message) = split_exception(&raw_message);

    // The first frame in the suite file is where the assertion lives.
    let anchor = block
        .suite
        .and_then(|suite| frames.iter().find(|f| f.file_path.ends_with(suite)))
        .or_else(|| frames.first());
    let (file_path, line_number, column) = match anchor {
        Some(frame) => {
            let column = block
                .lines
                .iter()
                .filter_map(|l| STACK_FRAME.captures(l))
                .find(|caps| caps[2] == frame.file_path)
                .and_then(|caps| parse_number(&caps[4]));
            (frame.file_path.clone(), frame.line_number, column)
        }
        None => (
            block.suite.unwrap_or_default().to_string(),
            code_line.as_ref().map(|(n, _)| *n),
            None,
        ),
    };

    if let (Some((number, code)), Some(frame)) = (&code_line, frames.first_mut())
        && frame.line_number == Some(*number)
    {
        frame.code_line = Some(code.clone());
    }

    let (category, test_name) = if suite_failed {
        ("suite_error", None)
    } else {
        ("test_failure", Some(block.title.to_string()))
    };

    let mut record = ParsedError::new(Framework::Jest, Severity::Error, category, message)
        .at(file_path, line_number)
        .with_context(context_window(&block.lines, marker_index, options.context_lines));
    record.column = column;
    record.exception_type = exception_type;
    record.test_name = test_name;
    if options.include_traceback {
        record.traceback = frames;
    }
    record
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRACE: &str = r#"$ npx jest --ci
PASS src/utils/format.test.js
FAIL src/components/Button.test.js
  ● Button › renders label

    expect(received).toBe(expected) // Object.is equality

    Expected: "Save"
    Received: "Cancel"

      10 |   it('renders label', () => {
      11 |     render(<Button label="Save" />);
    > 12 |     expect(screen.getByRole('button').textContent).toBe('Save');
         |                                                    ^
      13 |   });

      at Object.<anonymous> (src/components/Button.test.js:12:52)

FAIL src/app.test.js
  ● Test suite failed to run

    Cannot find module './missing' from 'src/app.test.js'

      at Resolver.resolveModule (node_modules/jest-resolve/build/resolver.js:324:11)

Summary of all failing tests
FAIL src/components/Button.test.js
  ● Button › renders label

    expect(received).toBe(expected) // Object.is equality

      at Object.<anonymous> (src/components/Button.test.js:12:52)

Test Suites: 2 failed, 1 passed, 3 total
Tests:       1 failed, 4 passed, 5 total"#;

    fn parse(text: &str) -> Vec<ParsedError> {
        JestParser.parse(text, &ParseOptions::default()).unwrap()
    }

    #[test]
    fn test_failure_blocks_and_summary_dedup() {
        let records = parse(TRACE);
        assert_eq!(records.len(), 2);

        let button = &records[0];
        assert_eq!(button.category, "test_failure");
        assert_eq!(button.test_name.as_deref(), Some("Button › renders label"));
        assert_eq!(
            button.message,
            "expect(received).toBe(expected) // Object.is equality"
        );
        assert_eq!(button.file_path, "src/components/Button.test.js");
        assert_eq!(button.line_number, Some(12));
        assert_eq!(button.column, Some(52));
        assert_eq!(button.traceback.len(), 1);
        assert_eq!(button.traceback[0].function.as_deref(), Some("Object.<anonymous>"));
        assert!(button.traceback[0].code_line.as_deref().unwrap().contains("toBe('Save')"));
        assert!(button.context.contains("> 12 |"));
    }

    #[test]
    fn test_suite_failed_to_run() {
        let records = parse(TRACE);
        let suite = &records[1];
        assert_eq!(suite.category, "suite_error");
        assert_eq!(suite.test_name, None);
        assert_eq!(suite.file_path, "src/app.test.js");
        assert!(suite.message.starts_with("Cannot find module './missing'"));
        // node_modules frames are excluded by default
        assert!(suite.traceback.is_empty());
    }

    #[test]
    fn test_exception_type_is_split() {
        let text = "FAIL src/a.test.ts\n  ● loads\n\n    TypeError: Cannot read properties of undefined (reading 'id')\n\n      at load (src/a.ts:4:10)\n      at Object.<anonymous> (src/a.test.ts:9:3)\n";
        let records = parse(text);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].exception_type.as_deref(), Some("TypeError"));
        assert_eq!(records[0].file_path, "src/a.test.ts");
        assert_eq!(records[0].line_number, Some(9));
        assert_eq!(records[0].traceback.len(), 2);
    }

    #[test]
    fn test_failed_suite_without_blocks() {
        let records = parse("FAIL src/b.test.js\nTest Suites: 1 failed, 1 total");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].category, "suite_error");
        assert_eq!(records[0].file_path, "src/b.test.js");
    }

    #[test]
    fn test_passing_run_is_unrecognized() {
        assert!(matches!(
            JestParser.parse("PASS src/a.test.js\nTests: 3 passed", &ParseOptions::default()),
            Err(ParseError::Unrecognized { .. })
        ));
    }
}
