use std::collections::HashSet;

use lazy_static::lazy_static;
use regex::Regex;

use super::{TraceParser, base_name, context_window, finish, parse_number, split_exception};
use crate::{
    model::{Framework, ParseError, ParseOptions, ParsedError, Severity, TracebackFrame},
    normalize::strip_ci_section_markers,
};

lazy_static! {
    static ref SECTION_HEADER: Regex = Regex::new(r"^={3,} (.+?) ={3,}$").expect("valid regex");
    static ref BLOCK_HEADER: Regex = Regex::new(r"^_{3,} (.+?) _{3,}$").expect("valid regex");
    static ref ERROR_LINE: Regex = Regex::new(r"^E\s+(.*)$").expect("valid regex");
    /// `path.py:12: in func`, `path.py:12: ValueError` or `path.py:12: `
    static ref LOCATION: Regex =
        Regex::new(r"^([^\s:][^:]*\.py):(\d+):\s*(.*)$").expect("valid regex");
    static ref EXCEPTION_NAME: Regex =
        Regex::new(r"^(?:[A-Za-z_]\w*\.)*[A-Z]\w*$").expect("valid regex");
    static ref SUMMARY_LINE: Regex =
        Regex::new(r"^(FAILED|ERROR) ([^\s:]+\.py)(?:::(\S+))?(?: - (.*))?\s*$")
            .expect("valid regex");
}

const COLLECTION_SIGNATURE: &str = "<collection>";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Failures,
    Errors,
    Other,
}

/// A `____ name ____` block inside the FAILURES or ERRORS section.
struct Block<'a> {
    name: &'a str,
    section: Section,
    lines: Vec<&'a str>,
}

pub struct PytestParser;

impl TraceParser for PytestParser {
    fn framework(&self) -> Framework {
        Framework::Pytest
    }

    fn parse(&self, text: &str, options: &ParseOptions) -> Result<Vec<ParsedError>, ParseError> {
        if text.trim().is_empty() {
            return Err(ParseError::Empty);
        }

        let lines = strip_ci_section_markers(text);
        let mut records = Vec::new();
        let mut seen: HashSet<(String, String)> = HashSet::new();
        let mut section = Section::Other;
        let mut current: Option<Block> = None;

        for &line in &lines {
            if let Some(caps) = SECTION_HEADER.captures(line) {
                if let Some(block) = current.take() {
                    push_block(block, options, &mut seen, &mut records);
                }
                section = match caps[1].trim() {
                    "FAILURES" => Section::Failures,
                    "ERRORS" => Section::Errors,
                    _ => Section::Other,
                };
                continue;
            }

            if section != Section::Other
                && let Some(caps) = BLOCK_HEADER.captures(line)
            {
                if let Some(block) = current.take() {
                    push_block(block, options, &mut seen, &mut records);
                }
                current = Some(Block {
                    name: caps.get(1).map_or("", |m| m.as_str()),
                    section,
                    lines: Vec::new(),
                });
                continue;
            }

            if let Some(caps) = SUMMARY_LINE.captures(line) {
                if let Some(block) = current.take() {
                    push_block(block, options, &mut seen, &mut records);
                }
                let record = summary_record(&caps, line);
                let signature = signature(&record.file_path, record.test_name.as_deref());
                if seen.insert(signature) {
                    records.push(record);
                }
                continue;
            }

            if let Some(block) = current.as_mut() {
                block.lines.push(line);
            }
        }
        if let Some(block) = current.take() {
            push_block(block, options, &mut seen, &mut records);
        }

        finish(Framework::Pytest, records, options)
    }
}

/// `(file base name, test function with parameters)`; collection errors use a
/// fixed test part so the block and its summary line collapse.
fn signature(file_path: &str, test_name: Option<&str>) -> (String, String) {
    let test = match test_name {
        Some(name) => normalize_test_name(name),
        None => COLLECTION_SIGNATURE.to_string(),
    };
    (base_name(file_path).to_string(), test)
}

/// `TestUser.test_create[a.b]` and `TestUser::test_create[a.b]` both become
/// `test_create[a.b]`.
fn normalize_test_name(name: &str) -> String {
    let (base, params) = match name.find('[') {
        Some(pos) => name.split_at(pos),
        None => (name, ""),
    };
    let function = base.rsplit(['.', ':']).find(|s| !s.is_empty()).unwrap_or(base);
    format!("{}{}", function.trim(), params)
}

fn summary_record(caps: &regex::Captures<'_>, line: &str) -> ParsedError {
    let kind = &caps[1];
    let file_path = caps[2].to_string();
    let test_name = caps.get(3).map(|m| m.as_str().to_string());
    let (exception_type, message) = match caps.get(4).map(|m| m.as_str().trim()) {
        Some(msg) if !msg.is_empty() => split_exception(msg),
        _ => (None, "Test failed".to_string()),
    };
    let category = match (kind, test_name.is_some()) {
        ("FAILED", _) => "test_failure",
        (_, true) => "setup_error",
        (_, false) => "collection_error",
    };

    let mut record = ParsedError::new(Framework::Pytest, Severity::Error, category, message)
        .at(file_path, None)
        .with_context(line.trim());
    record.exception_type = exception_type;
    record.test_name = test_name;
    record
}

fn push_block(
    block: Block<'_>,
    options: &ParseOptions,
    seen: &mut HashSet<(String, String)>,
    records: &mut Vec<ParsedError>,
) {
    let record = block_record(&block, options);
    let signature = signature(&record.file_path, record.test_name.as_deref());
    if seen.insert(signature) {
        records.push(record);
    }
}

fn block_record(block: &Block<'_>, options: &ParseOptions) -> ParsedError {
    let (category, test_name, collected_file) =
        if let Some(path) = block.name.strip_prefix("ERROR collecting ") {
            ("collection_error", None, Some(path.trim().to_string()))
        } else if let Some(test) = block.name.strip_prefix("ERROR at setup of ") {
            ("setup_error", Some(test.trim().to_string()), None)
        } else if let Some(test) = block.name.strip_prefix("ERROR at teardown of ") {
            ("teardown_error", Some(test.trim().to_string()), None)
        } else if block.section == Section::Errors {
            ("setup_error", Some(block.name.trim().to_string()), None)
        } else {
            ("test_failure", Some(block.name.trim().to_string()), None)
        };

    let mut frames: Vec<TracebackFrame> = Vec::new();
    let mut located_type: Option<String> = None;
    let mut last_code: Option<String> = None;
    let mut typed_error: Option<(String, String)> = None;
    let mut first_error_line: Option<String> = None;
    let mut first_error_index: Option<usize> = None;

    for (index, line) in block.lines.iter().enumerate() {
        if let Some(code) = line.trim_start().strip_prefix('>') {
            last_code = Some(code.trim().to_string());
            continue;
        }

        if let Some(caps) = ERROR_LINE.captures(line) {
            let content = caps[1].trim();
            if content.is_empty() {
                continue;
            }
            first_error_index.get_or_insert(index);
            if first_error_line.is_none() {
                first_error_line = Some(content.to_string());
            }
            if let (Some(exception_type), message) = split_exception(content) {
                typed_error = Some((exception_type, message));
            }
            continue;
        }

        if let Some(caps) = LOCATION.captures(line) {
            let path = caps[1].to_string();
            let line_number = parse_number(&caps[2]);
            let rest = caps[3].trim();
            let function = rest.strip_prefix("in ").map(|f| f.trim().to_string());
            if function.is_none() && EXCEPTION_NAME.is_match(rest) {
                located_type = Some(rest.to_string());
            }

            let duplicate_of_last = frames
                .last()
                .is_some_and(|f| f.file_path == path && f.line_number == line_number);
            if duplicate_of_last {
                if let Some(last) = frames.last_mut()
                    && last.function.is_none()
                {
                    last.function = function;
                }
            } else {
                frames.push(TracebackFrame {
                    file_path: path,
                    line_number,
                    code_line: last_code.take(),
                    function,
                });
            }
        }
    }

    let (exception_type, message) = match (typed_error, first_error_line) {
        (Some((exception_type, message)), _) => (Some(exception_type), message),
        (None, Some(line)) => (located_type, line),
        (None, None) => (located_type, "Test failed".to_string()),
    };

    let frames: Vec<TracebackFrame> = frames
        .into_iter()
        .filter(|frame| !options.is_excluded(&frame.file_path))
        .collect();

    let (file_path, line_number) = match (frames.first(), collected_file) {
        (_, Some(path)) => {
            let line = frames
                .iter()
                .find(|f| f.file_path == path)
                .and_then(|f| f.line_number);
            (path, line)
        }
        (Some(frame), None) => (frame.file_path.clone(), frame.line_number),
        (None, None) => (String::new(), None),
    };

    let anchor = first_error_index.unwrap_or(0);
    let mut record = ParsedError::new(Framework::Pytest, Severity::Error, category, message)
        .at(file_path, line_number)
        .with_context(context_window(&block.lines, anchor, options.context_lines));
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

    const TRACE: &str = r#"============================= test session starts ==============================
platform linux -- Python 3.11.4, pytest-7.4.0
collected 12 items / 1 error

==================================== ERRORS ====================================
_________________________ ERROR collecting tests/test_b.py _________________________
ImportError while importing test module '/builds/app/tests/test_b.py'.
tests/test_b.py:1: in <module>
    import foo
E   ModuleNotFoundError: No module named 'foo'
=================================== FAILURES ===================================
__________________________________ test_login __________________________________

    def test_login():
>       assert login("a") == True
E       AssertionError: assert False == True
E        +  where False = login('a')

tests/test_api.py:12: AssertionError
_________________________ TestUser.test_create[param1] _________________________

self = <tests.test_user.TestUser object at 0x7f>

    def test_create(self):
>       create_user()

tests/test_user.py:20:
_ _ _ _ _ _ _ _ _ _ _ _ _ _ _ _ _ _ _ _ _ _ _ _ _ _ _ _ _ _ _ _ _ _ _ _ _ _ _ _

>   raise ValueError("bad")
E   ValueError: bad

app/user.py:33: ValueError
=========================== short test summary info ============================
FAILED tests/test_api.py::test_login - AssertionError: assert False == True
FAILED tests/test_user.py::TestUser::test_create[param1] - ValueError: bad
ERROR tests/test_b.py - ModuleNotFoundError: No module named 'foo'
==================== 2 failed, 9 passed, 1 error in 0.52s ====================="#;

    fn parse(text: &str) -> Vec<ParsedError> {
        PytestParser.parse(text, &ParseOptions::default()).unwrap()
    }

    #[test]
    fn test_summary_repetitions_are_suppressed() {
        let records = parse(TRACE);
        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|r| r.source == Framework::Pytest));
    }

    #[test]
    fn test_failure_block_details() {
        let records = parse(TRACE);
        let login = records
            .iter()
            .find(|r| r.test_name.as_deref() == Some("test_login"))
            .unwrap();
        assert_eq!(login.category, "test_failure");
        assert_eq!(login.exception_type.as_deref(), Some("AssertionError"));
        assert_eq!(login.message, "assert False == True");
        assert_eq!(login.file_path, "tests/test_api.py");
        assert_eq!(login.line_number, Some(12));
        assert_eq!(
            login.traceback[0].code_line.as_deref(),
            Some(r#"assert login("a") == True"#)
        );
        assert!(login.context.contains("AssertionError"));
    }

    #[test]
    fn test_nested_traceback_keeps_test_file_as_location() {
        let records = parse(TRACE);
        let create = records
            .iter()
            .find(|r| r.test_name.as_deref() == Some("TestUser.test_create[param1]"))
            .unwrap();
        assert_eq!(create.exception_type.as_deref(), Some("ValueError"));
        assert_eq!(create.message, "bad");
        assert_eq!(create.file_path, "tests/test_user.py");
        assert_eq!(create.line_number, Some(20));
        assert_eq!(create.traceback.len(), 2);
        assert_eq!(create.traceback[1].file_path, "app/user.py");
        assert_eq!(
            create.traceback[1].code_line.as_deref(),
            Some(r#"raise ValueError("bad")"#)
        );
    }

    #[test]
    fn test_collection_error() {
        let records = parse(TRACE);
        let collection = records
            .iter()
            .find(|r| r.category == "collection_error")
            .unwrap();
        assert_eq!(collection.file_path, "tests/test_b.py");
        assert_eq!(collection.line_number, Some(1));
        assert_eq!(collection.exception_type.as_deref(), Some("ModuleNotFoundError"));
        assert_eq!(collection.test_name, None);
    }

    #[test]
    fn test_summary_only_output() {
        let text = "FAILED tests/test_x.py::test_one - KeyError: 'id'\nFAILED tests/test_x.py::test_two\nFAILED tests/test_x.py::test_one - KeyError: 'id'";
        let records = parse(text);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].exception_type.as_deref(), Some("KeyError"));
        assert_eq!(records[0].message, "'id'");
        assert_eq!(records[1].message, "Test failed");
        assert_eq!(records[1].file_path, "tests/test_x.py");
    }

    #[test]
    fn test_excluded_frames_are_dropped() {
        let text = "=== FAILURES ===\n___ test_dep ___\n.venv/lib/python3.11/site-packages/lib/core.py:10: in run\ntests/test_dep.py:5: in test_dep\nE   RuntimeError: boom\n\ntests/test_dep.py:5: RuntimeError";
        let records = parse(text);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].file_path, "tests/test_dep.py");
        assert_eq!(records[0].traceback.len(), 1);
        assert_eq!(records[0].traceback[0].function.as_deref(), Some("test_dep"));
    }

    #[test]
    fn test_normalize_test_name() {
        assert_eq!(normalize_test_name("TestUser.test_create[1.5]"), "test_create[1.5]");
        assert_eq!(normalize_test_name("TestUser::test_create[1.5]"), "test_create[1.5]");
        assert_eq!(normalize_test_name("test_plain"), "test_plain");
    }

    #[test]
    fn test_unrecognized_and_empty() {
        assert_eq!(
            PytestParser.parse("all good\n", &ParseOptions::default()),
            Err(ParseError::Unrecognized {
                framework: Framework::Pytest
            })
        );
        assert_eq!(
            PytestParser.parse("  \n", &ParseOptions::default()),
            Err(ParseError::Empty)
        );
    }
}
