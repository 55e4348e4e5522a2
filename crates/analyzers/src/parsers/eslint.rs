use lazy_static::lazy_static;
use regex::Regex;

use super::{TraceParser, context_window, finish, parse_number};
use crate::{
    model::{Framework, ParseError, ParseOptions, ParsedError, Severity},
    normalize::strip_ci_section_markers,
};

lazy_static! {
    /// File header of the stylish formatter: a bare path on its own line.
    static ref STYLISH_FILE: Regex =
        Regex::new(r"^(/?[\w@.\-\[\]()+]+(?:/[\w@.\-\[\]()+]+)*\.[A-Za-z]{1,6})\s*$")
            .expect("valid regex");
    static ref STYLISH_ENTRY: Regex =
        Regex::new(r"^\s+(\d+):(\d+)\s+(error|warning)\s+(.+?)(?:\s{2,}(\S+))?\s*$")
            .expect("valid regex");
    /// `path:line:col: message [Error/rule]`
    static ref UNIX_ENTRY: Regex =
        Regex::new(r"^(\S.*?):(\d+):(\d+): (.+?) \[(Error|Warning)(?:/(\S+))?\]\s*$")
            .expect("valid regex");
}

pub struct EsLintParser;

impl TraceParser for EsLintParser {
    fn framework(&self) -> Framework {
        Framework::EsLint
    }

    fn parse(&self, text: &str, options: &ParseOptions) -> Result<Vec<ParsedError>, ParseError> {
        if text.trim().is_empty() {
            return Err(ParseError::Empty);
        }

        let lines = strip_ci_section_markers(text);
        let radius = options.context_lines.min(2);
        let mut records = Vec::new();
        let mut current_file: Option<&str> = None;

        for (index, &line) in lines.iter().enumerate() {
            if let Some(caps) = UNIX_ENTRY.captures(line) {
                let level = level(&caps[5]);
                let mut record =
                    ParsedError::new(Framework::EsLint, level, "eslint", caps[4].trim())
                        .at(caps[1].trim(), parse_number(&caps[2]))
                        .with_context(context_window(&lines, index, radius));
                record.column = parse_number(&caps[3]);
                record.rule = caps.get(6).map(|m| m.as_str().to_string());
                records.push(record);
                continue;
            }

            if let Some(caps) = STYLISH_ENTRY.captures(line) {
                let level = level(&caps[3]);
                let mut record =
                    ParsedError::new(Framework::EsLint, level, "eslint", caps[4].trim())
                        .at(current_file.unwrap_or_default(), parse_number(&caps[1]))
                        .with_context(context_window(&lines, index, radius));
                record.column = parse_number(&caps[2]);
                record.rule = caps.get(5).map(|m| m.as_str().to_string());
                records.push(record);
                continue;
            }

            if let Some(caps) = STYLISH_FILE.captures(line) {
                current_file = caps.get(1).map(|m| m.as_str());
            } else if line.trim().is_empty() {
                current_file = None;
            }
        }

        finish(Framework::EsLint, records, options)
    }
}

fn level(value: &str) -> Severity {
    if value.eq_ignore_ascii_case("warning") {
        Severity::Warning
    } else {
        Severity::Error
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stylish_format() {
        let text = "$ npx eslint .\n\n/builds/web/src/app.js\n   3:7   error    'unused' is assigned a value but never used  no-unused-vars\n  12:1   warning  Unexpected console statement                 no-console\n\n/builds/web/src/util.ts\n  1:1  error  Parsing error: Unexpected token\n\n✖ 3 problems (2 errors, 1 warning)";
        let records = EsLintParser.parse(text, &ParseOptions::default()).unwrap();
        assert_eq!(records.len(), 3);

        assert_eq!(records[0].file_path, "/builds/web/src/app.js");
        assert_eq!(records[0].line_number, Some(3));
        assert_eq!(records[0].column, Some(7));
        assert_eq!(records[0].rule.as_deref(), Some("no-unused-vars"));
        assert_eq!(
            records[0].message,
            "'unused' is assigned a value but never used"
        );

        assert_eq!(records[1].level, Severity::Warning);
        assert_eq!(records[1].rule.as_deref(), Some("no-console"));

        assert_eq!(records[2].file_path, "/builds/web/src/util.ts");
        assert_eq!(records[2].rule, None);
        assert_eq!(records[2].message, "Parsing error: Unexpected token");
        assert!(records.iter().all(|r| r.category == "eslint"));
    }

    #[test]
    fn test_unix_format() {
        let text = "src/app.js:3:7: 'x' is defined but never used. [Error/no-unused-vars]\nsrc/app.js:9:1: Unexpected console statement. [Warning/no-console]";
        let records = EsLintParser.parse(text, &ParseOptions::default()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].file_path, "src/app.js");
        assert_eq!(records[0].rule.as_deref(), Some("no-unused-vars"));
        assert_eq!(records[0].message, "'x' is defined but never used.");
        assert_eq!(records[1].level, Severity::Warning);
    }

    #[test]
    fn test_clean_run_is_unrecognized() {
        assert!(EsLintParser
            .parse("$ npx eslint .\nDone", &ParseOptions::default())
            .is_err());
    }
}
