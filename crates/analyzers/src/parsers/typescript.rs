use lazy_static::lazy_static;
use regex::Regex;

use super::{TraceParser, context_window, finish, parse_number};
use crate::{
    model::{Framework, ParseError, ParseOptions, ParsedError, Severity},
    normalize::strip_ci_section_markers,
};

lazy_static! {
    /// `src/a.ts(3,7): error TS2322: ...`
    static ref PAREN_LOCATION: Regex =
        Regex::new(r"^\s*(\S.*?)\((\d+),(\d+)\): (error|warning) (TS\d+): (.+)$")
            .expect("valid regex");
    /// `src/a.ts:3:7 - error TS2322: ...` (`--pretty`)
    static ref COLON_LOCATION: Regex =
        Regex::new(r"^\s*(\S.*?):(\d+):(\d+) - (error|warning) (TS\d+): (.+)$")
            .expect("valid regex");
    /// `error TS5023: Unknown compiler option 'foo'.`
    static ref GLOBAL: Regex =
        Regex::new(r"^\s*(error|warning) (TS\d+): (.+)$").expect("valid regex");
}

pub struct TypeScriptParser;

impl TraceParser for TypeScriptParser {
    fn framework(&self) -> Framework {
        Framework::TypeScript
    }

    fn parse(&self, text: &str, options: &ParseOptions) -> Result<Vec<ParsedError>, ParseError> {
        if text.trim().is_empty() {
            return Err(ParseError::Empty);
        }

        let lines = strip_ci_section_markers(text);
        let mut records = Vec::new();

        for (index, line) in lines.iter().enumerate() {
            let (file_path, line_number, column, level, rule, message) =
                if let Some(caps) = PAREN_LOCATION
                    .captures(line)
                    .or_else(|| COLON_LOCATION.captures(line))
                {
                    (
                        caps[1].trim().to_string(),
                        parse_number(&caps[2]),
                        parse_number(&caps[3]),
                        caps[4].to_string(),
                        caps[5].to_string(),
                        caps[6].trim().to_string(),
                    )
                } else if let Some(caps) = GLOBAL.captures(line) {
                    (
                        String::new(),
                        None,
                        None,
                        caps[1].to_string(),
                        caps[2].to_string(),
                        caps[3].trim().to_string(),
                    )
                } else {
                    continue;
                };

            let level = if level == "warning" {
                Severity::Warning
            } else {
                Severity::Error
            };
            let mut record = ParsedError::new(Framework::TypeScript, level, "typescript", message)
                .at(file_path, line_number)
                .with_context(context_window(&lines, index, options.context_lines.min(2)));
            record.column = column;
            record.rule = Some(rule);
            records.push(record);
        }

        finish(Framework::TypeScript, records, options)
    }
}
