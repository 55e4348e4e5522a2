use lazy_static::lazy_static;
use regex::Regex;

use super::{TraceParser, context_window, finish};
use crate::{
    model::{Framework, ParseError, ParseOptions, ParsedError, Severity},
    normalize::strip_ci_section_markers,
};

lazy_static! {
    /// Optional scanner timestamp, optional `[thread]`, then the level.
    static ref LOG_LINE: Regex = Regex::new(
        r"^(?:\d{2}:\d{2}:\d{2}(?:\.\d+)?\s+)?(?:\[[^\]]*\]\s+)?(ERROR|WARN|WARNING):?\s+(.+)$"
    )
    .expect("valid regex");
    static ref QUALITY_GATE: Regex =
        Regex::new(r"QUALITY GATE STATUS:\s*([A-Z_]+)").expect("valid regex");
}

/// Scanner and runner chatter that follows a real error.
const IGNORED_PREFIXES: &[&str] = &[
    "Re-run SonarScanner using the -X switch",
    "To see the full stack trace",
    "Job failed",
];

pub struct SonarQubeParser;

impl TraceParser for SonarQubeParser {
    fn framework(&self) -> Framework {
        Framework::SonarQube
    }

    fn parse(&self, text: &str, options: &ParseOptions) -> Result<Vec<ParsedError>, ParseError> {
        if text.trim().is_empty() {
            return Err(ParseError::Empty);
        }

        let lines = strip_ci_section_markers(text);
        let radius = options.context_lines.min(3);
        let mut records = Vec::new();

        for (index, line) in lines.iter().enumerate() {
            if let Some(caps) = QUALITY_GATE.captures(line) {
                let status = &caps[1];
                if status != "OK" && status != "PASSED" {
                    records.push(
                        ParsedError::new(
                            Framework::SonarQube,
                            Severity::Error,
                            "quality_gate",
                            format!("Quality gate status: {status}"),
                        )
                        .with_context(context_window(&lines, index, radius)),
                    );
                }
                continue;
            }

            let Some(caps) = LOG_LINE.captures(line) else {
                continue;
            };
            let message = caps[2].trim();
            if message.is_empty() || IGNORED_PREFIXES.iter().any(|p| message.starts_with(p)) {
                continue;
            }
            let level = if &caps[1] == "ERROR" {
                Severity::Error
            } else {
                Severity::Warning
            };
            records.push(
                ParsedError::new(Framework::SonarQube, level, "sonarqube", message)
                    .with_context(context_window(&lines, index, radius)),
            );
        }

        finish(Framework::SonarQube, records, options)
    }
}
