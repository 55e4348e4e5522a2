//! One parser per [`Framework`].
//!
//! Parsers read the cleaned trace line by line (see
//! [`crate::normalize::strip_ci_section_markers`]) and never see terminal
//! escapes. A specialised parser that cannot find its tool's structure returns
//! [`ParseError::Unrecognized`] and the engine moves on to the next attempt.

use lazy_static::lazy_static;
use regex::Regex;

use crate::model::{Framework, ParseError, ParseOptions, ParsedError};

pub mod eslint;
pub mod generic;
pub mod jest;
pub mod pytest;
pub mod sonarqube;
pub mod typescript;

pub use eslint::EsLintParser;
pub use generic::GenericParser;
pub use jest::JestParser;
pub use pytest::PytestParser;
pub use sonarqube::SonarQubeParser;
pub use typescript::TypeScriptParser;

pub trait TraceParser: Send + Sync {
    fn framework(&self) -> Framework;

    fn parse(&self, text: &str, options: &ParseOptions) -> Result<Vec<ParsedError>, ParseError>;
}

/// Parser registered for `framework`.
pub fn parser_for(framework: Framework) -> &'static dyn TraceParser {
    match framework {
        Framework::SonarQube => &SonarQubeParser,
        Framework::Jest => &JestParser,
        Framework::TypeScript => &TypeScriptParser,
        Framework::EsLint => &EsLintParser,
        Framework::Pytest => &PytestParser,
        Framework::Generic => &GenericParser,
    }
}

lazy_static! {
    /// `Type: message` where `Type` looks like an exception class name,
    /// optionally module-qualified.
    static ref EXCEPTION_PREFIX: Regex =
        Regex::new(r"^((?:[A-Za-z_]\w*\.)*[A-Z]\w*):\s+(.+)$").expect("valid regex");
}

/// Split `"ValueError: bad value"` into `(Some("ValueError"), "bad value")`.
/// Anything else comes back unchanged with no type.
pub(crate) fn split_exception(message: &str) -> (Option<String>, String) {
    let message = message.trim();
    match EXCEPTION_PREFIX.captures(message) {
        Some(caps) => (Some(caps[1].to_string()), caps[2].trim().to_string()),
        None => (None, message.to_string()),
    }
}

/// Lines `index - radius ..= index + radius`, clamped, with blank lines
/// trimmed from both ends.
pub(crate) fn context_window(lines: &[&str], index: usize, radius: usize) -> String {
    if lines.is_empty() {
        return String::new();
    }
    let index = index.min(lines.len() - 1);
    let start = index.saturating_sub(radius);
    let end = (index + radius + 1).min(lines.len());

    let window = &lines[start..end];
    let first = window.iter().position(|l| !l.trim().is_empty());
    let last = window.iter().rposition(|l| !l.trim().is_empty());
    match (first, last) {
        (Some(first), Some(last)) => window[first..=last].join("\n"),
        _ => String::new(),
    }
}

pub(crate) fn base_name(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

pub(crate) fn parse_number(value: &str) -> Option<u32> {
    value.trim().parse().ok()
}

/// Common tail of every parser: enforce the record cap and turn an empty
/// result into `Unrecognized`.
pub(crate) fn finish(
    framework: Framework,
    mut records: Vec<ParsedError>,
    options: &ParseOptions,
) -> Result<Vec<ParsedError>, ParseError> {
    if records.is_empty() {
        return Err(ParseError::Unrecognized { framework });
    }
    if records.len() > options.max_errors {
        tracing::debug!(
            parser = %framework,
            found = records.len(),
            max_errors = options.max_errors,
            "Truncating parser output"
        );
        records.truncate(options.max_errors);
    }
    Ok(records)
}
