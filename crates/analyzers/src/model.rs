use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use thiserror::Error;

/// Tool or ecosystem that produced a trace's format.
///
/// The set is closed: every framework carries its own detection priority and
/// parser, and [`Framework::BY_PRIORITY`] is the static detection order.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    EnumString,
    Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Framework {
    /// SonarQube / SonarScanner quality gate
    #[strum(serialize = "sonarqube")]
    #[serde(rename = "sonarqube")]
    SonarQube,
    /// Jest JavaScript test runner
    Jest,
    /// TypeScript compiler type checks (`tsc`)
    #[strum(serialize = "typescript")]
    #[serde(rename = "typescript")]
    TypeScript,
    /// ESLint linter
    #[strum(serialize = "eslint")]
    #[serde(rename = "eslint")]
    EsLint,
    /// pytest Python test runner
    Pytest,
    /// Line-based pattern matching fallback
    Generic,
}

impl Framework {
    /// Detection order, highest priority first. `Generic` is always last.
    pub const BY_PRIORITY: [Framework; 6] = [
        Framework::SonarQube,
        Framework::Jest,
        Framework::TypeScript,
        Framework::EsLint,
        Framework::Pytest,
        Framework::Generic,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Framework::SonarQube => "sonarqube",
            Framework::Jest => "jest",
            Framework::TypeScript => "typescript",
            Framework::EsLint => "eslint",
            Framework::Pytest => "pytest",
            Framework::Generic => "generic",
        }
    }

    pub fn priority(&self) -> u8 {
        match self {
            Framework::SonarQube => 100,
            Framework::Jest => 90,
            Framework::TypeScript => 80,
            Framework::EsLint => 70,
            Framework::Pytest => 60,
            Framework::Generic => 0,
        }
    }

    /// Test runners get a second, generic pass so failures that happen before
    /// the runner starts (imports, syntax errors) are still reported.
    pub fn is_test_runner(&self) -> bool {
        matches!(self, Framework::Jest | Framework::Pytest)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, Display, Default,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Severity {
    #[default]
    Error,
    Warning,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Error => "error",
            Severity::Warning => "warning",
        }
    }
}

/// One frame of a traceback / stack trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TracebackFrame {
    pub file_path: String,
    pub line_number: Option<u32>,
    pub code_line: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
}

/// Options shared by all parsers.
#[derive(Debug, Clone, PartialEq)]
pub struct ParseOptions {
    /// Attach traceback frames to records.
    pub include_traceback: bool,
    /// Path substrings whose frames are dropped from tracebacks.
    pub exclude_paths: Vec<String>,
    /// Lines of context kept on each side of a failure.
    pub context_lines: usize,
    /// Hard cap on records produced by one parser pass.
    pub max_errors: usize,
}

pub const DEFAULT_EXCLUDE_PATHS: &[&str] = &[
    "site-packages/",
    "dist-packages/",
    ".venv/",
    "venv/",
    "/usr/lib/python",
    "/usr/local/lib/python",
    "node_modules/",
    "internal/",
];

impl Default for ParseOptions {
    fn default() -> Self {
        Self {
            include_traceback: true,
            exclude_paths: DEFAULT_EXCLUDE_PATHS.iter().map(|s| s.to_string()).collect(),
            context_lines: 5,
            max_errors: 500,
        }
    }
}

impl ParseOptions {
    pub fn is_excluded(&self, path: &str) -> bool {
        self.exclude_paths
            .iter()
            .any(|pattern| !pattern.is_empty() && path.contains(pattern.as_str()))
    }
}

/// An error as extracted by a single parser, before standardization.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedError {
    pub source: Framework,
    pub level: Severity,
    pub category: String,
    pub message: String,
    pub exception_type: Option<String>,
    pub test_name: Option<String>,
    /// Empty when the parser could not attribute the error to a file.
    pub file_path: String,
    pub line_number: Option<u32>,
    pub column: Option<u32>,
    pub rule: Option<String>,
    pub context: String,
    pub traceback: Vec<TracebackFrame>,
}

impl ParsedError {
    pub fn new(
        source: Framework,
        level: Severity,
        category: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            source,
            level,
            category: category.into(),
            message: message.into(),
            exception_type: None,
            test_name: None,
            file_path: String::new(),
            line_number: None,
            column: None,
            rule: None,
            context: String::new(),
            traceback: Vec::new(),
        }
    }

    pub fn at(mut self, file_path: impl Into<String>, line_number: Option<u32>) -> Self {
        self.file_path = file_path.into();
        self.line_number = line_number;
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }
}

/// Parser output in the single cache schema.
///
/// `ordinal` is the record's position in the job's final, deduplicated list
/// and doubles as its addressable id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardError {
    pub ordinal: usize,
    pub level: Severity,
    pub category: String,
    pub message: String,
    pub exception_type: Option<String>,
    pub test_name: Option<String>,
    pub file_path: String,
    pub line_number: Option<u32>,
    pub column: Option<u32>,
    pub rule: Option<String>,
    pub context_snippet: String,
    pub traceback: Vec<TracebackFrame>,
    pub fingerprint: String,
    pub source_parser: Framework,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("{framework} parser found no recognizable structure")]
    Unrecognized { framework: Framework },
    #[error("trace is empty")]
    Empty,
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn test_priority_order_is_descending() {
        let priorities: Vec<u8> = Framework::BY_PRIORITY.iter().map(|f| f.priority()).collect();
        let mut sorted = priorities.clone();
        sorted.sort_by(|a, b| b.cmp(a));
        assert_eq!(priorities, sorted);
        assert_eq!(Framework::BY_PRIORITY.last(), Some(&Framework::Generic));
    }

    #[test]
    fn test_framework_string_round_trip() {
        for framework in Framework::BY_PRIORITY {
            assert_eq!(Framework::from_str(framework.as_str()).unwrap(), framework);
            assert_eq!(framework.to_string(), framework.as_str());
        }
    }

    #[test]
    fn test_default_excludes_virtualenv_and_stdlib() {
        let options = ParseOptions::default();
        assert!(options.is_excluded("/builds/app/.venv/lib/python3.11/site-packages/_pytest/runner.py"));
        assert!(options.is_excluded("/usr/lib/python3.11/unittest/case.py"));
        assert!(!options.is_excluded("tests/test_api.py"));
    }

    #[test]
    fn test_only_test_runners_are_hybrid() {
        assert!(Framework::Pytest.is_test_runner());
        assert!(Framework::Jest.is_test_runner());
        assert!(!Framework::EsLint.is_test_runner());
        assert!(!Framework::Generic.is_test_runner());
    }
}
