use serde::Serialize;

use crate::{
    PARSER_VERSION,
    detector::detect_framework,
    model::{Framework, ParseOptions, ParsedError, Severity, StandardError},
    normalize::normalize,
    parsers::parser_for,
    standardize::{deduplicate, standardize},
};

/// Result of analyzing one job trace.
#[derive(Debug, Clone, Serialize)]
pub struct TraceAnalysis {
    pub framework: Framework,
    pub parser_version: i64,
    pub original_length: usize,
    pub cleaned_length: usize,
    pub sequences_removed: usize,
    /// Parsers whose records made it into `errors`, in run order.
    pub parsers_used: Vec<Framework>,
    /// Both the specialised and the generic pass produced records.
    pub hybrid: bool,
    pub duplicates_removed: usize,
    pub errors: Vec<StandardError>,
}

impl TraceAnalysis {
    pub fn error_count(&self) -> usize {
        self.errors
            .iter()
            .filter(|e| e.level == Severity::Error)
            .count()
    }

    pub fn warning_count(&self) -> usize {
        self.errors
            .iter()
            .filter(|e| e.level == Severity::Warning)
            .count()
    }
}

#[derive(Debug, Clone, Default)]
pub struct AnalysisEngine {
    options: ParseOptions,
}

impl AnalysisEngine {
    pub fn new(options: ParseOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &ParseOptions {
        &self.options
    }

    pub fn parser_version(&self) -> i64 {
        PARSER_VERSION
    }

    /// Normalize, detect, parse and standardize one trace.
    pub fn analyze(&self, job_name: &str, job_stage: &str, raw_trace: &str) -> TraceAnalysis {
        let normalized = normalize(raw_trace);
        let framework = detect_framework(job_name, job_stage, &normalized.cleaned_text);

        let (records, parsers_used, hybrid, duplicates_removed) = if framework.is_test_runner() {
            self.run_hybrid(framework, &normalized.cleaned_text)
        } else {
            let (records, used) = self.run_attempts(framework, &normalized.cleaned_text);
            (records, used, false, 0)
        };

        let mut records = records;
        records.truncate(self.options.max_errors);
        let errors = standardize(records);

        tracing::debug!(
            job_name,
            framework = %framework,
            errors = errors.len(),
            hybrid,
            duplicates_removed,
            sequences_removed = normalized.sequences_removed,
            "Analyzed trace"
        );

        TraceAnalysis {
            framework,
            parser_version: PARSER_VERSION,
            original_length: normalized.original_length,
            cleaned_length: normalized.cleaned_length,
            sequences_removed: normalized.sequences_removed,
            parsers_used,
            hybrid,
            duplicates_removed,
            errors,
        }
    }

    /// Specialised pass then generic pass; deduplicated only when both
    /// produced records.
    fn run_hybrid(
        &self,
        framework: Framework,
        text: &str,
    ) -> (Vec<ParsedError>, Vec<Framework>, bool, usize) {
        let specialised = self.run_one(framework, text);
        let generic = self.run_one(Framework::Generic, text);

        let mut parsers_used = Vec::new();
        if !specialised.is_empty() {
            parsers_used.push(framework);
        }
        if !generic.is_empty() {
            parsers_used.push(Framework::Generic);
        }
        if parsers_used.is_empty() {
            parsers_used.push(framework);
        }

        let hybrid = !specialised.is_empty() && !generic.is_empty();
        let mut combined = specialised;
        combined.extend(generic);

        if hybrid {
            let (kept, removed) = deduplicate(combined);
            (kept, parsers_used, true, removed)
        } else {
            (combined, parsers_used, false, 0)
        }
    }

    /// First parser in `[framework, Generic]` with a non-empty result wins.
    fn run_attempts(&self, framework: Framework, text: &str) -> (Vec<ParsedError>, Vec<Framework>) {
        let mut attempts = vec![framework];
        if framework != Framework::Generic {
            attempts.push(Framework::Generic);
        }

        for attempt in &attempts {
            let records = self.run_one(*attempt, text);
            if !records.is_empty() {
                return (records, vec![*attempt]);
            }
        }
        (Vec::new(), vec![Framework::Generic])
    }

    fn run_one(&self, framework: Framework, text: &str) -> Vec<ParsedError> {
        match parser_for(framework).parse(text, &self.options) {
            Ok(records) => records,
            Err(e) => {
                tracing::debug!(parser = %framework, "Parser produced no records: {}", e);
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_runner_falls_back_to_generic() {
        let engine = AnalysisEngine::default();
        // Detected as TypeScript by name, but holds no TS diagnostics.
        let trace = "$ tsc --noEmit\nnpm ERR! code ELIFECYCLE";
        let analysis = engine.analyze("typecheck", "test", trace);
        assert_eq!(analysis.framework, Framework::TypeScript);
        assert_eq!(analysis.parsers_used, vec![Framework::Generic]);
        assert_eq!(analysis.errors.len(), 1);
        assert_eq!(analysis.errors[0].source_parser, Framework::Generic);
        assert!(!analysis.hybrid);
    }

    #[test]
    fn test_empty_trace() {
        let analysis = AnalysisEngine::default().analyze("build", "build", "");
        assert_eq!(analysis.framework, Framework::Generic);
        assert!(analysis.errors.is_empty());
        assert_eq!(analysis.error_count(), 0);
    }

    #[test]
    fn test_counts_by_level() {
        let trace = "warning: unused import\nerror: linking failed";
        let analysis = AnalysisEngine::default().analyze("build", "build", trace);
        assert_eq!(analysis.error_count(), 1);
        assert_eq!(analysis.warning_count(), 1);
        assert_eq!(analysis.parser_version, PARSER_VERSION);
    }
}
