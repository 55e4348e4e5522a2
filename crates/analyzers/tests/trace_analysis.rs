//! End-to-end tests for trace analysis through [`AnalysisEngine`]:
//! - detector precedence across frameworks
//! - hybrid pytest parsing with duplicate-summary and cross-parser dedup
//! - normalization idempotence

use std::collections::HashSet;

use analyzers::{AnalysisEngine, Framework, detect_framework, normalize};

/// Wrap script output the way a GitLab runner does.
fn gitlab_trace(body: &str) -> String {
    format!(
        "\x1b[0KRunning with gitlab-runner 16.5.0\n\
         \x1b[0Ksection_start:1700000000:step_script\r\x1b[0K\x1b[36;1mExecuting \"step_script\" stage of the job script\x1b[0;m\n\
         {body}\n\
         \x1b[0Ksection_end:1700000001:step_script\r\x1b[0K\n\
         \x1b[31;1mERROR: Job failed: exit code 1\x1b[0;m\n"
    )
}

const PYTEST_BODY: &str = "\x1b[32m$ pytest -q\x1b[0m
============================= test session starts ==============================
collected 2 items

tests/test_api.py F.                                                     [100%]

=================================== FAILURES ===================================
__________________________________ test_login __________________________________

    def test_login():
>       assert login(\"a\") == True
E       AssertionError: assert False == True

tests/test_api.py:12: AssertionError
=========================== short test summary info ============================
\x1b[31mFAILED\x1b[0m tests/test_api.py::test_login - AssertionError: assert False == True
========================= 1 failed, 1 passed in 0.12s ==========================";

#[test]
fn pytest_hybrid_parse_collapses_to_one_record() {
    let engine = AnalysisEngine::default();
    let analysis = engine.analyze("pytest", "test", &gitlab_trace(PYTEST_BODY));

    assert_eq!(analysis.framework, Framework::Pytest);
    assert!(analysis.hybrid);
    assert_eq!(analysis.parsers_used, vec![Framework::Pytest, Framework::Generic]);
    // The generic pass sees both the `E` line and the summary line.
    assert_eq!(analysis.duplicates_removed, 2);
    assert_eq!(analysis.errors.len(), 1);

    let error = &analysis.errors[0];
    assert_eq!(error.ordinal, 0);
    assert_eq!(error.source_parser, Framework::Pytest);
    assert_eq!(error.test_name.as_deref(), Some("test_login"));
    assert_eq!(error.file_path, "tests/test_api.py");
    assert_eq!(error.fingerprint, "assert false == true|test_api.py");
    assert!(analysis.sequences_removed > 0);
}

#[test]
fn hybrid_fingerprints_are_unique() {
    let body = "============================= test session starts ==============================
=================================== FAILURES ===================================
__________________________________ test_one __________________________________
E       KeyError: 'id'

tests/test_a.py:3: KeyError
__________________________________ test_two __________________________________
E       ValueError: bad

tests/test_b.py:9: ValueError
=========================== short test summary info ============================
FAILED tests/test_a.py::test_one - KeyError: 'id'
FAILED tests/test_b.py::test_two - ValueError: bad
FAILED tests/test_b.py::test_two - ValueError: bad
DeprecationWarning: datetime.utcnow() is deprecated";
    let analysis = AnalysisEngine::default().analyze("unit", "test", body);

    assert!(analysis.hybrid);
    let fingerprints: HashSet<&str> =
        analysis.errors.iter().map(|e| e.fingerprint.as_str()).collect();
    assert_eq!(fingerprints.len(), analysis.errors.len());
    assert_eq!(analysis.error_count(), 2);
    assert_eq!(analysis.warning_count(), 1);
    let ordinals: Vec<usize> = analysis.errors.iter().map(|e| e.ordinal).collect();
    assert_eq!(ordinals, (0..analysis.errors.len()).collect::<Vec<_>>());
}

#[test]
fn jest_without_generic_hits_is_not_hybrid() {
    let body = "FAIL src/cart.test.js
  ● cart › adds item

    expect(received).toEqual(expected)

      at Object.<anonymous> (src/cart.test.js:7:20)

Test Suites: 1 failed, 1 total";
    let analysis = AnalysisEngine::default().analyze("jest", "test", &gitlab_trace(body));

    assert_eq!(analysis.framework, Framework::Jest);
    assert!(!analysis.hybrid);
    assert_eq!(analysis.parsers_used, vec![Framework::Jest]);
    assert_eq!(analysis.duplicates_removed, 0);
    assert_eq!(analysis.errors.len(), 1);
    assert_eq!(analysis.errors[0].line_number, Some(7));
}

#[test]
fn single_parser_jobs_keep_repeated_messages() {
    let body = "src/a.js
  1:1  error  Missing semicolon  semi
  4:1  error  Missing semicolon  semi

✖ 2 problems (2 errors, 0 warnings)";
    let analysis = AnalysisEngine::default().analyze("lint", "test", body);

    assert_eq!(analysis.framework, Framework::EsLint);
    assert_eq!(analysis.errors.len(), 2);
    assert_eq!(analysis.errors[0].fingerprint, analysis.errors[1].fingerprint);
}

#[test]
fn detector_precedence_follows_priority() {
    let cases = [
        ("sonar", "quality", "INFO: SonarScanner 5.0\nerror TS2304: x", Framework::SonarQube),
        ("test", "test", "Test Suites: 1 failed\n=== test session starts ===", Framework::Jest),
        ("build", "build", "a.ts(1,1): error TS1005: ';' expected.\n✖ 1 problem (", Framework::TypeScript),
        ("lint", "lint", "✖ 4 problems (4 errors, 0 warnings)\n=== test session starts ===", Framework::EsLint),
        ("build", "build", "=== short test summary info ===", Framework::Pytest),
        ("build", "build", "cc1: fatal error", Framework::Generic),
    ];
    for (name, stage, text, expected) in cases {
        assert_eq!(detect_framework(name, stage, text), expected, "{text}");
    }
}

#[test]
fn analysis_is_idempotent_over_normalization() {
    let engine = AnalysisEngine::default();
    let raw = gitlab_trace(PYTEST_BODY);
    let cleaned = normalize(&raw).cleaned_text;

    assert_eq!(normalize(&cleaned).cleaned_text, cleaned);

    let first = engine.analyze("pytest", "test", &raw);
    let second = engine.analyze("pytest", "test", &cleaned);
    assert_eq!(first.errors, second.errors);
    assert_eq!(second.sequences_removed, 0);
}
