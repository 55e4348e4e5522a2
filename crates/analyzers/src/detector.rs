//! Framework detection over `(job name, job stage, cleaned trace)`.
//!
//! Detectors are evaluated in [`Framework::BY_PRIORITY`] order and the first
//! match wins. Each predicate accepts either a strong content signal (a banner
//! only that tool prints) or a job name/stage hint backed by a weaker content
//! hint. `Generic` always matches, so detection is total.

use lazy_static::lazy_static;
use regex::Regex;

use crate::model::Framework;

lazy_static! {
    static ref SONAR_BANNER: Regex =
        Regex::new(r"QUALITY GATE STATUS|SonarScanner|sonar-scanner|SonarQube")
            .expect("valid regex");
    static ref SONAR_HINT: Regex = Regex::new(r"(?i)sonar|quality").expect("valid regex");

    static ref JEST_BANNER: Regex = Regex::new(
        r"(?m)^\s*Test Suites:|^\s*(?:PASS|FAIL)\s+\S+\.(?:test|spec)\.[jt]sx?\b"
    )
    .expect("valid regex");
    static ref JEST_HINT: Regex =
        Regex::new(r"(?i)jest|\bjs\b|frontend|\bunit[-_ ]?js").expect("valid regex");

    static ref TSC_BANNER: Regex = Regex::new(r"error TS\d{3,5}:").expect("valid regex");
    static ref TSC_HINT: Regex =
        Regex::new(r"(?i)\btsc\b|typecheck|type-check|types?[-_]?check").expect("valid regex");

    static ref ESLINT_BANNER: Regex =
        Regex::new(r"✖ \d+ problems? \(").expect("valid regex");
    static ref ESLINT_HINT: Regex = Regex::new(r"(?i)lint").expect("valid regex");

    static ref PYTEST_BANNER: Regex =
        Regex::new(r"=+ (?:test session starts|short test summary info) =+")
            .expect("valid regex");
    static ref PYTEST_HINT: Regex = Regex::new(r"(?i)test|pytest").expect("valid regex");
    static ref PYTEST_WEAK: Regex =
        Regex::new(r"(?m)^(?:FAILED|ERROR) \S+\.py|pytest").expect("valid regex");
}

/// Pick the parser family for a job.
///
/// Pure function of its three inputs.
pub fn detect_framework(job_name: &str, job_stage: &str, text: &str) -> Framework {
    Framework::BY_PRIORITY
        .into_iter()
        .find(|framework| matches(*framework, job_name, job_stage, text))
        .unwrap_or(Framework::Generic)
}

/// Whether `framework`'s predicate accepts this job.
pub fn matches(framework: Framework, job_name: &str, job_stage: &str, text: &str) -> bool {
    let hinted = |hint: &Regex| hint.is_match(job_name) || hint.is_match(job_stage);

    match framework {
        Framework::SonarQube => {
            SONAR_BANNER.is_match(text)
                || (hinted(&SONAR_HINT) && text.to_ascii_lowercase().contains("sonar"))
        }
        Framework::Jest => {
            JEST_BANNER.is_match(text) || (hinted(&JEST_HINT) && text.contains("jest"))
        }
        Framework::TypeScript => {
            TSC_BANNER.is_match(text) || (hinted(&TSC_HINT) && text.contains("tsc"))
        }
        Framework::EsLint => {
            ESLINT_BANNER.is_match(text) || (hinted(&ESLINT_HINT) && text.contains("eslint"))
        }
        Framework::Pytest => {
            PYTEST_BANNER.is_match(text) || (hinted(&PYTEST_HINT) && PYTEST_WEAK.is_match(text))
        }
        Framework::Generic => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pytest_banner() {
        let text = "============================= test session starts ==============================\nplatform linux";
        assert_eq!(detect_framework("build", "build", text), Framework::Pytest);
    }

    #[test]
    fn test_pytest_by_name_with_weak_content() {
        let text = "FAILED tests/test_api.py::test_login - AssertionError";
        assert_eq!(detect_framework("unit-tests", "test", text), Framework::Pytest);
        assert_eq!(detect_framework("deploy", "deploy", text), Framework::Generic);
    }

    #[test]
    fn test_jest_summary() {
        let text = "FAIL src/app.test.js\nTest Suites: 1 failed, 3 passed, 4 total";
        assert_eq!(detect_framework("test", "test", text), Framework::Jest);
    }

    #[test]
    fn test_typescript_errors() {
        let text = "src/index.ts(3,7): error TS2322: Type 'string' is not assignable to type 'number'.";
        assert_eq!(detect_framework("build", "build", text), Framework::TypeScript);
    }

    #[test]
    fn test_eslint_problem_count() {
        let text = "/builds/app/src/a.js\n  1:1  error  'x' is defined but never used  no-unused-vars\n\n✖ 1 problem (1 error, 0 warnings)";
        assert_eq!(detect_framework("lint", "test", text), Framework::EsLint);
    }

    #[test]
    fn test_sonar_wins_over_everything_else() {
        let text = "test session starts\nTest Suites: 1 failed\nerror TS2304: x\nQUALITY GATE STATUS: FAILED";
        assert_eq!(detect_framework("tests", "test", text), Framework::SonarQube);
    }

    #[test]
    fn test_higher_priority_signal_wins() {
        let text = "============================= test session starts ==============================\nsrc/a.ts(1,1): error TS2304: Cannot find name 'x'.";
        assert_eq!(detect_framework("check", "test", text), Framework::TypeScript);
    }

    #[test]
    fn test_nothing_recognized_falls_back_to_generic() {
        assert_eq!(
            detect_framework("build", "build", "make: *** [all] Error 2"),
            Framework::Generic
        );
        assert_eq!(detect_framework("", "", ""), Framework::Generic);
    }

    #[test]
    fn test_detection_is_deterministic() {
        let text = "FAIL src/a.spec.tsx\n  ● renders";
        let first = detect_framework("frontend", "test", text);
        for _ in 0..10 {
            assert_eq!(detect_framework("frontend", "test", text), first);
        }
        assert_eq!(first, Framework::Jest);
    }
}
