//! Terminal control sequence stripping for CI traces.
//!
//! GitLab runners forward raw terminal output, so traces are full of SGR
//! colour codes, cursor movement and the runner's own collapsible-section
//! markers. Parsers work on the cleaned text only.

use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;

lazy_static! {
    /// ESC followed by a single Fe byte (except `[`), or a full CSI sequence:
    /// `ESC [` parameter bytes, intermediate bytes, one final byte.
    static ref ANSI_ESCAPE: Regex =
        Regex::new(r"\x1B(?:[\x40-\x5A\x5C-\x5F]|\[[\x30-\x3F]*[\x20-\x2F]*[\x40-\x7E])")
            .expect("valid regex");
}

const SECTION_START: &str = "section_start:";
const SECTION_END: &str = "section_end:";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NormalizedTrace {
    pub cleaned_text: String,
    pub original_length: usize,
    pub cleaned_length: usize,
    pub sequences_removed: usize,
}

/// Remove ANSI escape sequences from `raw`.
///
/// Removal repeats until nothing matches, so sequences that only become
/// complete once an inner one is removed are stripped too and
/// `normalize(normalize(x).cleaned_text) == normalize(x)` in content.
pub fn normalize(raw: &str) -> NormalizedTrace {
    let original_length = raw.len();

    if !raw.contains('\x1B') {
        return NormalizedTrace {
            cleaned_text: raw.to_string(),
            original_length,
            cleaned_length: original_length,
            sequences_removed: 0,
        };
    }

    let mut cleaned = raw.to_string();
    let mut sequences_removed = 0;
    loop {
        let found = ANSI_ESCAPE.find_iter(&cleaned).count();
        if found == 0 {
            break;
        }
        sequences_removed += found;
        cleaned = ANSI_ESCAPE.replace_all(&cleaned, "").into_owned();
    }

    NormalizedTrace {
        cleaned_length: cleaned.len(),
        cleaned_text: cleaned,
        original_length,
        sequences_removed,
    }
}

/// Lines as a terminal would show them, for parsers to read.
///
/// The result has exactly one entry per line of `text`. Carriage-return
/// overwrites keep only the last segment, and GitLab `section_start:` /
/// `section_end:` bookkeeping lines become empty strings.
pub fn strip_ci_section_markers(text: &str) -> Vec<&str> {
    text.lines()
        .map(|line| {
            let visible = match line.rfind('\r') {
                Some(pos) => &line[pos + 1..],
                None => line,
            };
            if visible.starts_with(SECTION_START) || visible.starts_with(SECTION_END) {
                ""
            } else {
                visible
            }
        })
        .collect()
}
