//! Extraction of the rewritten prompt from a chain-of-thought response
//!
//! The model answers with a reasoning block delimited by `<think>` and
//! `</think>`, followed by the rewritten prompt. Both delimiters end in the
//! same boundary marker, so a well-formed response contains it exactly twice.

use regex::Regex;
use std::sync::OnceLock;

use crate::types::StageError;

/// Substring closing both the opening and closing reasoning tags
pub const BOUNDARY_MARKER: &str = "think>";

/// Number of marker occurrences a well-formed response carries
const EXPECTED_MARKERS: usize = 2;

fn single_quote_pair() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\B'([^']*)'\B").expect("static pattern compiles"))
}

/// Validate the marker contract and return the normalized final segment.
pub fn sanitize(raw: &str) -> Result<String, StageError> {
    let occurrences = raw.matches(BOUNDARY_MARKER).count();
    if occurrences != EXPECTED_MARKERS {
        return Err(StageError::MalformedOutput { occurrences });
    }

    let answer = raw.rsplit(BOUNDARY_MARKER).next().unwrap_or_default();
    let answer = answer.strip_prefix('\n').unwrap_or(answer);

    Ok(normalize_quotes(answer))
}

/// Rewrite emphasis quotes as double quotes.
///
/// Straight single-quote pairs count only when neither quote touches a word
/// character on its outer side, so apostrophes inside words survive. Curly
/// single quotes are converted everywhere.
pub fn normalize_quotes(text: &str) -> String {
    single_quote_pair()
        .replace_all(text, "\"$1\"")
        .replace('\u{2019}', "\u{201D}")
        .replace('\u{2018}', "\u{201C}")
}
