//! Helpers for server text: `§` formatting codes and number extraction.

use std::sync::LazyLock;

use regex::Regex;

static FORMAT_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"§[0-9a-fk-orA-FK-OR]").expect("static regex"));

/// Remove `§x` color/formatting codes.
pub fn strip_formatting(text: &str) -> String {
    FORMAT_CODE.replace_all(text, "").into_owned()
}

/// Parse the amount that follows `marker` in `text`.
///
/// Formatting codes are stripped first; the longest run of digits and commas
/// directly after the marker is taken and thousands separators are removed.
/// Returns `None` when the marker is absent or no digits follow it.
pub fn amount_after(text: &str, marker: &str) -> Option<u64> {
    let clean = strip_formatting(text);
    let start = clean.find(marker)? + marker.len();
    let run: String = clean[start..]
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == ',')
        .filter(|c| *c != ',')
        .collect();
    run.parse().ok()
}
