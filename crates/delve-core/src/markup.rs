//! Lightweight markup normalization
//!
//! Stage generators are asked for rich markup (HTML). When one answers in
//! lightweight markup instead (`## heading`, `- bullet`, `**bold**`), the
//! output is converted with pulldown-cmark before the stages are joined.

use once_cell::sync::Lazy;
use pulldown_cmark::{html, Options, Parser};
use regex::Regex;

static LIGHTWEIGHT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^#{1,6}\s+\S|\*\*[^*\n]+\*\*|^\s*[-*+]\s+\S").expect("static pattern")
});

static RICH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)<(?:h[1-6]|p|ul|ol|table)[\s>]").expect("static pattern"));

/// Whether text uses lightweight markup rather than rich tags
#[must_use]
pub fn is_lightweight_markup(text: &str) -> bool {
    !RICH.is_match(text) && LIGHTWEIGHT.is_match(text)
}

/// Convert lightweight markup to rich markup
///
/// Deterministic; text content is preserved.
#[must_use]
pub fn normalize_markup(text: &str) -> String {
    let mut options = Options::empty();
    options.insert(Options::ENABLE_TABLES);
    options.insert(Options::ENABLE_STRIKETHROUGH);
    let parser = Parser::new_ext(text, options);
    let mut out = String::with_capacity(text.len() + text.len() / 2);
    html::push_html(&mut out, parser);
    out
}

/// Normalize only when the text needs it
#[must_use]
pub fn normalize_if_lightweight(text: &str) -> Option<String> {
    is_lightweight_markup(text).then(|| normalize_markup(text))
}
