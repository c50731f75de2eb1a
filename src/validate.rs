//! Field-level rules shared by the per-resource validators.
//!
//! Everything here is a pure function over strings. None of it consults the
//! database, so validators built on top stay side-effect free.

use std::sync::LazyLock;

use regex::Regex;

use crate::models::{RawRecord, ValidationOutcome};

/// Hard cap on comment length, in words.
pub const MAX_COMMENT_WORDS: usize = 500;

/// Bodies shorter than this cannot exceed [`MAX_COMMENT_WORDS`] and skip the
/// word count entirely.
pub const SHORT_BODY_BYTES: usize = MAX_COMMENT_WORDS * 2;

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$").expect("invalid email regex")
});

static SLUG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]+(-[a-z0-9]+)*$").expect("invalid slug regex"));

/// `local@domain.tld` shape check.
pub fn is_valid_email(email: &str) -> bool {
    EMAIL_RE.is_match(email)
}

/// Lowercase alphanumeric words joined by single hyphens.
pub fn is_kebab_slug(slug: &str) -> bool {
    SLUG_RE.is_match(slug)
}

pub fn count_words(text: &str) -> usize {
    text.split_whitespace().count()
}

/// True when `body` has more than `max` words. Short bodies are decided
/// without counting.
pub fn exceeds_word_limit(body: &str, max: usize) -> bool {
    // A word needs at least one byte plus a separator.
    if body.len() <= SHORT_BODY_BYTES.min(max * 2) {
        return false;
    }
    count_words(body) > max
}

/// Adds a "<field> is required" error when the field is blank.
pub fn require(record: &RawRecord, field: &str, outcome: &mut ValidationOutcome) -> bool {
    if record.is_blank(field) {
        outcome.add_error(field, format!("{} is required", field));
        false
    } else {
        true
    }
}

/// Case-insensitive literal `true` / `false`.
pub fn parse_bool_literal(value: &str) -> Option<bool> {
    if value.eq_ignore_ascii_case("true") {
        Some(true)
    } else if value.eq_ignore_ascii_case("false") {
        Some(false)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_shapes() {
        assert!(is_valid_email("alice@example.com"));
        assert!(is_valid_email("a.b+tag@sub.example.io"));
        assert!(!is_valid_email("alice@example"));
        assert!(!is_valid_email("alice.example.com"));
        assert!(!is_valid_email("alice@@example.com"));
        assert!(!is_valid_email(""));
        assert!(!is_valid_email("a b@example.com"));
    }

    #[test]
    fn slug_shapes() {
        assert!(is_kebab_slug("hello-world"));
        assert!(is_kebab_slug("post-2024"));
        assert!(is_kebab_slug("a"));
        assert!(!is_kebab_slug("Hello-World"));
        assert!(!is_kebab_slug("hello--world"));
        assert!(!is_kebab_slug("-hello"));
        assert!(!is_kebab_slug("hello-"));
        assert!(!is_kebab_slug("hello_world"));
        assert!(!is_kebab_slug(""));
    }

    #[test]
    fn word_limit() {
        let short = "word ".repeat(10);
        assert!(!exceeds_word_limit(&short, MAX_COMMENT_WORDS));

        let exactly = vec!["w"; MAX_COMMENT_WORDS].join(" ");
        assert!(!exceeds_word_limit(&exactly, MAX_COMMENT_WORDS));

        let over = vec!["w"; MAX_COMMENT_WORDS + 1].join(" ");
        assert!(exceeds_word_limit(&over, MAX_COMMENT_WORDS));

        // Long but few words
        let wide = "x".repeat(5000);
        assert!(!exceeds_word_limit(&wide, MAX_COMMENT_WORDS));
    }

    #[test]
    fn bool_literals() {
        assert_eq!(parse_bool_literal("TRUE"), Some(true));
        assert_eq!(parse_bool_literal("false"), Some(false));
        assert_eq!(parse_bool_literal("yes"), None);
        assert_eq!(parse_bool_literal(""), None);
    }

    #[test]
    fn require_reports_blank() {
        let record: RawRecord = vec![("role", "  ")].into_iter().collect();
        let mut outcome = ValidationOutcome::new(2, None);
        assert!(!require(&record, "role", &mut outcome));
        assert_eq!(outcome.errors[0].message, "role is required");
    }
}
