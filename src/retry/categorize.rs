//! Fallback categorization for errors that do not carry a category.
//!
//! Typed [`ResilienceError`]s report their own category; the message patterns
//! below are only consulted for untyped failures from uncontrolled sources.

use crate::core::{ErrorCategory, ResilienceError};
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    // Checked in order; earlier patterns win.
    static ref MESSAGE_PATTERNS: Vec<(ErrorCategory, Regex)> = vec![
        (
            ErrorCategory::RateLimit,
            Regex::new(r"(?i)rate.?limit|too many requests|\b429\b").unwrap(),
        ),
        (
            ErrorCategory::Timeout,
            Regex::new(r"(?i)timed?[ -]?out|etimedout|deadline exceeded|\b408\b|\b504\b").unwrap(),
        ),
        (
            ErrorCategory::Authentication,
            Regex::new(
                r"(?i)\b401\b|unauthori[sz]ed|unauthenticated|not authenticated|invalid (api )?(token|key)|api key"
            )
            .unwrap(),
        ),
        (
            ErrorCategory::Authorization,
            Regex::new(
                r"(?i)\b403\b|forbidden|permission denied|access denied|insufficient permissions|restricted.resource"
            )
            .unwrap(),
        ),
        (
            ErrorCategory::NotFound,
            Regex::new(r"(?i)\b404\b|not.?found|does not exist").unwrap(),
        ),
        (
            ErrorCategory::Conflict,
            Regex::new(r"(?i)\b409\b|conflict|already exists|version mismatch").unwrap(),
        ),
        (
            ErrorCategory::Parse,
            Regex::new(r"(?i)\bparse|unexpected token|invalid json|malformed|syntax ?error|deserializ").unwrap(),
        ),
        (
            ErrorCategory::Validation,
            Regex::new(r"(?i)\b400\b|\b422\b|validation|invalid|required field|bad request").unwrap(),
        ),
        (
            ErrorCategory::Server,
            Regex::new(r"(?i)\b5\d\d\b|internal server error|bad gateway|service unavailable|server error").unwrap(),
        ),
        (
            ErrorCategory::Network,
            Regex::new(
                r"(?i)network|failed to fetch|fetch failed|econnrefused|econnreset|enotfound|connection (refused|reset|closed|lost)|offline|dns"
            )
            .unwrap(),
        ),
        (
            ErrorCategory::Business,
            Regex::new(r"(?i)business rule|not allowed|not permitted in state").unwrap(),
        ),
    ];
}

/// Heuristic category of a free-form error message. Total: `Unknown` when nothing matches.
pub fn categorize_message(message: &str) -> ErrorCategory {
    MESSAGE_PATTERNS
        .iter()
        .find(|(_, pattern)| pattern.is_match(message))
        .map(|(category, _)| *category)
        .unwrap_or(ErrorCategory::Unknown)
}

/// Category of any error, with an optional context string used as a tiebreaker
/// when the message alone says nothing.
///
/// Pure: no I/O, no logging, no shared state.
pub fn categorize_error(
    err: &(dyn std::error::Error + 'static),
    context: Option<&str>,
) -> ErrorCategory {
    if let Some(typed) = err.downcast_ref::<ResilienceError>() {
        return typed.category();
    }
    if let Some(io) = err.downcast_ref::<std::io::Error>() {
        let category = ResilienceError::from(std::io::Error::new(io.kind(), io.to_string())).category();
        if category != ErrorCategory::Unknown {
            return category;
        }
    }

    match categorize_message(&err.to_string()) {
        ErrorCategory::Unknown => context
            .map(categorize_message)
            .unwrap_or(ErrorCategory::Unknown),
        category => category,
    }
}
