//! Image reference validation.
//!
//! Every image reference reaching this crate is untrusted. It is checked here
//! before any code path builds a command line around it, and checked again by
//! the image scanner right before the first process spawn.

use once_cell::sync::Lazy;
use regex::Regex;

/// Characters permitted in an image reference. Excludes every shell
/// metacharacter and all whitespace.
static REFERENCE_CHARSET: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9._/:@-]+$").expect("Invalid image reference regex")
});

/// Validate an untrusted container image reference.
///
/// Accepts `[registry[:port]/][namespace/]repository[:tag|@digest]` after
/// trimming surrounding spaces. Control characters are rejected anywhere in
/// the input, including at the ends.
pub fn validate_image_reference(image_ref: &str) -> bool {
    if image_ref.chars().any(char::is_control) {
        return false;
    }

    let image_ref = image_ref.trim();
    if image_ref.is_empty() {
        return false;
    }

    // Comment lines from list-style input
    if image_ref.starts_with('#') {
        return false;
    }

    if image_ref.contains("..") {
        return false;
    }

    if image_ref.starts_with('/') || image_ref.starts_with("file:") {
        return false;
    }

    let lowered = image_ref.to_ascii_lowercase();
    if lowered.contains("%2f") || lowered.contains("%252f") {
        return false;
    }

    if !REFERENCE_CHARSET.is_match(image_ref) {
        return false;
    }

    // Tag without a repository, empty tags
    if image_ref.starts_with(':') || image_ref.contains("::") || image_ref.ends_with(':') {
        return false;
    }

    true
}

/// Derive a file-name-safe stem from an image reference.
///
/// Every character outside `[A-Za-z0-9]` becomes `-`, so the result can be
/// joined onto a directory without introducing separators.
pub fn sanitize_reference(image_ref: &str) -> String {
    image_ref
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}
