//! POSIX-style path splitting.
//!
//! The path walk consumes slash-separated paths one component at a time from
//! the left ([`split_prefix`]), while create/rename need the parent directory
//! and the final component ([`split_suffix`]). Both tolerate redundant
//! separators anywhere in the input.

/// Path separator used throughout the engine.
pub const SEPARATOR: char = '/';

/// Split off the first path component.
///
/// Returns `(prefix, remainder)` where `prefix` is the first component and
/// `remainder` is everything after it with leading separators stripped.
/// Leading separators before the first component are ignored.
#[must_use]
pub fn split_prefix(path: &str) -> (&str, &str) {
    let path = path.trim_start_matches(SEPARATOR);
    match path.find(SEPARATOR) {
        Some(idx) => {
            let (prefix, rest) = path.split_at(idx);
            (prefix, rest.trim_start_matches(SEPARATOR))
        }
        None => (path, ""),
    }
}

/// Split off the last path component.
///
/// Returns `(remainder, suffix)` where `suffix` is the final component and
/// `remainder` is everything before it with trailing separators stripped.
/// Trailing separators after the last component are ignored.
#[must_use]
pub fn split_suffix(path: &str) -> (&str, &str) {
    let path = path.trim_end_matches(SEPARATOR);
    match path.rfind(SEPARATOR) {
        Some(idx) => {
            let (rest, suffix) = path.split_at(idx + 1);
            (rest.trim_end_matches(SEPARATOR), suffix)
        }
        None => ("", path),
    }
}

/// True if the path names the volume root (empty or separators only).
#[must_use]
pub fn is_root(path: &str) -> bool {
    path.chars().all(|c| c == SEPARATOR)
}
