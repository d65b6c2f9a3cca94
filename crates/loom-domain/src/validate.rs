//! Shared field validators
//!
//! Small predicates reused across registry entries, work items, and tool
//! argument checks.

use once_cell::sync::Lazy;
use regex::Regex;
use uuid::Uuid;

static HANDLE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9-]+$").expect("handle pattern"));

/// A v4 UUID in canonical hyphenated form.
pub fn is_uuid_v4(s: &str) -> bool {
    match Uuid::parse_str(s) {
        Ok(u) => u.get_version_num() == 4,
        Err(_) => false,
    }
}

/// Handles and channel names share the same alphabet: lowercase
/// alphanumerics and hyphens, non-empty.
pub fn is_handle(s: &str) -> bool {
    HANDLE_RE.is_match(s)
}

/// 16 lowercase hex characters.
pub fn is_project_id(s: &str) -> bool {
    s.len() == 16 && s.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
}

/// Non-empty after trimming whitespace.
pub fn is_present(s: &str) -> bool {
    !s.trim().is_empty()
}
