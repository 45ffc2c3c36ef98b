//! Normalization for module and capability identifiers.
//!
//! Two names that differ only in casing, whitespace, or punctuation must
//! normalize to the same slug before any policy or registry comparison.

const MAX_SLUG_LEN: usize = 128;

/// Lowercase, whitespace → hyphen, strip everything outside
/// `[a-z0-9_-]`, force a `[a-z_]` leading character, cap the length.
pub fn normalize_slug(name: &str) -> String {
    let mut s = String::with_capacity(name.len());
    let mut last_was_ws = false;
    for ch in name.trim().chars() {
        if ch.is_whitespace() {
            if !last_was_ws {
                s.push('-');
            }
            last_was_ws = true;
            continue;
        }
        last_was_ws = false;
        for lc in ch.to_lowercase() {
            if lc.is_ascii_lowercase() || lc.is_ascii_digit() || lc == '_' || lc == '-' {
                s.push(lc);
            }
        }
    }
    if s.is_empty() {
        s.push('_');
    }
    let leading_ok = s
        .chars()
        .next()
        .map(|c| c.is_ascii_lowercase() || c == '_')
        .unwrap_or(false);
    if !leading_ok {
        s.insert(0, '_');
    }
    if s.len() > MAX_SLUG_LEN {
        s.truncate(MAX_SLUG_LEN);
    }
    s
}

/// Match a rule's `from`/`to` pattern: `*` is a wildcard, anything else
/// compares by normalized slug.
pub fn pattern_matches(pattern: &str, actual_slug: &str) -> bool {
    pattern == "*" || normalize_slug(pattern) == actual_slug
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folds_case_whitespace_and_punctuation() {
        assert_eq!(normalize_slug("Friendly Hello!"), "friendly-hello");
        assert_eq!(normalize_slug("  Greeting  Module "), "greeting-module");
        assert_eq!(normalize_slug("snake_case_ok"), "snake_case_ok");
    }

    #[test]
    fn forces_leading_alpha_or_underscore() {
        assert_eq!(normalize_slug("9lives"), "_9lives");
        assert_eq!(normalize_slug("!!!"), "_");
        assert_eq!(normalize_slug(""), "_");
    }

    #[test]
    fn caps_length() {
        let long = "a".repeat(300);
        assert_eq!(normalize_slug(&long).len(), 128);
    }

    #[test]
    fn wildcard_and_slug_matching() {
        assert!(pattern_matches("*", "anything"));
        assert!(pattern_matches("Friendly Hello", "friendly-hello"));
        assert!(!pattern_matches("Other", "friendly-hello"));
    }
}
