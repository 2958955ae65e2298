//! URI pattern matching.
//!
//! Two primitives: exact literal comparison, and a small wildcard alphabet
//! (`*`, `?`, `?*`) good enough for path prefixes and optional trailing
//! slashes without pulling in a full regex engine.

/// Returns `true` if `pattern` contains any of the wildcard meta-characters.
#[inline]
pub(crate) fn is_wildcard(pattern: &[u8]) -> bool {
    pattern.contains(&b'*') || pattern.contains(&b'?')
}

/// Matches `uri` against `pattern` using the built-in alphabet.
///
/// - A pattern with no `*`/`?` is a literal, exact match.
/// - `*` matches any tail, including empty.
/// - `?` at the very end makes the character just before it optional: the
///   pattern matches with that character present or absent, but no other
///   trailing character.
/// - `?*` at the very end matches the empty tail, one character, or any
///   longer tail.
pub(crate) fn matches(pattern: &[u8], uri: &[u8]) -> bool {
    if !is_wildcard(pattern) {
        return pattern == uri;
    }

    if let Some(prefix) = pattern.strip_suffix(b"?*") {
        return uri.len() >= prefix.len() && &uri[..prefix.len()] == prefix;
    }

    if let Some(prefix) = pattern.strip_suffix(b"?") {
        return match prefix.split_last() {
            Some((&optional_char, base)) => {
                uri == base
                    || (uri.len() == base.len() + 1
                        && uri.starts_with(base)
                        && uri[base.len()] == optional_char)
            }
            None => uri.is_empty(),
        };
    }

    if let Some(prefix) = pattern.strip_suffix(b"*") {
        return uri.starts_with(prefix);
    }

    pattern == uri
}

/// Signature applications may supply to override the built-in matcher.
pub type CustomMatcher = fn(pattern: &[u8], uri: &[u8], uri_len: usize) -> bool;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_is_exact() {
        assert!(matches(b"/api", b"/api"));
        assert!(!matches(b"/api", b"/api/"));
        assert!(!matches(b"/api", b"/ap"));
    }

    #[test]
    fn star_matches_any_tail() {
        assert!(matches(b"/api/*", b"/api/"));
        assert!(matches(b"/api/*", b"/api/users"));
        assert!(matches(b"/api/*", b"/api/users/42"));
        assert!(!matches(b"/api/*", b"/ap"));
    }

    #[test]
    fn question_matches_optional_trailing_slash() {
        assert!(matches(b"/api/?", b"/api"));
        assert!(matches(b"/api/?", b"/api/"));
        assert!(!matches(b"/api/?", b"/api/x"));
        assert!(!matches(b"/api/?", b"/ap"));
    }

    #[test]
    fn question_only_allows_its_own_character_not_an_arbitrary_one() {
        // the optional character is whatever precedes `?` in the pattern
        // ('/' here); any other trailing byte must still fail to match.
        assert!(!matches(b"/api/?", b"/apiX"));
        assert!(!matches(b"/api/?", b"/api//"));
    }

    #[test]
    fn question_star_matches_empty_one_or_many() {
        assert!(matches(b"/api?*", b"/api"));
        assert!(matches(b"/api?*", b"/apiX"));
        assert!(matches(b"/api?*", b"/apiXYZ"));
        assert!(!matches(b"/api?*", b"/ap"));
    }

    #[test]
    fn no_meta_characters_is_literal_even_if_checked_via_is_wildcard() {
        assert!(!is_wildcard(b"/plain/path"));
        assert!(is_wildcard(b"/api/*"));
        assert!(is_wildcard(b"/api/?"));
    }
}
