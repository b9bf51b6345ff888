//! The authorization predicate: which provider identities may pass.

use regex::bytes::Regex;

/// Applies the configured identity pattern to a provider user-info response
/// and extracts the canonical identity.
///
/// The response body is treated as opaque bytes rather than a parsed
/// document, so the proxy works against any provider whose user-info response
/// contains the address in the clear. The leftmost match wins; an empty match
/// counts as no identity.
#[derive(Clone, Debug)]
pub struct EmailMatcher {
    pattern: Regex,
}

impl EmailMatcher {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
        })
    }

    /// The identity extracted from `body`, or `None` when the pattern does
    /// not match. `None` means the login is denied.
    pub fn identify(&self, body: &[u8]) -> Option<String> {
        self.pattern
            .find(body)
            .map(|m| String::from_utf8_lossy(m.as_bytes()).into_owned())
            .filter(|email| !email.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_other_domain() {
        let matcher = EmailMatcher::new(r".*@example\.com").expect("compile pattern");

        assert_eq!(matcher.identify(b"test@other.com"), None);
    }

    #[test]
    fn accepts_configured_domain() {
        let matcher = EmailMatcher::new(r".*@example\.com").expect("compile pattern");

        assert_eq!(
            matcher.identify(b"test@example.com"),
            Some("test@example.com".to_string())
        );
    }

    #[test]
    fn identify_is_deterministic() {
        let matcher = EmailMatcher::new(r".*@example\.com").expect("compile pattern");
        let body = br#"{"email": "user@example.com", "verified": true}"#;

        assert_eq!(matcher.identify(body), matcher.identify(body));
    }

    #[test]
    fn leftmost_match_wins() {
        let matcher = EmailMatcher::new(r"[a-z]+@example\.com").expect("compile pattern");

        assert_eq!(
            matcher.identify(b"first@example.com second@example.com"),
            Some("first@example.com".to_string())
        );
    }

    #[test]
    fn empty_match_is_no_identity() {
        // the default match-everything pattern still yields nothing on an
        // empty body
        let matcher = EmailMatcher::new(".*").expect("compile pattern");

        assert_eq!(matcher.identify(b""), None);
    }

    #[test]
    fn matches_non_utf8_bodies() {
        let matcher = EmailMatcher::new(r"[a-z]+@example\.com").expect("compile pattern");
        let body = [&[0xff, 0xfe][..], b"user@example.com", &[0xff][..]].concat();

        assert_eq!(
            matcher.identify(&body),
            Some("user@example.com".to_string())
        );
    }
}
