//! Hostname patterns used as routing and certificate keys
//!
//! A pattern is either an exact name (`www.example.com`) or a single-level
//! wildcard (`*.example.com`). The wildcard matches exactly one extra label:
//! `a.example.com` but neither `example.com` nor `a.b.example.com`.

use std::fmt;
use std::str::FromStr;

use crate::common::error::EdgeError;

/// A validated, lowercased hostname pattern
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostnamePattern(String);

impl HostnamePattern {
    /// Parse and normalize a pattern
    pub fn parse(pattern: &str) -> Result<Self, EdgeError> {
        let normalized = normalize(pattern);
        let invalid = || EdgeError::InvalidHostname(pattern.to_string());

        if normalized.is_empty() {
            return Err(invalid());
        }
        let host = match normalized.strip_prefix("*.") {
            Some(suffix) => suffix,
            None => normalized.as_str(),
        };
        if host.is_empty() || host.split('.').any(|label| label.is_empty() || label.contains('*')) {
            return Err(invalid());
        }
        Ok(Self(normalized))
    }

    /// Wildcard pattern covering the immediate subdomains of `domain`
    pub fn wildcard(domain: &str) -> Result<Self, EdgeError> {
        Self::parse(&format!("*.{}", normalize(domain)))
    }

    pub fn is_wildcard(&self) -> bool {
        self.0.starts_with("*.")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether a concrete server name is covered by this pattern
    pub fn matches(&self, server_name: &str) -> bool {
        let name = normalize(server_name);
        if !is_valid_server_name(&name) {
            return false;
        }
        match self.0.strip_prefix('*') {
            Some(suffix) => wildcard_of(&name).is_some_and(|w| w[1..] == *suffix),
            None => name == self.0,
        }
    }
}

impl fmt::Display for HostnamePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for HostnamePattern {
    type Err = EdgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl AsRef<str> for HostnamePattern {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Lowercase a name and strip a trailing root dot
pub fn normalize(name: &str) -> String {
    name.strip_suffix('.').unwrap_or(name).to_ascii_lowercase()
}

/// A server name announced by a client must be non-empty and never a pattern
pub fn is_valid_server_name(name: &str) -> bool {
    !name.is_empty() && !name.starts_with('*')
}

/// The single-level wildcard key for a concrete name: `a.b.c` -> `*.b.c`
///
/// Names without a dot have no wildcard form.
pub fn wildcard_of(name: &str) -> Option<String> {
    let (_, rest) = name.split_once('.')?;
    if rest.is_empty() {
        return None;
    }
    Some(format!("*.{rest}"))
}

/// Keys to try, in order, when looking a server name up in a pattern table
pub fn lookup_keys(server_name: &str) -> Vec<String> {
    let name = normalize(server_name);
    if !is_valid_server_name(&name) {
        return Vec::new();
    }
    let wildcard = wildcard_of(&name);
    let mut keys = vec![name];
    keys.extend(wildcard);
    keys
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_normalizes() {
        let pattern = HostnamePattern::parse("WWW.Example.COM.").unwrap();
        assert_eq!(pattern.as_str(), "www.example.com");
        assert!(!pattern.is_wildcard());
    }

    #[test]
    fn test_parse_rejects_bad_patterns() {
        for bad in ["", "*", "*.", "a.*.example.com", "**.example.com", "a..b", "*foo.example.com"] {
            assert!(HostnamePattern::parse(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn test_wildcard_matches_one_level_only() {
        let pattern = HostnamePattern::wildcard("example.com").unwrap();
        assert!(pattern.matches("foo.example.com"));
        assert!(pattern.matches("FOO.example.com."));
        assert!(!pattern.matches("example.com"));
        assert!(!pattern.matches("a.b.example.com"));
        assert!(!pattern.matches("fooexample.com"));
        assert!(!pattern.matches("*.example.com"));
    }

    #[test]
    fn test_exact_match() {
        let pattern: HostnamePattern = "example.com".parse().unwrap();
        assert!(pattern.matches("example.com"));
        assert!(!pattern.matches("www.example.com"));
    }

    #[test]
    fn test_lookup_keys() {
        assert_eq!(lookup_keys("a.example.com"), vec!["a.example.com", "*.example.com"]);
        assert_eq!(lookup_keys("localhost"), vec!["localhost"]);
        assert!(lookup_keys("").is_empty());
        assert!(lookup_keys("*.example.com").is_empty());
    }
}
