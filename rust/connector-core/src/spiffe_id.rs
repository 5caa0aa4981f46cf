//! Canonical SPIFFE IDs and the principal-matching patterns built on them.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

const SCHEME: &str = "spiffe://";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SpiffeIdError {
    #[error("scheme is missing or invalid")]
    Scheme,
    #[error("trust domain is empty")]
    EmptyTrustDomain,
    #[error("trust domain contains invalid character {0:?}")]
    TrustDomainChar(char),
    #[error("path has a trailing slash")]
    TrailingSlash,
    #[error("path contains an empty segment")]
    EmptySegment,
    #[error("path segment contains invalid character {0:?}")]
    PathChar(char),
    #[error("query and fragment are not allowed")]
    QueryOrFragment,
    #[error("wildcard is only allowed as the final path segment")]
    EmbeddedWildcard,
}

/// A canonical SPIFFE ID of the form `spiffe://<trust-domain>[/<path>]`.
///
/// Equality is byte-for-byte over the canonical string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpiffeId {
    raw: String,
    // Byte offset of the first '/' after the trust domain, or raw.len()
    // for a bare trust-domain ID.
    path_start: usize,
}

impl SpiffeId {
    pub fn parse(s: &str) -> Result<Self, SpiffeIdError> {
        let rest = s.strip_prefix(SCHEME).ok_or(SpiffeIdError::Scheme)?;
        if rest.contains('?') || rest.contains('#') {
            return Err(SpiffeIdError::QueryOrFragment);
        }

        let (trust_domain, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, ""),
        };

        if trust_domain.is_empty() {
            return Err(SpiffeIdError::EmptyTrustDomain);
        }
        for c in trust_domain.chars() {
            if !matches!(c, 'a'..='z' | '0'..='9' | '.' | '-' | '_') {
                return Err(SpiffeIdError::TrustDomainChar(c));
            }
        }

        if !path.is_empty() {
            if path.ends_with('/') {
                return Err(SpiffeIdError::TrailingSlash);
            }
            for segment in path[1..].split('/') {
                if segment.is_empty() {
                    return Err(SpiffeIdError::EmptySegment);
                }
                for c in segment.chars() {
                    if !matches!(c, 'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '-' | '_') {
                        return Err(SpiffeIdError::PathChar(c));
                    }
                }
            }
        }

        Ok(Self {
            raw: s.to_string(),
            path_start: SCHEME.len() + trust_domain.len(),
        })
    }

    pub fn trust_domain(&self) -> &str {
        &self.raw[SCHEME.len()..self.path_start]
    }

    /// The path component including its leading '/', or "" for a bare
    /// trust-domain ID.
    pub fn path(&self) -> &str {
        &self.raw[self.path_start..]
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl FromStr for SpiffeId {
    type Err = SpiffeIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for SpiffeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl AsRef<str> for SpiffeId {
    fn as_ref(&self) -> &str {
        &self.raw
    }
}

/// A pattern over SPIFFE ID space: either a literal ID or a literal
/// followed by a single trailing `/*` wildcard segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchPrincipal {
    base: SpiffeId,
    wildcard: bool,
}

impl MatchPrincipal {
    pub fn parse(s: &str) -> Result<Self, SpiffeIdError> {
        if let Some(stem) = s.strip_suffix("/*") {
            if stem.contains('*') {
                return Err(SpiffeIdError::EmbeddedWildcard);
            }
            Ok(Self {
                base: SpiffeId::parse(stem)?,
                wildcard: true,
            })
        } else {
            if s.contains('*') {
                return Err(SpiffeIdError::EmbeddedWildcard);
            }
            Ok(Self {
                base: SpiffeId::parse(s)?,
                wildcard: false,
            })
        }
    }

    pub fn is_wildcard(&self) -> bool {
        self.wildcard
    }

    pub fn base(&self) -> &SpiffeId {
        &self.base
    }

    /// Whether this pattern matches the given concrete ID. A wildcard
    /// matches any ID strictly underneath its stem.
    pub fn matches(&self, id: &SpiffeId) -> bool {
        if !self.wildcard {
            return self.base == *id;
        }
        match id.as_str().strip_prefix(self.base.as_str()) {
            Some(rest) => rest.len() > 1 && rest.starts_with('/'),
            None => false,
        }
    }

    /// Length of the non-wildcard stem; longer is more specific.
    pub fn specificity(&self) -> usize {
        self.base.as_str().len()
    }
}

impl fmt::Display for MatchPrincipal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.wildcard {
            write!(f, "{}/*", self.base)
        } else {
            self.base.fmt(f)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_workload_id() {
        let id = SpiffeId::parse("spiffe://example.com/workload/api").unwrap();
        assert_eq!(id.trust_domain(), "example.com");
        assert_eq!(id.path(), "/workload/api");
        assert_eq!(id.as_str(), "spiffe://example.com/workload/api");
    }

    #[test]
    fn parses_bare_trust_domain() {
        let id = SpiffeId::parse("spiffe://example.com").unwrap();
        assert_eq!(id.trust_domain(), "example.com");
        assert_eq!(id.path(), "");
    }

    #[test]
    fn rejects_missing_scheme() {
        assert_eq!(
            SpiffeId::parse("missing/spiffe/prefix").unwrap_err(),
            SpiffeIdError::Scheme
        );
        assert_eq!(
            SpiffeId::parse("https://foo/bar/baz").unwrap_err(),
            SpiffeIdError::Scheme
        );
    }

    #[test]
    fn rejects_bad_trust_domain() {
        assert_eq!(
            SpiffeId::parse("spiffe:///foo").unwrap_err(),
            SpiffeIdError::EmptyTrustDomain
        );
        assert_eq!(
            SpiffeId::parse("spiffe://Example.com/foo").unwrap_err(),
            SpiffeIdError::TrustDomainChar('E')
        );
    }

    #[test]
    fn rejects_malformed_paths() {
        assert_eq!(
            SpiffeId::parse("spiffe://td/foo/").unwrap_err(),
            SpiffeIdError::TrailingSlash
        );
        assert_eq!(
            SpiffeId::parse("spiffe://td/foo//bar").unwrap_err(),
            SpiffeIdError::EmptySegment
        );
        assert_eq!(
            SpiffeId::parse("spiffe://td/foo bar").unwrap_err(),
            SpiffeIdError::PathChar(' ')
        );
        assert_eq!(
            SpiffeId::parse("spiffe://td/foo?x=1").unwrap_err(),
            SpiffeIdError::QueryOrFragment
        );
        assert_eq!(
            SpiffeId::parse("spiffe://td/foo#frag").unwrap_err(),
            SpiffeIdError::QueryOrFragment
        );
    }

    #[test]
    fn equality_is_byte_for_byte() {
        let a = SpiffeId::parse("spiffe://td/foo").unwrap();
        let b = SpiffeId::parse("spiffe://td/foo").unwrap();
        let c = SpiffeId::parse("spiffe://td/Foo").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn parses_literal_and_wildcard_patterns() {
        let literal = MatchPrincipal::parse("spiffe://td/workload").unwrap();
        assert!(!literal.is_wildcard());

        let wild = MatchPrincipal::parse("spiffe://td/team/*").unwrap();
        assert!(wild.is_wildcard());
        assert_eq!(wild.base().as_str(), "spiffe://td/team");

        let domain_wide = MatchPrincipal::parse("spiffe://td/*").unwrap();
        assert!(domain_wide.is_wildcard());
        assert_eq!(domain_wide.base().as_str(), "spiffe://td");
    }

    #[test]
    fn rejects_embedded_wildcards() {
        assert_eq!(
            MatchPrincipal::parse("spiffe://td/*/bar").unwrap_err(),
            SpiffeIdError::EmbeddedWildcard
        );
        assert_eq!(
            MatchPrincipal::parse("spiffe://td/**/bar").unwrap_err(),
            SpiffeIdError::EmbeddedWildcard
        );
        assert_eq!(
            MatchPrincipal::parse("spiffe://td/a/*/*").unwrap_err(),
            SpiffeIdError::EmbeddedWildcard
        );
    }

    #[test]
    fn wildcard_matches_any_suffix() {
        let wild = MatchPrincipal::parse("spiffe://td/team/*").unwrap();
        let direct = SpiffeId::parse("spiffe://td/team/foo").unwrap();
        let nested = SpiffeId::parse("spiffe://td/team/foo/bar").unwrap();
        let stem = SpiffeId::parse("spiffe://td/team").unwrap();
        let sibling = SpiffeId::parse("spiffe://td/teammate/foo").unwrap();
        assert!(wild.matches(&direct));
        assert!(wild.matches(&nested));
        assert!(!wild.matches(&stem));
        assert!(!wild.matches(&sibling));
    }

    #[test]
    fn literal_matches_exactly() {
        let literal = MatchPrincipal::parse("spiffe://td/workload").unwrap();
        assert!(literal.matches(&SpiffeId::parse("spiffe://td/workload").unwrap()));
        assert!(!literal.matches(&SpiffeId::parse("spiffe://td/workload/x").unwrap()));
    }
}
