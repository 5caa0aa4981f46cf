//! Selecting the most specific ACL for a caller's SPIFFE ID.

use thiserror::Error;

use crate::config::Acl;
use crate::spiffe_id::{MatchPrincipal, SpiffeId};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MatchError {
    /// Two wildcard patterns with equally long stems matched. Unreachable
    /// for configs that passed validation (duplicate principals are
    /// rejected), kept as a serving-time guard.
    #[error("principal matched multiple ACLs")]
    MultipleMatches,
}

/// Find the single best ACL for `principal`, or `None` when the caller is
/// authenticated but has no entitlements.
///
/// Exact matches win unconditionally over wildcards; among wildcard
/// candidates the longest non-wildcard stem wins. ACL entries whose
/// pattern does not parse are skipped (the validator rejects them at load
/// time).
pub fn matching_acl<'a>(
    acls: &'a [Acl],
    principal: &SpiffeId,
) -> Result<Option<&'a Acl>, MatchError> {
    let mut best: Option<(&'a Acl, usize)> = None;
    let mut tied = false;

    for acl in acls {
        let Ok(pattern) = MatchPrincipal::parse(&acl.match_principal) else {
            continue;
        };
        if !pattern.matches(principal) {
            continue;
        }
        if !pattern.is_wildcard() {
            return Ok(Some(acl));
        }
        let specificity = pattern.specificity();
        match best {
            Some((_, current)) if specificity < current => {}
            Some((_, current)) if specificity == current => tied = true,
            _ => {
                best = Some((acl, specificity));
                tied = false;
            }
        }
    }

    if tied {
        return Err(MatchError::MultipleMatches);
    }
    Ok(best.map(|(acl, _)| acl))
}
