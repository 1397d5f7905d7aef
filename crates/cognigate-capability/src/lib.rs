//! Cognigate Capability - what an entity may ask to do.
//!
//! Capabilities are hierarchical strings (`namespace:category/action[/scope]`).
//! The effective set for an entity is (tier defaults ∪ explicit grants) −
//! explicit denies, and a denial always wins over an overlapping grant.

#![deny(unsafe_code)]

use cognigate_types::TrustTier;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

const MAX_SEGMENTS: usize = 3;

#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error("invalid capability format: {0}")]
    InvalidFormat(String),

    /// A pattern that would resolve to "all capabilities" is never
    /// accepted, even from configuration.
    #[error("unbounded root wildcard rejected: {0}")]
    UnboundedWildcard(String),
}

impl CapabilityError {
    pub fn error_code(&self) -> &'static str {
        match self {
            CapabilityError::InvalidFormat(_) => "E1102",
            CapabilityError::UnboundedWildcard(_) => "E1103",
        }
    }
}

fn valid_segment(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

/// A concrete capability string, e.g. `comms:email/send`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Capability {
    namespace: String,
    segments: Vec<String>,
}

impl Capability {
    pub fn parse(raw: &str) -> Result<Self, CapabilityError> {
        let (namespace, rest) = raw
            .split_once(':')
            .ok_or_else(|| CapabilityError::InvalidFormat(raw.to_string()))?;
        if !valid_segment(namespace) {
            return Err(CapabilityError::InvalidFormat(raw.to_string()));
        }
        let segments: Vec<String> = rest.split('/').map(str::to_string).collect();
        if segments.is_empty() || segments.len() > MAX_SEGMENTS {
            return Err(CapabilityError::InvalidFormat(raw.to_string()));
        }
        for segment in &segments {
            if !valid_segment(segment) {
                return Err(CapabilityError::InvalidFormat(raw.to_string()));
            }
        }
        Ok(Self {
            namespace: namespace.to_string(),
            segments,
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.namespace, self.segments.join("/"))
    }
}

impl TryFrom<String> for Capability {
    type Error = CapabilityError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Capability::parse(&value)
    }
}

impl From<Capability> for String {
    fn from(value: Capability) -> Self {
        value.to_string()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum Segment {
    Literal(String),
    Wildcard,
}

/// A capability pattern used in tier defaults, grants, and denies.
/// Segments may be `*`; a shorter pattern prefix-matches deeper
/// capabilities. The namespace is always literal: a bare root wildcard
/// can never be expressed.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CapabilityPattern {
    namespace: String,
    segments: Vec<Segment>,
}

impl CapabilityPattern {
    pub fn parse(raw: &str) -> Result<Self, CapabilityError> {
        if raw == "*" || raw.starts_with("*:") {
            return Err(CapabilityError::UnboundedWildcard(raw.to_string()));
        }
        let (namespace, rest) = raw
            .split_once(':')
            .ok_or_else(|| CapabilityError::InvalidFormat(raw.to_string()))?;
        if !valid_segment(namespace) {
            return Err(CapabilityError::InvalidFormat(raw.to_string()));
        }
        let mut segments = Vec::new();
        for part in rest.split('/') {
            if part == "*" {
                segments.push(Segment::Wildcard);
            } else if valid_segment(part) {
                segments.push(Segment::Literal(part.to_string()));
            } else {
                return Err(CapabilityError::InvalidFormat(raw.to_string()));
            }
        }
        if segments.is_empty() || segments.len() > MAX_SEGMENTS {
            return Err(CapabilityError::InvalidFormat(raw.to_string()));
        }
        Ok(Self {
            namespace: namespace.to_string(),
            segments,
        })
    }

    /// Parse a batch of pattern strings, failing on the first invalid one.
    pub fn parse_all(raw: &[String]) -> Result<Vec<Self>, CapabilityError> {
        raw.iter().map(|s| Self::parse(s)).collect()
    }

    /// Whether this pattern covers the capability. A pattern with fewer
    /// segments than the capability matches as a prefix.
    pub fn matches(&self, capability: &Capability) -> bool {
        if self.namespace != capability.namespace {
            return false;
        }
        if self.segments.len() > capability.segments.len() {
            return false;
        }
        self.segments
            .iter()
            .zip(&capability.segments)
            .all(|(pattern, segment)| match pattern {
                Segment::Wildcard => true,
                Segment::Literal(lit) => lit == segment,
            })
    }

    /// Count of literal segments. Used to report the narrowest matching
    /// deny; denial wins at any specificity.
    pub fn specificity(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| matches!(s, Segment::Literal(_)))
            .count()
    }
}

impl std::fmt::Display for CapabilityPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let rendered: Vec<&str> = self
            .segments
            .iter()
            .map(|s| match s {
                Segment::Literal(lit) => lit.as_str(),
                Segment::Wildcard => "*",
            })
            .collect();
        write!(f, "{}:{}", self.namespace, rendered.join("/"))
    }
}

impl TryFrom<String> for CapabilityPattern {
    type Error = CapabilityError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        CapabilityPattern::parse(&value)
    }
}

impl From<CapabilityPattern> for String {
    fn from(value: CapabilityPattern) -> Self {
        value.to_string()
    }
}

/// Default capability patterns per trust tier. Tiers are cumulative: a
/// tier inherits everything below it.
#[derive(Clone, Debug, Default)]
pub struct TierDefaults {
    increments: BTreeMap<TrustTier, Vec<CapabilityPattern>>,
}

impl TierDefaults {
    pub fn empty() -> Self {
        Self::default()
    }

    /// The stock Cognigate ladder: read-only in the sandbox, side effects
    /// from T2 up, sensitive data and finance from T4.
    pub fn standard() -> Self {
        let mut defaults = Self::default();
        defaults
            .add(TrustTier::Sandbox, "data:public/read")
            .add(TrustTier::Probation, "data:workspace/read")
            .add(TrustTier::Probation, "comms:notify/send")
            .add(TrustTier::Limited, "data:workspace/write")
            .add(TrustTier::Limited, "tools:search/run")
            .add(TrustTier::Standard, "tools:shell/run")
            .add(TrustTier::Standard, "comms:email/send")
            .add(TrustTier::Trusted, "data:pii/read")
            .add(TrustTier::Trusted, "finance:payment/initiate")
            .add(TrustTier::Sovereign, "admin:policy/read");
        defaults
    }

    /// Add a default pattern at a tier. Panics on an invalid pattern;
    /// defaults are compiled-in or operator configuration, validated at
    /// startup.
    pub fn add(&mut self, tier: TrustTier, pattern: &str) -> &mut Self {
        let parsed = CapabilityPattern::parse(pattern)
            .unwrap_or_else(|e| panic!("invalid tier default {pattern:?}: {e}"));
        self.increments.entry(tier).or_default().push(parsed);
        self
    }

    pub fn try_add(&mut self, tier: TrustTier, pattern: &str) -> Result<&mut Self, CapabilityError> {
        let parsed = CapabilityPattern::parse(pattern)?;
        self.increments.entry(tier).or_default().push(parsed);
        Ok(self)
    }

    /// All default patterns available at `tier` (cumulative).
    pub fn for_tier(&self, tier: TrustTier) -> Vec<&CapabilityPattern> {
        self.increments
            .range(..=tier)
            .flat_map(|(_, patterns)| patterns.iter())
            .collect()
    }
}

/// Why a requested capability was not granted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum DenialReason {
    /// Covered by neither tier defaults nor explicit grants.
    NotInEffectiveSet,
    /// An explicit deny matched; denial wins over any grant.
    ExplicitDeny { pattern: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityDenial {
    pub capability: String,
    pub reason: DenialReason,
}

/// Partition of a requested set into granted and denied capabilities.
/// Requested capabilities outside the effective set are denied, never
/// silently dropped.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedCapabilities {
    pub granted: Vec<String>,
    pub denied: Vec<CapabilityDenial>,
}

impl ResolvedCapabilities {
    pub fn all_granted(&self) -> bool {
        self.denied.is_empty()
    }
}

/// Resolves effective capability sets from tier defaults, explicit
/// grants, and explicit denies.
pub struct CapabilityResolver {
    defaults: TierDefaults,
}

impl CapabilityResolver {
    pub fn new(defaults: TierDefaults) -> Self {
        Self { defaults }
    }

    /// Partition `requested` against the entity's effective set.
    pub fn resolve(
        &self,
        tier: TrustTier,
        grants: &[CapabilityPattern],
        denies: &[CapabilityPattern],
        requested: &[Capability],
    ) -> ResolvedCapabilities {
        let tier_defaults = self.defaults.for_tier(tier);
        let mut granted = Vec::new();
        let mut denied = Vec::new();

        for capability in requested {
            // Deny wins over grant at any specificity; report the
            // narrowest matching deny.
            let matching_deny = denies
                .iter()
                .filter(|p| p.matches(capability))
                .max_by_key(|p| p.specificity());
            if let Some(pattern) = matching_deny {
                denied.push(CapabilityDenial {
                    capability: capability.to_string(),
                    reason: DenialReason::ExplicitDeny {
                        pattern: pattern.to_string(),
                    },
                });
                continue;
            }

            let in_effective_set = tier_defaults.iter().any(|p| p.matches(capability))
                || grants.iter().any(|p| p.matches(capability));
            if in_effective_set {
                granted.push(capability.to_string());
            } else {
                denied.push(CapabilityDenial {
                    capability: capability.to_string(),
                    reason: DenialReason::NotInEffectiveSet,
                });
            }
        }

        ResolvedCapabilities { granted, denied }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cap(s: &str) -> Capability {
        Capability::parse(s).unwrap()
    }

    fn pat(s: &str) -> CapabilityPattern {
        CapabilityPattern::parse(s).unwrap()
    }

    #[test]
    fn parses_two_and_three_segment_capabilities() {
        assert_eq!(cap("comms:email/send").to_string(), "comms:email/send");
        assert_eq!(
            cap("data:workspace/read/reports").to_string(),
            "data:workspace/read/reports"
        );
    }

    #[test]
    fn rejects_malformed_capabilities() {
        assert!(Capability::parse("no-namespace").is_err());
        assert!(Capability::parse(":email/send").is_err());
        assert!(Capability::parse("comms:").is_err());
        assert!(Capability::parse("comms:Email/Send").is_err());
        assert!(Capability::parse("a:b/c/d/e").is_err());
    }

    #[test]
    fn bare_root_wildcard_is_rejected_at_parse_time() {
        assert!(matches!(
            CapabilityPattern::parse("*"),
            Err(CapabilityError::UnboundedWildcard(_))
        ));
        assert!(matches!(
            CapabilityPattern::parse("*:*"),
            Err(CapabilityError::UnboundedWildcard(_))
        ));
        // A namespace-scoped wildcard is fine.
        assert!(CapabilityPattern::parse("comms:*").is_ok());
    }

    #[test]
    fn wildcard_and_prefix_matching() {
        assert!(pat("comms:*").matches(&cap("comms:email/send")));
        assert!(pat("comms:email").matches(&cap("comms:email/send")));
        assert!(pat("comms:email/*").matches(&cap("comms:email/send")));
        assert!(!pat("comms:email/send/bulk").matches(&cap("comms:email/send")));
        assert!(!pat("data:*").matches(&cap("comms:email/send")));
    }

    #[test]
    fn deny_overrides_grant_regardless_of_grant_specificity() {
        let resolver = CapabilityResolver::new(TierDefaults::empty());
        let grants = vec![pat("comms:email/send")];
        let denies = vec![pat("comms:*")];

        let resolved = resolver.resolve(
            TrustTier::Sovereign,
            &grants,
            &denies,
            &[cap("comms:email/send")],
        );
        assert!(resolved.granted.is_empty());
        assert_eq!(resolved.denied.len(), 1);
        assert!(matches!(
            resolved.denied[0].reason,
            DenialReason::ExplicitDeny { .. }
        ));
    }

    #[test]
    fn narrowest_matching_deny_is_reported() {
        let resolver = CapabilityResolver::new(TierDefaults::empty());
        let denies = vec![pat("comms:*"), pat("comms:email/send")];
        let resolved = resolver.resolve(TrustTier::Sandbox, &[], &denies, &[cap("comms:email/send")]);
        assert_eq!(
            resolved.denied[0].reason,
            DenialReason::ExplicitDeny {
                pattern: "comms:email/send".to_string()
            }
        );
    }

    #[test]
    fn unmatched_requests_are_denied_not_dropped() {
        let resolver = CapabilityResolver::new(TierDefaults::standard());
        let resolved = resolver.resolve(
            TrustTier::Sandbox,
            &[],
            &[],
            &[cap("data:public/read"), cap("finance:payment/initiate")],
        );
        assert_eq!(resolved.granted, vec!["data:public/read".to_string()]);
        assert_eq!(resolved.denied.len(), 1);
        assert_eq!(resolved.denied[0].capability, "finance:payment/initiate");
        assert_eq!(resolved.denied[0].reason, DenialReason::NotInEffectiveSet);
    }

    #[test]
    fn tier_defaults_are_cumulative() {
        let defaults = TierDefaults::standard();
        let sandbox = defaults.for_tier(TrustTier::Sandbox);
        let standard = defaults.for_tier(TrustTier::Standard);
        assert!(sandbox.len() < standard.len());
        assert!(standard.iter().any(|p| p.to_string() == "data:public/read"));
        assert!(standard.iter().any(|p| p.to_string() == "tools:shell/run"));
    }
}
