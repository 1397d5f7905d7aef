//! Cognigate Types - the shared data model of the governance core.
//!
//! Every layer (trust, capability, policy, enforce, proof) speaks these
//! types. Engine logic lives in the component crates, never here.

#![deny(unsafe_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Generate a prefixed short id (`int_a1b2c3d4e5f6` style).
fn short_id(prefix: &str) -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("{prefix}{}", &hex[..12])
}

macro_rules! prefixed_id {
    ($name:ident, $prefix:literal) => {
        #[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn generate() -> Self {
                Self(short_id($prefix))
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

prefixed_id!(IntentId, "int_");
prefixed_id!(DecisionId, "dec_");
prefixed_id!(ProofId, "prf_");
prefixed_id!(EscalationId, "esc_");
prefixed_id!(RequestId, "req_");
prefixed_id!(AnchorId, "anc_");

/// Identifier of a governed entity (agent, service, user principal).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityId(pub String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Upper bound of the trust score range.
pub const TRUST_SCORE_MAX: u32 = 1000;

/// Trust tiers T0-T5. Tier is always a pure function of score; it is
/// derived on demand and never stored independently.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustTier {
    /// T0, scores 0-99
    Sandbox,
    /// T1, scores 100-299
    Probation,
    /// T2, scores 300-499
    Limited,
    /// T3, scores 500-699
    Standard,
    /// T4, scores 700-899
    Trusted,
    /// T5, scores 900-1000
    Sovereign,
}

impl TrustTier {
    pub fn from_score(score: u32) -> Self {
        match score {
            0..=99 => TrustTier::Sandbox,
            100..=299 => TrustTier::Probation,
            300..=499 => TrustTier::Limited,
            500..=699 => TrustTier::Standard,
            700..=899 => TrustTier::Trusted,
            _ => TrustTier::Sovereign,
        }
    }

    pub fn min_score(&self) -> u32 {
        match self {
            TrustTier::Sandbox => 0,
            TrustTier::Probation => 100,
            TrustTier::Limited => 300,
            TrustTier::Standard => 500,
            TrustTier::Trusted => 700,
            TrustTier::Sovereign => 900,
        }
    }

    /// Short label (T0-T5) used in responses and logs.
    pub fn label(&self) -> &'static str {
        match self {
            TrustTier::Sandbox => "T0",
            TrustTier::Probation => "T1",
            TrustTier::Limited => "T2",
            TrustTier::Standard => "T3",
            TrustTier::Trusted => "T4",
            TrustTier::Sovereign => "T5",
        }
    }
}

impl std::fmt::Display for TrustTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// A point-in-time trust reading.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustSnapshot {
    pub score: u32,
    pub tier: TrustTier,
}

impl TrustSnapshot {
    pub fn from_score(score: u32) -> Self {
        Self {
            score,
            tier: TrustTier::from_score(score),
        }
    }
}

/// Risk classification attached to an intent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

/// Lifecycle status of an entity. Entities are suspended, never deleted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityStatus {
    Active,
    Suspended,
}

/// A governed entity. `trust_score` is the only mutable scoring state;
/// the tier is always recomputed from it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub trust_score: u32,
    /// Capability patterns granted beyond the tier defaults.
    pub explicit_grants: Vec<String>,
    /// Capability patterns denied regardless of tier or grants.
    pub explicit_denies: Vec<String>,
    pub last_action_at: DateTime<Utc>,
    pub status: EntityStatus,
}

impl Entity {
    pub fn new(id: EntityId, trust_score: u32, now: DateTime<Utc>) -> Self {
        Self {
            id,
            trust_score: trust_score.min(TRUST_SCORE_MAX),
            explicit_grants: vec![],
            explicit_denies: vec![],
            last_action_at: now,
            status: EntityStatus::Active,
        }
    }

    pub fn tier(&self) -> TrustTier {
        TrustTier::from_score(self.trust_score)
    }
}

/// A structured, risk-classified action request produced by the INTENT
/// layer. Immutable once issued.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IntentRecord {
    pub intent_id: IntentId,
    pub entity_id: EntityId,
    /// Action descriptor, e.g. `send_email` or `transfer_funds`.
    pub action: String,
    /// Capability strings the action needs. Never empty.
    pub capabilities_required: Vec<String>,
    pub risk_level: RiskLevel,
    #[serde(default)]
    pub context: HashMap<String, serde_json::Value>,
    pub issued_at: DateTime<Utc>,
}

/// Policy categories in strict priority order. Declaration order IS the
/// evaluation order: `HardDisqualifier` outranks everything below it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyCategory {
    HardDisqualifier,
    RegulatoryMandate,
    SecurityCritical,
    PolicyEnforcement,
    SoftConstraint,
}

impl PolicyCategory {
    pub const ALL: [PolicyCategory; 5] = [
        PolicyCategory::HardDisqualifier,
        PolicyCategory::RegulatoryMandate,
        PolicyCategory::SecurityCritical,
        PolicyCategory::PolicyEnforcement,
        PolicyCategory::SoftConstraint,
    ];
}

/// Action a policy rule takes when its condition matches.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyAction {
    Deny,
    Escalate,
    Limit,
    Allow,
}

/// A matched policy, recorded on the decision in evaluation order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyReference {
    pub policy_id: String,
    pub category: PolicyCategory,
    pub action: PolicyAction,
}

/// Governance outcome for one intent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionOutcome {
    Allow,
    Deny,
    Escalate,
    Degrade,
}

impl DecisionOutcome {
    pub fn allows_execution(&self) -> bool {
        matches!(self, DecisionOutcome::Allow | DecisionOutcome::Degrade)
    }
}

/// Machine-readable reason a check failed. Codes follow the category
/// prefixes of the error taxonomy (E10xx trust, E11xx capability, E13xx
/// enforce, E18xx rate limit, E19xx system).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialCode {
    InsufficientTrust,
    EntitySuspended,
    EntityUnknown,
    CapabilityDenied,
    PolicyViolation,
    DecisionTimeout,
    RateLimitExceeded,
    InternalFailure,
}

impl DenialCode {
    pub fn code(&self) -> &'static str {
        match self {
            DenialCode::InsufficientTrust => "E1001",
            DenialCode::EntitySuspended => "E1002",
            DenialCode::EntityUnknown => "E1003",
            DenialCode::CapabilityDenied => "E1101",
            DenialCode::PolicyViolation => "E1301",
            DenialCode::DecisionTimeout => "E1302",
            DenialCode::RateLimitExceeded => "E1801",
            DenialCode::InternalFailure => "E1901",
        }
    }
}

/// The governance outcome for one intent, created exactly once per
/// intent id. Replays return the recorded decision unchanged.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Decision {
    pub decision_id: DecisionId,
    pub intent_id: IntentId,
    pub entity_id: EntityId,
    pub outcome: DecisionOutcome,
    pub trust_score_at_decision: u32,
    pub trust_tier_at_decision: TrustTier,
    pub capabilities_granted: Vec<String>,
    pub policy_references: Vec<PolicyReference>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub denial_code: Option<DenialCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub escalation_id: Option<EscalationId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub degraded_capabilities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<u64>,
    pub decided_at: DateTime<Utc>,
    /// Set once the decision has been committed to the proof ledger.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proof_id: Option<ProofId>,
}

/// Response surface mirroring a `Decision`, produced by the service.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnforceResponse {
    pub decision: DecisionOutcome,
    pub intent_id: IntentId,
    pub entity_id: EntityId,
    pub trust_score: u32,
    pub trust_tier: TrustTier,
    pub proof_id: ProofId,
    pub request_id: RequestId,
    pub capabilities_granted: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub denial_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub denial_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub escalation_id: Option<EscalationId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub escalation_target: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub escalation_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub degraded_capabilities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degrade_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<u64>,
    pub decided_at: DateTime<Utc>,
}

/// Error taxonomy categories. Each maps to a stable code prefix.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Trust,
    Capability,
    Enforce,
    Proof,
    Chain,
    RateLimit,
    System,
}

impl ErrorCategory {
    pub fn code_prefix(&self) -> &'static str {
        match self {
            ErrorCategory::Trust => "E10",
            ErrorCategory::Capability => "E11",
            ErrorCategory::Enforce => "E13",
            ErrorCategory::Proof => "E14",
            ErrorCategory::Chain => "E15",
            ErrorCategory::RateLimit => "E18",
            ErrorCategory::System => "E19",
        }
    }
}

/// Fixed error envelope returned for every failed request. The request
/// id is sufficient to correlate against the proof ledger.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error_code: String,
    pub error_category: ErrorCategory,
    pub error_message: String,
    pub request_id: RequestId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}
