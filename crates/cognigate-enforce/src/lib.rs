//! Cognigate Enforce - the decision engine.
//!
//! Four checks run in fixed order, short-circuiting on the first
//! failure: trust, capability, policy, rate. Every failure maps to DENY
//! except a policy `escalate` (ESCALATE) and partial capability or
//! `limit` outcomes (DEGRADE).
//!
//! Evaluation itself only reads shared state; the escalation record and
//! rate charge a decision carries stay pending inside the returned
//! [`Evaluation`] until [`DecisionEngine::commit`]. An evaluation that
//! is dropped instead (budget overrun, lost idempotency race) leaves no
//! trace. Timeouts are handled one layer up by the service, which fails
//! closed.

#![deny(unsafe_code)]

use chrono::{DateTime, Duration, Utc};
use cognigate_capability::{Capability, CapabilityError, CapabilityPattern, CapabilityResolver};
use cognigate_policy::{PolicyEngine, PolicyInput};
use cognigate_trust::{EntityStore, TrustError, TrustProvider};
use cognigate_types::{
    Decision, DecisionId, DecisionOutcome, DenialCode, EntityId, EntityStatus, EscalationId,
    IntentId, IntentRecord, PolicyAction, RiskLevel, TrustSnapshot, TrustTier,
};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Pending escalations expire after this window; resolution past it is
/// rejected and the record marked expired.
pub const ESCALATION_EXPIRY_HOURS: i64 = 4;

/// Review queue used when an escalating policy names no target.
pub const DEFAULT_ESCALATION_TARGET: &str = "governance-review";

#[derive(Debug, Error)]
pub enum EnforceError {
    #[error("intent requires at least one capability")]
    EmptyCapabilitySet,

    #[error(transparent)]
    Capability(#[from] CapabilityError),

    #[error(transparent)]
    Trust(#[from] TrustError),

    #[error("escalation not found: {0}")]
    EscalationNotFound(EscalationId),

    #[error("escalation expired: {0}")]
    EscalationExpired(EscalationId),

    #[error("escalation already resolved: {0}")]
    EscalationAlreadyResolved(EscalationId),
}

impl EnforceError {
    pub fn error_code(&self) -> &'static str {
        match self {
            EnforceError::EmptyCapabilitySet => "E1303",
            EnforceError::Capability(e) => e.error_code(),
            EnforceError::Trust(e) => e.error_code(),
            EnforceError::EscalationNotFound(_) => "E1304",
            EnforceError::EscalationExpired(_) => "E1305",
            EnforceError::EscalationAlreadyResolved(_) => "E1306",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, EnforceError::Trust(e) if e.is_retryable())
    }
}

/// Per-tier request caps over sliding hourly and daily windows,
/// indexed T0..T5.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimits {
    pub hourly: [u32; 6],
    pub daily: [u32; 6],
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            hourly: [50, 200, 500, 2_000, 5_000, 10_000],
            daily: [200, 1_000, 5_000, 20_000, 50_000, 100_000],
        }
    }
}

impl RateLimits {
    pub fn hourly_for(&self, tier: TrustTier) -> u32 {
        self.hourly[tier as usize]
    }

    pub fn daily_for(&self, tier: TrustTier) -> u32 {
        self.daily[tier as usize]
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateExceeded {
    pub retry_after_seconds: u64,
}

/// Sliding-window rate limiter keyed by entity. `check` is read-only so
/// denied requests never consume quota; `record` is called once a
/// decision allows execution.
pub struct RateLimiter {
    limits: RateLimits,
    windows: DashMap<EntityId, VecDeque<DateTime<Utc>>>,
}

impl RateLimiter {
    pub fn new(limits: RateLimits) -> Self {
        Self {
            limits,
            windows: DashMap::new(),
        }
    }

    pub fn check(
        &self,
        entity_id: &EntityId,
        tier: TrustTier,
        now: DateTime<Utc>,
    ) -> Result<(), RateExceeded> {
        let Some(window) = self.windows.get(entity_id) else {
            return Ok(());
        };
        let hour_ago = now - Duration::hours(1);
        let day_ago = now - Duration::days(1);

        let daily: Vec<&DateTime<Utc>> = window.iter().filter(|t| **t > day_ago).collect();
        if daily.len() as u32 >= self.limits.daily_for(tier) {
            return Err(RateExceeded {
                retry_after_seconds: retry_after(daily.first().copied(), Duration::days(1), now),
            });
        }
        let hourly: Vec<&DateTime<Utc>> = daily.iter().copied().filter(|t| **t > hour_ago).collect();
        if hourly.len() as u32 >= self.limits.hourly_for(tier) {
            return Err(RateExceeded {
                retry_after_seconds: retry_after(hourly.first().copied(), Duration::hours(1), now),
            });
        }
        Ok(())
    }

    pub fn record(&self, entity_id: &EntityId, now: DateTime<Utc>) {
        let mut window = self.windows.entry(entity_id.clone()).or_default();
        window.push_back(now);
        let day_ago = now - Duration::days(1);
        while window.front().is_some_and(|t| *t <= day_ago) {
            window.pop_front();
        }
    }
}

fn retry_after(oldest: Option<&DateTime<Utc>>, window: Duration, now: DateTime<Utc>) -> u64 {
    oldest
        .map(|t| (*t + window - now).num_seconds().max(1) as u64)
        .unwrap_or(1)
}

/// Minimum trust tier required per risk level, plus optional stricter
/// floors for individual capability patterns.
pub struct TrustRequirements {
    by_risk: [TrustTier; 4],
    overrides: Vec<(CapabilityPattern, TrustTier)>,
}

impl Default for TrustRequirements {
    fn default() -> Self {
        Self {
            by_risk: [
                TrustTier::Sandbox,
                TrustTier::Limited,
                TrustTier::Standard,
                TrustTier::Trusted,
            ],
            overrides: vec![],
        }
    }
}

impl TrustRequirements {
    pub fn with_override(mut self, pattern: &str, tier: TrustTier) -> Result<Self, CapabilityError> {
        self.overrides.push((CapabilityPattern::parse(pattern)?, tier));
        Ok(self)
    }

    /// Strictest tier demanded by the risk level or any matching
    /// capability override.
    pub fn required_tier(&self, risk: RiskLevel, requested: &[Capability]) -> TrustTier {
        let mut required = self.by_risk[risk as usize];
        for (pattern, tier) in &self.overrides {
            if *tier > required && requested.iter().any(|c| pattern.matches(c)) {
                required = *tier;
            }
        }
        required
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
}

/// Deferral of one decision to asynchronous human review. Resolution
/// arrives out-of-band; the record is updated in place but the original
/// decision is never edited.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EscalationRecord {
    pub escalation_id: EscalationId,
    pub decision_id: DecisionId,
    pub intent_id: IntentId,
    pub entity_id: EntityId,
    pub target: String,
    pub reason: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: EscalationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
pub struct EscalationStore {
    records: DashMap<EscalationId, EscalationRecord>,
}

impl EscalationStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn open(&self, record: EscalationRecord) {
        self.records.insert(record.escalation_id.clone(), record);
    }

    pub fn get(&self, id: &EscalationId) -> Option<EscalationRecord> {
        self.records.get(id).map(|r| r.clone())
    }

    pub fn pending(&self, now: DateTime<Utc>) -> Vec<EscalationRecord> {
        self.records
            .iter()
            .filter(|r| r.status == EscalationStatus::Pending && r.expires_at > now)
            .map(|r| r.clone())
            .collect()
    }

    /// Record the human verdict. Past-expiry resolutions are rejected
    /// and the record flipped to expired.
    pub fn resolve(
        &self,
        id: &EscalationId,
        approved: bool,
        reviewer: &str,
        now: DateTime<Utc>,
    ) -> Result<EscalationRecord, EnforceError> {
        let mut record = self
            .records
            .get_mut(id)
            .ok_or_else(|| EnforceError::EscalationNotFound(id.clone()))?;
        match record.status {
            EscalationStatus::Pending if now > record.expires_at => {
                record.status = EscalationStatus::Expired;
                Err(EnforceError::EscalationExpired(id.clone()))
            }
            EscalationStatus::Pending => {
                record.status = if approved {
                    EscalationStatus::Approved
                } else {
                    EscalationStatus::Rejected
                };
                record.resolved_by = Some(reviewer.to_string());
                record.resolved_at = Some(now);
                Ok(record.clone())
            }
            _ => Err(EnforceError::EscalationAlreadyResolved(id.clone())),
        }
    }
}

/// A decision together with the side effects it carries. Effects are
/// applied by [`DecisionEngine::commit`]; dropping an evaluation
/// discards them, so a decision that is never committed opens no
/// escalation and consumes no rate quota.
#[derive(Debug)]
pub struct Evaluation {
    pub decision: Decision,
    escalation: Option<EscalationRecord>,
    rate_charge: Option<(EntityId, DateTime<Utc>)>,
}

impl Evaluation {
    /// A bare decision with no pending effects, for decisions minted
    /// outside the engine such as a fail-closed denial.
    pub fn terminal(decision: Decision) -> Self {
        Self {
            decision,
            escalation: None,
            rate_charge: None,
        }
    }
}

/// Orchestrates the four governance checks for one intent. `evaluate`
/// is synchronous and read-only; pending side effects travel in the
/// returned [`Evaluation`] and are applied by `commit`. The proof
/// ledger append happens in the service.
pub struct DecisionEngine {
    store: Arc<EntityStore>,
    trust: Arc<dyn TrustProvider>,
    resolver: CapabilityResolver,
    policies: Arc<PolicyEngine>,
    requirements: TrustRequirements,
    rate: RateLimiter,
    escalations: EscalationStore,
}

impl DecisionEngine {
    pub fn new(
        store: Arc<EntityStore>,
        trust: Arc<dyn TrustProvider>,
        resolver: CapabilityResolver,
        policies: Arc<PolicyEngine>,
        requirements: TrustRequirements,
        rate_limits: RateLimits,
    ) -> Self {
        Self {
            store,
            trust,
            resolver,
            policies,
            requirements,
            rate: RateLimiter::new(rate_limits),
            escalations: EscalationStore::new(),
        }
    }

    pub fn escalations(&self) -> &EscalationStore {
        &self.escalations
    }

    /// Run the four checks and produce a decision. Governance failures
    /// (unknown entity, low trust, denied capability, policy, rate) are
    /// decisions, not errors; `Err` is reserved for malformed requests
    /// and infrastructure faults. Pass the result to [`Self::commit`]
    /// once the decision is actually kept.
    pub fn evaluate(
        &self,
        intent: &IntentRecord,
        now: DateTime<Utc>,
    ) -> Result<Evaluation, EnforceError> {
        if intent.capabilities_required.is_empty() {
            return Err(EnforceError::EmptyCapabilitySet);
        }
        let requested: Vec<Capability> = intent
            .capabilities_required
            .iter()
            .map(|raw| Capability::parse(raw))
            .collect::<Result<_, _>>()?;

        let decision_id = DecisionId::generate();

        let entity = match self.store.get(&intent.entity_id) {
            Ok(entity) => entity,
            Err(TrustError::EntityNotFound(_)) => {
                return Ok(Evaluation::terminal(self.denied(
                    decision_id,
                    intent,
                    TrustSnapshot::from_score(0),
                    DenialCode::EntityUnknown,
                    format!("entity {} is not registered", intent.entity_id),
                    now,
                )));
            }
            Err(e) => return Err(e.into()),
        };

        let snapshot = self.store.snapshot(&intent.entity_id, now)?;
        if entity.status == EntityStatus::Suspended {
            return Ok(Evaluation::terminal(self.denied(
                decision_id,
                intent,
                snapshot,
                DenialCode::EntitySuspended,
                format!("entity {} is suspended", intent.entity_id),
                now,
            )));
        }

        // Check 1: trust. The provider may serve a cached score within
        // its TTL; that staleness is a bounded, accepted tradeoff.
        let snapshot = self.trust.get_score(&intent.entity_id)?;
        let required = self.requirements.required_tier(intent.risk_level, &requested);
        if snapshot.tier < required {
            return Ok(Evaluation::terminal(self.denied(
                decision_id,
                intent,
                snapshot,
                DenialCode::InsufficientTrust,
                format!(
                    "tier {} is below the {} minimum for this request",
                    snapshot.tier,
                    required.label()
                ),
                now,
            )));
        }

        // Check 2: capabilities.
        let grants = CapabilityPattern::parse_all(&entity.explicit_grants)?;
        let denies = CapabilityPattern::parse_all(&entity.explicit_denies)?;
        let resolved = self
            .resolver
            .resolve(snapshot.tier, &grants, &denies, &requested);
        if resolved.granted.is_empty() {
            let listing: Vec<&str> = resolved
                .denied
                .iter()
                .map(|d| d.capability.as_str())
                .collect();
            return Ok(Evaluation::terminal(self.denied(
                decision_id,
                intent,
                snapshot,
                DenialCode::CapabilityDenied,
                format!("no requested capability is available: {}", listing.join(", ")),
                now,
            )));
        }
        let mut granted = resolved.granted.clone();
        let mut degraded: Vec<String> = resolved
            .denied
            .iter()
            .map(|d| d.capability.clone())
            .collect();
        let mut degrade_reason = if degraded.is_empty() {
            None
        } else {
            Some("requested capabilities outside the effective set were withheld".to_string())
        };

        // Check 3: policy.
        let input = PolicyInput {
            trust_score: snapshot.score,
            trust_tier: snapshot.tier,
            risk_level: intent.risk_level,
            action: &intent.action,
            context: &intent.context,
        };
        let verdict = self.policies.evaluate(&input);
        match verdict.action {
            PolicyAction::Deny => {
                let mut decision = self.denied(
                    decision_id,
                    intent,
                    snapshot,
                    DenialCode::PolicyViolation,
                    match &verdict.decided_by {
                        Some(id) => format!("denied by policy {id}"),
                        None => "denied by policy".to_string(),
                    },
                    now,
                );
                decision.policy_references = verdict.matched;
                return Ok(Evaluation::terminal(decision));
            }
            PolicyAction::Escalate => {
                let target = verdict
                    .escalation_target
                    .clone()
                    .unwrap_or_else(|| DEFAULT_ESCALATION_TARGET.to_string());
                let reason = match &verdict.decided_by {
                    Some(id) => format!("escalated by policy {id}"),
                    None => "escalated by policy".to_string(),
                };
                let record = EscalationRecord {
                    escalation_id: EscalationId::generate(),
                    decision_id: decision_id.clone(),
                    intent_id: intent.intent_id.clone(),
                    entity_id: intent.entity_id.clone(),
                    target,
                    reason: reason.clone(),
                    created_at: now,
                    expires_at: now + Duration::hours(ESCALATION_EXPIRY_HOURS),
                    status: EscalationStatus::Pending,
                    resolved_by: None,
                    resolved_at: None,
                };
                let mut decision =
                    self.base_decision(decision_id, intent, snapshot, DecisionOutcome::Escalate, now);
                decision.policy_references = verdict.matched;
                decision.escalation_id = Some(record.escalation_id.clone());
                decision.reason = Some(reason);
                // The record is opened at commit, not here.
                return Ok(Evaluation {
                    decision,
                    escalation: Some(record),
                    rate_charge: None,
                });
            }
            PolicyAction::Limit => {
                if let Some(limit) = &verdict.limit {
                    granted.retain(|c| !limit.drop_capabilities.contains(c));
                    for dropped in &limit.drop_capabilities {
                        if !degraded.contains(dropped) {
                            degraded.push(dropped.clone());
                        }
                    }
                    degrade_reason = Some(limit.reason.clone());
                    if granted.is_empty() {
                        let mut decision = self.denied(
                            decision_id,
                            intent,
                            snapshot,
                            DenialCode::PolicyViolation,
                            format!("policy limit removed every requested capability: {}", limit.reason),
                            now,
                        );
                        decision.policy_references = verdict.matched;
                        return Ok(Evaluation::terminal(decision));
                    }
                }
            }
            PolicyAction::Allow => {}
        }

        // Check 4: rate.
        if let Err(exceeded) = self.rate.check(&intent.entity_id, snapshot.tier, now) {
            let mut decision = self.denied(
                decision_id,
                intent,
                snapshot,
                DenialCode::RateLimitExceeded,
                format!(
                    "rate limit reached, retry after {}s",
                    exceeded.retry_after_seconds
                ),
                now,
            );
            decision.retry_after_seconds = Some(exceeded.retry_after_seconds);
            decision.policy_references = verdict.matched;
            return Ok(Evaluation::terminal(decision));
        }

        let outcome = if degraded.is_empty() {
            DecisionOutcome::Allow
        } else {
            DecisionOutcome::Degrade
        };
        let mut decision = self.base_decision(decision_id, intent, snapshot, outcome, now);
        decision.capabilities_granted = granted;
        decision.policy_references = verdict.matched;
        decision.degraded_capabilities = degraded;
        decision.reason = degrade_reason;
        debug!(
            intent_id = %intent.intent_id,
            outcome = ?decision.outcome,
            granted = decision.capabilities_granted.len(),
            "intent evaluated"
        );
        // Quota is charged at commit, once the decision is kept.
        Ok(Evaluation {
            decision,
            escalation: None,
            rate_charge: Some((intent.entity_id.clone(), now)),
        })
    }

    /// Apply an evaluation's pending effects and release its decision.
    /// Called exactly once per committed decision.
    pub fn commit(&self, evaluation: Evaluation) -> Decision {
        if let Some(record) = evaluation.escalation {
            info!(
                intent_id = %record.intent_id,
                escalation_id = %record.escalation_id,
                target = %record.target,
                "intent escalated for human review"
            );
            self.escalations.open(record);
        }
        if let Some((entity_id, at)) = evaluation.rate_charge {
            self.rate.record(&entity_id, at);
        }
        evaluation.decision
    }

    fn base_decision(
        &self,
        decision_id: DecisionId,
        intent: &IntentRecord,
        snapshot: TrustSnapshot,
        outcome: DecisionOutcome,
        now: DateTime<Utc>,
    ) -> Decision {
        Decision {
            decision_id,
            intent_id: intent.intent_id.clone(),
            entity_id: intent.entity_id.clone(),
            outcome,
            trust_score_at_decision: snapshot.score,
            trust_tier_at_decision: snapshot.tier,
            capabilities_granted: vec![],
            policy_references: vec![],
            denial_code: None,
            reason: None,
            escalation_id: None,
            degraded_capabilities: vec![],
            retry_after_seconds: None,
            decided_at: now,
            proof_id: None,
        }
    }

    fn denied(
        &self,
        decision_id: DecisionId,
        intent: &IntentRecord,
        snapshot: TrustSnapshot,
        code: DenialCode,
        reason: String,
        now: DateTime<Utc>,
    ) -> Decision {
        let mut decision =
            self.base_decision(decision_id, intent, snapshot, DecisionOutcome::Deny, now);
        decision.denial_code = Some(code);
        decision.reason = Some(reason);
        decision
    }
}
