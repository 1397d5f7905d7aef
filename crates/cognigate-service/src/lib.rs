//! Cognigate Service - the unified governance facade.
//!
//! Every intent MUST pass through here before execution. The service
//! composes the trust engine, capability resolver, policy engine,
//! decision engine and proof ledger, and owns the two cross-cutting
//! guarantees the components cannot provide alone: the decision
//! timeout (fail closed, with a proof record even for the failure) and
//! intent idempotency (one proof record per intent id, even under
//! concurrent duplicates; replays return the recorded decision).

#![deny(unsafe_code)]

use chrono::Utc;
use cognigate_capability::{CapabilityError, CapabilityPattern, CapabilityResolver, TierDefaults};
use cognigate_enforce::{
    DecisionEngine, EnforceError, EscalationRecord, Evaluation, RateLimits, TrustRequirements,
};
use cognigate_policy::{PolicyEngine, PolicyError};
use cognigate_proof::{
    AnchorConfig, AnchorPipeline, AnchorSubmitter, ChainCheck, ChainVerification, LedgerStats,
    ProofError, ProofLedger, ProofQuery, ProofRecord,
};
use cognigate_trust::{
    EntityStore, LocalTrustProvider, TrustError, TrustProvider, TrustSignal,
};
use cognigate_types::{
    Decision, DecisionId, DecisionOutcome, DenialCode, EnforceResponse, Entity, EntityId,
    ErrorCategory, ErrorEnvelope, EscalationId, IntentId, IntentRecord, ProofId, RequestId,
    TrustSnapshot,
};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Trust(#[from] TrustError),

    #[error(transparent)]
    Capability(#[from] CapabilityError),

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Enforce(#[from] EnforceError),

    #[error(transparent)]
    Proof(#[from] ProofError),

    #[error("internal inconsistency: {0}")]
    Internal(String),
}

impl ServiceError {
    pub fn error_code(&self) -> &'static str {
        match self {
            ServiceError::Trust(e) => e.error_code(),
            ServiceError::Capability(e) => e.error_code(),
            ServiceError::Policy(e) => e.error_code(),
            ServiceError::Enforce(e) => e.error_code(),
            ServiceError::Proof(e) => e.error_code(),
            ServiceError::Internal(_) => "E1901",
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            ServiceError::Trust(_) => ErrorCategory::Trust,
            ServiceError::Capability(_) => ErrorCategory::Capability,
            ServiceError::Policy(_) | ServiceError::Enforce(_) => ErrorCategory::Enforce,
            ServiceError::Proof(e) if e.error_code().starts_with("E15") => ErrorCategory::Chain,
            ServiceError::Proof(_) => ErrorCategory::Proof,
            ServiceError::Internal(_) => ErrorCategory::System,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            ServiceError::Trust(e) => e.is_retryable(),
            ServiceError::Enforce(e) => e.is_retryable(),
            ServiceError::Proof(e) => e.is_retryable(),
            ServiceError::Internal(_) => true,
            _ => false,
        }
    }

    /// Fixed error envelope for failed requests. The request id is
    /// sufficient to correlate against the proof ledger.
    pub fn to_envelope(&self, request_id: RequestId) -> ErrorEnvelope {
        ErrorEnvelope {
            error_code: self.error_code().to_string(),
            error_category: self.category(),
            error_message: self.to_string(),
            request_id,
            retry_after: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ServiceConfig {
    /// Hard budget for one enforce call; overruns fail closed.
    pub decision_timeout: Duration,
    /// Bounded staleness accepted for trust score reads.
    pub score_cache_ttl: Duration,
    pub rate_limits: RateLimits,
    /// Durable JSONL sink for the proof ledger; in-memory when unset.
    pub proof_log_path: Option<PathBuf>,
    pub anchor: AnchorConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            decision_timeout: Duration::from_millis(100),
            score_cache_ttl: Duration::from_secs(60),
            rate_limits: RateLimits::default(),
            proof_log_path: None,
            anchor: AnchorConfig::default(),
        }
    }
}

/// Overridable building blocks for `GovernanceService::with_parts`.
pub struct ServiceParts {
    pub store: Arc<EntityStore>,
    pub trust: Arc<dyn TrustProvider>,
    pub policies: Arc<PolicyEngine>,
    pub tier_defaults: TierDefaults,
    pub requirements: TrustRequirements,
    pub anchor_submitter: Option<Arc<dyn AnchorSubmitter>>,
}

/// The governance decision core.
pub struct GovernanceService {
    store: Arc<EntityStore>,
    local_trust: Option<Arc<LocalTrustProvider>>,
    policies: Arc<PolicyEngine>,
    engine: Arc<DecisionEngine>,
    ledger: Arc<ProofLedger>,
    pipeline: Option<AnchorPipeline>,
    /// Idempotency map: one decision per intent id, ever.
    decided: DashMap<IntentId, (IntentRecord, Decision)>,
    timeout: Duration,
}

impl GovernanceService {
    /// Service with local in-memory components and no anchoring.
    pub fn new(config: ServiceConfig) -> Result<Self, ServiceError> {
        let store = Arc::new(EntityStore::new());
        let local = Arc::new(LocalTrustProvider::new(store.clone(), config.score_cache_ttl));
        let parts = ServiceParts {
            store,
            trust: local.clone(),
            policies: Arc::new(PolicyEngine::new()),
            tier_defaults: TierDefaults::standard(),
            requirements: TrustRequirements::default(),
            anchor_submitter: None,
        };
        let mut service = Self::with_parts(config, parts)?;
        service.local_trust = Some(local);
        Ok(service)
    }

    /// Service with anchoring enabled. Must run inside a tokio runtime.
    pub fn with_anchoring(
        config: ServiceConfig,
        submitter: Arc<dyn AnchorSubmitter>,
    ) -> Result<Self, ServiceError> {
        let store = Arc::new(EntityStore::new());
        let local = Arc::new(LocalTrustProvider::new(store.clone(), config.score_cache_ttl));
        let parts = ServiceParts {
            store,
            trust: local.clone(),
            policies: Arc::new(PolicyEngine::new()),
            tier_defaults: TierDefaults::standard(),
            requirements: TrustRequirements::default(),
            anchor_submitter: Some(submitter),
        };
        let mut service = Self::with_parts(config, parts)?;
        service.local_trust = Some(local);
        Ok(service)
    }

    /// Assemble from explicit parts; remote trust providers and custom
    /// tier ladders come in through here.
    pub fn with_parts(config: ServiceConfig, parts: ServiceParts) -> Result<Self, ServiceError> {
        let ledger = Arc::new(match &config.proof_log_path {
            Some(path) => ProofLedger::with_sink(path.clone())?,
            None => ProofLedger::new(),
        });
        let engine = Arc::new(DecisionEngine::new(
            parts.store.clone(),
            parts.trust,
            CapabilityResolver::new(parts.tier_defaults),
            parts.policies.clone(),
            parts.requirements,
            config.rate_limits.clone(),
        ));
        let pipeline = parts
            .anchor_submitter
            .map(|submitter| AnchorPipeline::spawn(ledger.clone(), submitter, config.anchor.clone()));
        Ok(Self {
            store: parts.store,
            local_trust: None,
            policies: parts.policies,
            engine,
            ledger,
            pipeline,
            decided: DashMap::new(),
            timeout: config.decision_timeout,
        })
    }

    // ---- Entity operations ----

    pub fn register_entity(&self, id: EntityId, initial_score: u32) -> Result<Entity, ServiceError> {
        let entity = Entity::new(id, initial_score, Utc::now());
        self.store.register(entity.clone())?;
        Ok(entity)
    }

    pub fn suspend_entity(&self, id: &EntityId) -> Result<(), ServiceError> {
        self.store.suspend(id)?;
        self.invalidate(id);
        Ok(())
    }

    pub fn reinstate_entity(&self, id: &EntityId) -> Result<(), ServiceError> {
        self.store.reinstate(id)?;
        self.invalidate(id);
        Ok(())
    }

    /// Replace an entity's explicit grants and denies. Patterns are
    /// validated up front; a bare root wildcard is rejected here and
    /// can never reach the resolver.
    pub fn set_grants(
        &self,
        id: &EntityId,
        grants: Vec<String>,
        denies: Vec<String>,
    ) -> Result<(), ServiceError> {
        CapabilityPattern::parse_all(&grants)?;
        CapabilityPattern::parse_all(&denies)?;
        self.store.set_grants(id, grants, denies)?;
        Ok(())
    }

    /// Apply a scored outcome to an entity.
    pub fn apply_signal(
        &self,
        id: &EntityId,
        signal: TrustSignal,
    ) -> Result<TrustSnapshot, ServiceError> {
        let snapshot = self.store.apply_signal(id, signal, Utc::now())?;
        self.invalidate(id);
        Ok(snapshot)
    }

    pub fn trust_snapshot(&self, id: &EntityId) -> Result<TrustSnapshot, ServiceError> {
        Ok(self.store.snapshot(id, Utc::now())?)
    }

    fn invalidate(&self, id: &EntityId) {
        if let Some(local) = &self.local_trust {
            local.invalidate(id);
        }
    }

    // ---- Enforcement ----

    /// Evaluate one intent and commit the decision to the proof ledger.
    ///
    /// Replays return the recorded decision unchanged and append
    /// nothing. Overrunning the decision budget yields DENY with a
    /// proof record; ALLOW is never produced by a failure path.
    pub async fn enforce(&self, intent: IntentRecord) -> Result<EnforceResponse, ServiceError> {
        let request_id = RequestId::generate();

        if let Some(entry) = self.decided.get(&intent.intent_id) {
            let (_, decision) = entry.value();
            info!(intent_id = %intent.intent_id, "replayed intent, returning recorded decision");
            return self.respond(decision.clone(), request_id);
        }

        let engine = self.engine.clone();
        let eval_intent = intent.clone();
        let task = tokio::task::spawn_blocking(move || evaluate_with_retry(&engine, &eval_intent));

        let evaluation = match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(Ok(evaluation))) => evaluation,
            Ok(Ok(Err(e))) if !e.is_retryable() => return Err(e.into()),
            Ok(Ok(Err(e))) => {
                warn!(intent_id = %intent.intent_id, error = %e, "evaluation failed, failing closed");
                Evaluation::terminal(self.fail_closed(
                    &intent,
                    DenialCode::InternalFailure,
                    format!("evaluation failed: {e}"),
                ))
            }
            Ok(Err(join_error)) => {
                warn!(intent_id = %intent.intent_id, error = %join_error, "evaluation task failed, failing closed");
                Evaluation::terminal(self.fail_closed(
                    &intent,
                    DenialCode::InternalFailure,
                    "evaluation task failed".to_string(),
                ))
            }
            Err(_) => {
                warn!(
                    intent_id = %intent.intent_id,
                    budget_ms = self.timeout.as_millis() as u64,
                    "decision budget exceeded, failing closed"
                );
                Evaluation::terminal(self.fail_closed(
                    &intent,
                    DenialCode::DecisionTimeout,
                    "decision budget exceeded".to_string(),
                ))
            }
        };

        self.commit(intent, evaluation, request_id)
    }

    /// Append exactly one proof record per intent id, apply the
    /// evaluation's effects, and record the decision for replay.
    /// Concurrent calls for one intent race on the reservation below;
    /// the loser discards its evaluation untouched and returns the
    /// winner's recorded decision.
    fn commit(
        &self,
        intent: IntentRecord,
        evaluation: Evaluation,
        request_id: RequestId,
    ) -> Result<EnforceResponse, ServiceError> {
        match self.decided.entry(intent.intent_id.clone()) {
            Entry::Occupied(entry) => {
                let (_, decision) = entry.get().clone();
                info!(intent_id = %intent.intent_id, "intent already decided, returning recorded decision");
                self.respond(decision, request_id)
            }
            Entry::Vacant(slot) => {
                let record = self.append_with_retry(&evaluation.decision, &intent)?;
                let mut decision = self.engine.commit(evaluation);
                decision.proof_id = Some(record.proof_id.clone());
                info!(
                    intent_id = %decision.intent_id,
                    decision_id = %decision.decision_id,
                    outcome = ?decision.outcome,
                    proof_id = %record.proof_id,
                    "decision committed"
                );
                slot.insert((intent, decision.clone()));
                if let Some(pipeline) = &self.pipeline {
                    pipeline.notify();
                }
                self.respond(decision, request_id)
            }
        }
    }

    /// Transient storage failures get a few local retries before
    /// surfacing; a decision without a proof record is never returned.
    fn append_with_retry(
        &self,
        decision: &Decision,
        intent: &IntentRecord,
    ) -> Result<ProofRecord, ServiceError> {
        let mut last_err = None;
        for attempt in 0..3 {
            match self.ledger.append(decision, intent, Utc::now()) {
                Ok(record) => return Ok(record),
                Err(e) if e.is_retryable() => {
                    warn!(attempt, error = %e, "proof append failed, retrying");
                    std::thread::sleep(Duration::from_millis(10 << attempt));
                    last_err = Some(e);
                }
                Err(e) => return Err(e.into()),
            }
        }
        match last_err {
            Some(e) => Err(e.into()),
            None => Err(ServiceError::Internal("proof append retry loop".to_string())),
        }
    }

    /// Terminal fail-closed decision, produced when evaluation cannot
    /// complete inside the budget.
    fn fail_closed(&self, intent: &IntentRecord, code: DenialCode, reason: String) -> Decision {
        let snapshot = self
            .store
            .snapshot(&intent.entity_id, Utc::now())
            .unwrap_or_else(|_| TrustSnapshot::from_score(0));
        Decision {
            decision_id: DecisionId::generate(),
            intent_id: intent.intent_id.clone(),
            entity_id: intent.entity_id.clone(),
            outcome: DecisionOutcome::Deny,
            trust_score_at_decision: snapshot.score,
            trust_tier_at_decision: snapshot.tier,
            capabilities_granted: vec![],
            policy_references: vec![],
            denial_code: Some(code),
            reason: Some(reason),
            escalation_id: None,
            degraded_capabilities: vec![],
            retry_after_seconds: None,
            decided_at: Utc::now(),
            proof_id: None,
        }
    }

    fn respond(
        &self,
        decision: Decision,
        request_id: RequestId,
    ) -> Result<EnforceResponse, ServiceError> {
        let proof_id = decision
            .proof_id
            .clone()
            .ok_or_else(|| ServiceError::Internal("decision missing proof id".to_string()))?;
        let escalation = decision
            .escalation_id
            .as_ref()
            .and_then(|id| self.engine.escalations().get(id));
        let is_deny = decision.outcome == DecisionOutcome::Deny;
        let is_degrade = decision.outcome == DecisionOutcome::Degrade;
        Ok(EnforceResponse {
            decision: decision.outcome,
            intent_id: decision.intent_id,
            entity_id: decision.entity_id,
            trust_score: decision.trust_score_at_decision,
            trust_tier: decision.trust_tier_at_decision,
            proof_id,
            request_id,
            capabilities_granted: decision.capabilities_granted,
            denial_code: decision
                .denial_code
                .filter(|_| is_deny)
                .map(|c| c.code().to_string()),
            denial_reason: if is_deny { decision.reason.clone() } else { None },
            escalation_id: decision.escalation_id,
            escalation_target: escalation.as_ref().map(|e| e.target.clone()),
            escalation_reason: escalation.map(|e| e.reason),
            degraded_capabilities: decision.degraded_capabilities,
            degrade_reason: if is_degrade { decision.reason } else { None },
            retry_after_seconds: decision.retry_after_seconds,
            decided_at: decision.decided_at,
        })
    }

    // ---- Escalations ----

    pub fn pending_escalations(&self) -> Vec<EscalationRecord> {
        self.engine.escalations().pending(Utc::now())
    }

    /// Record a human verdict on a pending escalation. The resolution
    /// becomes a NEW proof record referencing the original decision;
    /// existing records are never edited.
    pub fn resolve_escalation(
        &self,
        id: &EscalationId,
        approved: bool,
        reviewer: &str,
    ) -> Result<(EscalationRecord, ProofRecord), ServiceError> {
        let now = Utc::now();
        let resolved = self.engine.escalations().resolve(id, approved, reviewer, now)?;
        let entry = self
            .decided
            .get(&resolved.intent_id)
            .ok_or_else(|| ServiceError::Internal("escalated intent has no recorded decision".to_string()))?;
        let (intent, original) = entry.value().clone();
        drop(entry);

        let resolution = Decision {
            decision_id: DecisionId::generate(),
            intent_id: resolved.intent_id.clone(),
            entity_id: resolved.entity_id.clone(),
            outcome: if approved {
                DecisionOutcome::Allow
            } else {
                DecisionOutcome::Deny
            },
            trust_score_at_decision: original.trust_score_at_decision,
            trust_tier_at_decision: original.trust_tier_at_decision,
            capabilities_granted: if approved {
                intent.capabilities_required.clone()
            } else {
                vec![]
            },
            policy_references: original.policy_references.clone(),
            denial_code: if approved { None } else { Some(DenialCode::PolicyViolation) },
            reason: Some(format!(
                "escalation {} {} by {} for decision {}",
                resolved.escalation_id,
                if approved { "approved" } else { "rejected" },
                reviewer,
                original.decision_id
            )),
            escalation_id: Some(resolved.escalation_id.clone()),
            degraded_capabilities: vec![],
            retry_after_seconds: None,
            decided_at: now,
            proof_id: None,
        };
        let record = self.append_with_retry(&resolution, &intent)?;
        if let Some(pipeline) = &self.pipeline {
            pipeline.notify();
        }
        info!(
            escalation_id = %resolved.escalation_id,
            approved,
            proof_id = %record.proof_id,
            "escalation resolved"
        );
        Ok((resolved, record))
    }

    // ---- Proof operations ----

    pub fn proof(&self, proof_id: &ProofId) -> Result<ProofRecord, ServiceError> {
        Ok(self.ledger.get(proof_id)?)
    }

    pub fn proof_for_intent(&self, intent_id: &IntentId) -> Option<ProofRecord> {
        self.ledger.by_intent(intent_id)
    }

    pub fn proofs(&self, query: &ProofQuery) -> Vec<ProofRecord> {
        self.ledger.query(query)
    }

    pub fn ledger_stats(&self) -> LedgerStats {
        self.ledger.stats()
    }

    pub fn verify_chain(&self, upto: Option<u64>) -> ChainVerification {
        self.ledger.verify_chain(upto)
    }

    pub fn verify_proof(&self, proof_id: &ProofId) -> Result<ChainCheck, ServiceError> {
        Ok(self.ledger.verify_record(proof_id)?)
    }

    // ---- Accessors ----

    pub fn policy_engine(&self) -> &PolicyEngine {
        &self.policies
    }

    pub fn entity_store(&self) -> &EntityStore {
        &self.store
    }

    pub async fn shutdown(mut self) {
        if let Some(pipeline) = self.pipeline.take() {
            pipeline.shutdown().await;
        }
    }
}

/// Transient trust faults get a couple of local retries inside the
/// decision budget before the request fails closed.
fn evaluate_with_retry(
    engine: &DecisionEngine,
    intent: &IntentRecord,
) -> Result<Evaluation, EnforceError> {
    let mut attempt = 0u32;
    loop {
        match engine.evaluate(intent, Utc::now()) {
            Err(e) if e.is_retryable() && attempt < 2 => {
                warn!(attempt, error = %e, "transient evaluation failure, retrying");
                std::thread::sleep(Duration::from_millis(5 << attempt));
                attempt += 1;
            }
            other => return other,
        }
    }
}
