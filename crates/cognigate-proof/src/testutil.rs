//! Shared fixtures for ledger tests.

use chrono::Utc;
use cognigate_types::{
    Decision, DecisionId, DecisionOutcome, EntityId, IntentId, IntentRecord, RiskLevel, TrustTier,
};
use std::collections::HashMap;

pub(crate) fn sample_decision(entity: &str) -> (Decision, IntentRecord) {
    let intent = IntentRecord {
        intent_id: IntentId::generate(),
        entity_id: EntityId::new(entity),
        action: "read_report".to_string(),
        capabilities_required: vec!["data:workspace/read".to_string()],
        risk_level: RiskLevel::Low,
        context: HashMap::new(),
        issued_at: Utc::now(),
    };
    let decision = Decision {
        decision_id: DecisionId::generate(),
        intent_id: intent.intent_id.clone(),
        entity_id: intent.entity_id.clone(),
        outcome: DecisionOutcome::Allow,
        trust_score_at_decision: 650,
        trust_tier_at_decision: TrustTier::Standard,
        capabilities_granted: intent.capabilities_required.clone(),
        policy_references: vec![],
        denial_code: None,
        reason: None,
        escalation_id: None,
        degraded_capabilities: vec![],
        retry_after_seconds: None,
        decided_at: Utc::now(),
        proof_id: None,
    };
    (decision, intent)
}
