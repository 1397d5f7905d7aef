//! Proof record structure and hashing.

use chrono::{DateTime, Utc};
use cognigate_types::{
    AnchorId, Decision, DecisionId, DecisionOutcome, EntityId, IntentId, IntentRecord, ProofId,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::ProofError;

/// Sentinel previous_hash of the genesis record, the only record exempt
/// from linking to a predecessor.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// External anchor attached after submission. The anchor lives outside
/// the hash preimage, so attaching it never changes the chain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchorRef {
    pub anchor_id: AnchorId,
    pub tx_id: String,
    pub block: u64,
    pub merkle_root: String,
    pub anchored_at: DateTime<Utc>,
}

/// One immutable link of the proof chain.
///
/// `payload` is the canonical serialization of the decision and its
/// input intent; `entity_id`, `intent_id`, `decision_id` and `outcome`
/// are projections of it kept for querying. The hash preimage is the
/// payload alone plus the predecessor's chain hash.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofRecord {
    pub proof_id: ProofId,
    /// Strictly monotonic and gapless, starting at 0.
    pub sequence: u64,
    pub entity_id: EntityId,
    pub intent_id: IntentId,
    pub decision_id: DecisionId,
    pub outcome: DecisionOutcome,
    pub payload: String,
    pub payload_hash: String,
    pub previous_hash: String,
    pub chain_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anchor: Option<AnchorRef>,
    pub created_at: DateTime<Utc>,
}

impl ProofRecord {
    pub fn is_anchored(&self) -> bool {
        self.anchor.is_some()
    }
}

/// What gets hashed: the decision and the intent it answered.
#[derive(Serialize)]
struct ProofPayload<'a> {
    decision: &'a Decision,
    intent: &'a IntentRecord,
}

/// Canonical JSON for the hash preimage. Serializing through `Value`
/// sorts every object's keys, so equal payloads always hash equally.
pub(crate) fn canonical_payload(
    decision: &Decision,
    intent: &IntentRecord,
) -> Result<String, ProofError> {
    let value = serde_json::to_value(ProofPayload { decision, intent })?;
    Ok(value.to_string())
}

pub(crate) fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

pub(crate) fn chain_hash(previous_hash: &str, payload_hash: &str) -> String {
    sha256_hex(&format!("{previous_hash}{payload_hash}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::sample_decision;

    #[test]
    fn canonical_payload_is_deterministic() {
        let (decision, intent) = sample_decision("agent-1");
        let a = canonical_payload(&decision, &intent).unwrap();
        let b = canonical_payload(&decision, &intent).unwrap();
        assert_eq!(a, b);
        assert_eq!(sha256_hex(&a), sha256_hex(&b));
    }

    #[test]
    fn genesis_sentinel_is_sixty_four_zeroes() {
        assert_eq!(GENESIS_HASH.len(), 64);
        assert!(GENESIS_HASH.chars().all(|c| c == '0'));
    }

    #[test]
    fn chain_hash_binds_predecessor_and_payload() {
        let payload_hash = sha256_hex("payload");
        let first = chain_hash(GENESIS_HASH, &payload_hash);
        let second = chain_hash(&first, &payload_hash);
        assert_ne!(first, second);
        assert_eq!(first.len(), 64);
    }
}
