//! Chain verification.

use serde::{Deserialize, Serialize};

use crate::record::{chain_hash, sha256_hex, ProofRecord, GENESIS_HASH};

/// Verification result for one record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainCheck {
    pub sequence: u64,
    pub valid: bool,
    pub expected_hash: String,
    pub actual_hash: String,
}

/// Full verification report. `first_invalid` is the break point; every
/// record from there on is reported invalid because the recomputed
/// linkage no longer matches the stored one.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainVerification {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_invalid: Option<u64>,
    pub checks: Vec<ChainCheck>,
}

/// Recompute the chain from genesis. The running predecessor hash is
/// the recomputed one, not the stored one, so a single altered, missing
/// or reordered record cascades into every later check.
pub(crate) fn verify_records(records: &[ProofRecord], upto: Option<u64>) -> ChainVerification {
    let mut expected_prev = GENESIS_HASH.to_string();
    let mut checks = Vec::new();
    let mut first_invalid = None;

    for (index, record) in records.iter().enumerate() {
        if let Some(limit) = upto {
            if record.sequence > limit {
                break;
            }
        }
        let payload_hash = sha256_hex(&record.payload);
        let expected = chain_hash(&expected_prev, &payload_hash);
        let valid = record.sequence == index as u64
            && payload_hash == record.payload_hash
            && record.previous_hash == expected_prev
            && expected == record.chain_hash;
        if !valid && first_invalid.is_none() {
            first_invalid = Some(record.sequence);
        }
        checks.push(ChainCheck {
            sequence: record.sequence,
            valid,
            expected_hash: expected.clone(),
            actual_hash: record.chain_hash.clone(),
        });
        expected_prev = expected;
    }

    ChainVerification {
        valid: first_invalid.is_none(),
        first_invalid,
        checks,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_chain_verifies() {
        let report = verify_records(&[], None);
        assert!(report.valid);
        assert!(report.checks.is_empty());
    }
}
