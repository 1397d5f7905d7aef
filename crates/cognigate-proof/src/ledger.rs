//! The append-only proof ledger.
//!
//! Sequence numbers are assigned under a single write lock, which is
//! the ledger's only serialization point: concurrent appends queue on
//! it instead of racing, keeping the sequence gapless. The optional
//! JSONL sink is written and synced inside the same critical section so
//! a record is durable before its append returns.

use chrono::{DateTime, Utc};
use cognigate_types::{Decision, DecisionOutcome, EntityId, IntentId, IntentRecord, ProofId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::error;

use crate::record::{canonical_payload, chain_hash, AnchorRef, ProofRecord, GENESIS_HASH};
use crate::record::sha256_hex;
use crate::verify::{verify_records, ChainCheck, ChainVerification};
use crate::{ProofError, CHAIN_ALARM_TARGET};

struct JsonlSink {
    file: File,
}

impl JsonlSink {
    fn open(path: &PathBuf) -> Result<Self, ProofError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file })
    }

    fn write(&mut self, record: &ProofRecord) -> Result<(), ProofError> {
        let line = serde_json::to_string(record)?;
        self.file.write_all(line.as_bytes())?;
        self.file.write_all(b"\n")?;
        self.file.sync_data()?;
        Ok(())
    }
}

struct LedgerState {
    records: Vec<ProofRecord>,
    last_hash: String,
    sink: Option<JsonlSink>,
}

/// Filter over ledger records, applied in sequence order.
#[derive(Clone, Debug, Default)]
pub struct ProofQuery {
    entity_id: Option<EntityId>,
    intent_id: Option<IntentId>,
    outcome: Option<DecisionOutcome>,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
    anchored: Option<bool>,
    offset: usize,
    limit: Option<usize>,
    descending: bool,
}

impl ProofQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entity(mut self, entity_id: EntityId) -> Self {
        self.entity_id = Some(entity_id);
        self
    }

    pub fn intent(mut self, intent_id: IntentId) -> Self {
        self.intent_id = Some(intent_id);
        self
    }

    pub fn outcome(mut self, outcome: DecisionOutcome) -> Self {
        self.outcome = Some(outcome);
        self
    }

    pub fn from(mut self, time: DateTime<Utc>) -> Self {
        self.from = Some(time);
        self
    }

    pub fn to(mut self, time: DateTime<Utc>) -> Self {
        self.to = Some(time);
        self
    }

    pub fn anchored(mut self, anchored: bool) -> Self {
        self.anchored = Some(anchored);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn descending(mut self) -> Self {
        self.descending = true;
        self
    }

    fn matches(&self, record: &ProofRecord) -> bool {
        if let Some(entity_id) = &self.entity_id {
            if &record.entity_id != entity_id {
                return false;
            }
        }
        if let Some(intent_id) = &self.intent_id {
            if &record.intent_id != intent_id {
                return false;
            }
        }
        if let Some(outcome) = self.outcome {
            if record.outcome != outcome {
                return false;
            }
        }
        if let Some(from) = self.from {
            if record.created_at < from {
                return false;
            }
        }
        if let Some(to) = self.to {
            if record.created_at > to {
                return false;
            }
        }
        if let Some(anchored) = self.anchored {
            if record.is_anchored() != anchored {
                return false;
            }
        }
        true
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerStats {
    pub total_records: u64,
    pub allowed: u64,
    pub denied: u64,
    pub escalated: u64,
    pub degraded: u64,
    pub anchored: u64,
    pub head_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_at: Option<DateTime<Utc>>,
}

pub struct ProofLedger {
    state: RwLock<LedgerState>,
    integrity_failed: AtomicBool,
}

impl ProofLedger {
    /// In-memory ledger, used in tests and by deployments that rely on
    /// anchoring plus an external archive.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(LedgerState {
                records: Vec::new(),
                last_hash: GENESIS_HASH.to_string(),
                sink: None,
            }),
            integrity_failed: AtomicBool::new(false),
        }
    }

    /// Ledger with a durable JSONL sink; every append is written and
    /// synced before it returns.
    pub fn with_sink(path: impl Into<PathBuf>) -> Result<Self, ProofError> {
        let ledger = Self::new();
        ledger.state.write().sink = Some(JsonlSink::open(&path.into())?);
        Ok(ledger)
    }

    /// Commit a decision. The payload is hashed exactly as passed in;
    /// the caller sets the decision's `proof_id` afterwards, outside the
    /// hash preimage.
    pub fn append(
        &self,
        decision: &Decision,
        intent: &IntentRecord,
        now: DateTime<Utc>,
    ) -> Result<ProofRecord, ProofError> {
        let payload = canonical_payload(decision, intent)?;
        let payload_hash = sha256_hex(&payload);

        let mut state = self.state.write();
        let previous_hash = state.last_hash.clone();
        let record = ProofRecord {
            proof_id: ProofId::generate(),
            sequence: state.records.len() as u64,
            entity_id: decision.entity_id.clone(),
            intent_id: decision.intent_id.clone(),
            decision_id: decision.decision_id.clone(),
            outcome: decision.outcome,
            chain_hash: chain_hash(&previous_hash, &payload_hash),
            payload,
            payload_hash,
            previous_hash,
            signature: None,
            anchor: None,
            created_at: now,
        };
        if let Some(sink) = state.sink.as_mut() {
            sink.write(&record)?;
        }
        state.last_hash = record.chain_hash.clone();
        state.records.push(record.clone());
        Ok(record)
    }

    pub fn get(&self, proof_id: &ProofId) -> Result<ProofRecord, ProofError> {
        self.state
            .read()
            .records
            .iter()
            .find(|r| &r.proof_id == proof_id)
            .cloned()
            .ok_or_else(|| ProofError::NotFound(proof_id.clone()))
    }

    pub fn get_sequence(&self, sequence: u64) -> Result<ProofRecord, ProofError> {
        self.state
            .read()
            .records
            .get(sequence as usize)
            .cloned()
            .ok_or(ProofError::UnknownSequence(sequence))
    }

    pub fn by_intent(&self, intent_id: &IntentId) -> Option<ProofRecord> {
        self.state
            .read()
            .records
            .iter()
            .find(|r| &r.intent_id == intent_id)
            .cloned()
    }

    pub fn query(&self, query: &ProofQuery) -> Vec<ProofRecord> {
        let state = self.state.read();
        let mut hits: Vec<ProofRecord> = state
            .records
            .iter()
            .filter(|r| query.matches(r))
            .cloned()
            .collect();
        if query.descending {
            hits.reverse();
        }
        hits.into_iter()
            .skip(query.offset)
            .take(query.limit.unwrap_or(usize::MAX))
            .collect()
    }

    pub fn stats(&self) -> LedgerStats {
        let state = self.state.read();
        let count = |outcome: DecisionOutcome| {
            state.records.iter().filter(|r| r.outcome == outcome).count() as u64
        };
        LedgerStats {
            total_records: state.records.len() as u64,
            allowed: count(DecisionOutcome::Allow),
            denied: count(DecisionOutcome::Deny),
            escalated: count(DecisionOutcome::Escalate),
            degraded: count(DecisionOutcome::Degrade),
            anchored: state.records.iter().filter(|r| r.is_anchored()).count() as u64,
            head_hash: state.last_hash.clone(),
            first_at: state.records.first().map(|r| r.created_at),
            last_at: state.records.last().map(|r| r.created_at),
        }
    }

    pub fn len(&self) -> usize {
        self.state.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().records.is_empty()
    }

    pub fn head_hash(&self) -> String {
        self.state.read().last_hash.clone()
    }

    /// Oldest committed records with no anchor yet, in sequence order.
    pub fn unanchored(&self, limit: usize) -> Vec<ProofRecord> {
        self.state
            .read()
            .records
            .iter()
            .filter(|r| !r.is_anchored())
            .take(limit)
            .cloned()
            .collect()
    }

    /// Attach an external anchor to committed records. Only the anchor
    /// field changes; the hash preimage is untouched.
    pub fn attach_anchor(&self, sequences: &[u64], anchor: AnchorRef) -> Result<(), ProofError> {
        let mut state = self.state.write();
        for sequence in sequences {
            if *sequence as usize >= state.records.len() {
                return Err(ProofError::UnknownSequence(*sequence));
            }
        }
        for sequence in sequences {
            state.records[*sequence as usize].anchor = Some(anchor.clone());
        }
        Ok(())
    }

    /// Recompute the chain up to `upto` (inclusive, default all). A
    /// break raises the chain alarm and halts the anchoring pipeline
    /// until `mark_reconciled` is called.
    pub fn verify_chain(&self, upto: Option<u64>) -> ChainVerification {
        let report = {
            let state = self.state.read();
            verify_records(&state.records, upto)
        };
        if let Some(sequence) = report.first_invalid {
            self.integrity_failed.store(true, Ordering::SeqCst);
            error!(
                target: CHAIN_ALARM_TARGET,
                first_invalid = sequence,
                checked = report.checks.len(),
                "proof chain integrity broken"
            );
        }
        report
    }

    /// Verify a single record's payload hash and linkage to its stored
    /// predecessor.
    pub fn verify_record(&self, proof_id: &ProofId) -> Result<ChainCheck, ProofError> {
        let state = self.state.read();
        let record = state
            .records
            .iter()
            .find(|r| &r.proof_id == proof_id)
            .ok_or_else(|| ProofError::NotFound(proof_id.clone()))?;
        let expected_prev = match record.sequence {
            0 => GENESIS_HASH.to_string(),
            n => state
                .records
                .get(n as usize - 1)
                .map(|r| r.chain_hash.clone())
                .ok_or(ProofError::UnknownSequence(n - 1))?,
        };
        let payload_hash = sha256_hex(&record.payload);
        let expected = chain_hash(&expected_prev, &payload_hash);
        Ok(ChainCheck {
            sequence: record.sequence,
            valid: payload_hash == record.payload_hash
                && record.previous_hash == expected_prev
                && expected == record.chain_hash,
            expected_hash: expected,
            actual_hash: record.chain_hash.clone(),
        })
    }

    pub fn chain_intact(&self) -> bool {
        !self.integrity_failed.load(Ordering::SeqCst)
    }

    /// Clear the integrity alarm after manual reconciliation.
    pub fn mark_reconciled(&self) {
        self.integrity_failed.store(false, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub(crate) fn tamper_payload(&self, sequence: u64, payload: &str) {
        let mut state = self.state.write();
        state.records[sequence as usize].payload = payload.to_string();
    }
}

impl Default for ProofLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::sample_decision;

    fn ledger_with(n: usize) -> ProofLedger {
        let ledger = ProofLedger::new();
        for i in 0..n {
            let (decision, intent) = sample_decision(&format!("agent-{i}"));
            ledger.append(&decision, &intent, Utc::now()).unwrap();
        }
        ledger
    }

    #[test]
    fn appends_are_gapless_and_linked() {
        let ledger = ledger_with(3);
        let records = ledger.query(&ProofQuery::new());
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].sequence, 0);
        assert_eq!(records[0].previous_hash, GENESIS_HASH);
        assert_eq!(records[1].previous_hash, records[0].chain_hash);
        assert_eq!(records[2].previous_hash, records[1].chain_hash);
        assert_eq!(ledger.head_hash(), records[2].chain_hash);
    }

    #[test]
    fn untouched_chain_verifies_all_valid() {
        let ledger = ledger_with(5);
        let report = ledger.verify_chain(None);
        assert!(report.valid);
        assert!(report.first_invalid.is_none());
        assert_eq!(report.checks.len(), 5);
        assert!(report.checks.iter().all(|c| c.valid));
        assert!(ledger.chain_intact());
    }

    #[test]
    fn tampering_one_record_invalidates_it_and_all_later_ones() {
        let ledger = ledger_with(5);
        // Third record of five.
        ledger.tamper_payload(2, "{\"altered\":true}");

        let report = ledger.verify_chain(None);
        assert!(!report.valid);
        assert_eq!(report.first_invalid, Some(2));
        assert!(report.checks[0].valid);
        assert!(report.checks[1].valid);
        assert!(!report.checks[2].valid);
        assert!(!report.checks[3].valid);
        assert!(!report.checks[4].valid);
        assert!(!ledger.chain_intact());

        ledger.mark_reconciled();
        assert!(ledger.chain_intact());
    }

    #[test]
    fn verify_chain_honors_upto() {
        let ledger = ledger_with(5);
        ledger.tamper_payload(3, "{\"altered\":true}");

        let early = ledger.verify_chain(Some(2));
        assert!(early.valid);
        assert_eq!(early.checks.len(), 3);

        let full = ledger.verify_chain(None);
        assert_eq!(full.first_invalid, Some(3));
    }

    #[test]
    fn verify_record_checks_a_single_link() {
        let ledger = ledger_with(3);
        let record = ledger.get_sequence(1).unwrap();
        assert!(ledger.verify_record(&record.proof_id).unwrap().valid);

        ledger.tamper_payload(1, "{\"altered\":true}");
        assert!(!ledger.verify_record(&record.proof_id).unwrap().valid);
    }

    #[test]
    fn queries_filter_and_paginate() {
        let ledger = ProofLedger::new();
        for i in 0..4 {
            let (mut decision, intent) = sample_decision("agent-q");
            if i % 2 == 0 {
                decision.outcome = DecisionOutcome::Deny;
            }
            ledger.append(&decision, &intent, Utc::now()).unwrap();
        }
        let (decision, intent) = sample_decision("someone-else");
        ledger.append(&decision, &intent, Utc::now()).unwrap();

        let denies = ledger.query(
            &ProofQuery::new()
                .entity(EntityId::new("agent-q"))
                .outcome(DecisionOutcome::Deny),
        );
        assert_eq!(denies.len(), 2);

        let page = ledger.query(
            &ProofQuery::new()
                .entity(EntityId::new("agent-q"))
                .descending()
                .limit(2),
        );
        assert_eq!(page.len(), 2);
        assert!(page[0].sequence > page[1].sequence);
    }

    #[test]
    fn stats_count_outcomes() {
        let ledger = ledger_with(2);
        let (mut decision, intent) = sample_decision("agent-s");
        decision.outcome = DecisionOutcome::Escalate;
        ledger.append(&decision, &intent, Utc::now()).unwrap();

        let stats = ledger.stats();
        assert_eq!(stats.total_records, 3);
        assert_eq!(stats.allowed, 2);
        assert_eq!(stats.escalated, 1);
        assert_eq!(stats.anchored, 0);
        assert_eq!(stats.head_hash, ledger.head_hash());
    }

    #[test]
    fn lookup_by_intent_and_proof_id() {
        let ledger = ProofLedger::new();
        let (decision, intent) = sample_decision("agent-l");
        let record = ledger.append(&decision, &intent, Utc::now()).unwrap();

        assert_eq!(
            ledger.by_intent(&intent.intent_id).unwrap().proof_id,
            record.proof_id
        );
        assert_eq!(ledger.get(&record.proof_id).unwrap().sequence, 0);
        assert!(matches!(
            ledger.get(&ProofId::generate()),
            Err(ProofError::NotFound(_))
        ));
    }

    #[test]
    fn jsonl_sink_persists_each_append() {
        let path = std::env::temp_dir().join(format!(
            "cognigate-proof-{}.jsonl",
            ProofId::generate()
        ));
        let ledger = ProofLedger::with_sink(&path).unwrap();
        let (decision, intent) = sample_decision("agent-d");
        let record = ledger.append(&decision, &intent, Utc::now()).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 1);
        let parsed: ProofRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed, record);
        std::fs::remove_file(&path).unwrap();
    }
}
