//! Cognigate Proof - the hash-chained decision ledger.
//!
//! Every decision is committed as a `ProofRecord`: a canonical payload,
//! its SHA-256 hash, and a chain hash binding the record to its
//! predecessor. Records are append-only with gapless sequence numbers
//! assigned under a single writer lock. `verify_chain` recomputes the
//! whole linkage so a single altered or missing record invalidates
//! everything after it, with the break point reported unambiguously.
//!
//! Anchoring is a separate background pipeline: batches of committed
//! records are Merkle-rooted and submitted externally with retry and
//! backoff. An anchor is an additional guarantee; records stay valid
//! and queryable without one.

#![deny(unsafe_code)]

mod anchor;
mod ledger;
mod record;
#[cfg(test)]
pub(crate) mod testutil;
mod verify;

pub use anchor::{
    merkle_root, AnchorConfig, AnchorError, AnchorPipeline, AnchorReceipt, AnchorSubmitter,
};
pub use ledger::{LedgerStats, ProofLedger, ProofQuery};
pub use record::{AnchorRef, ProofRecord, GENESIS_HASH};
pub use verify::{ChainCheck, ChainVerification};

use cognigate_types::ProofId;
use thiserror::Error;

/// Log target for chain-integrity alarms. Breaks are an operational
/// incident, distinct from ordinary request errors.
pub const CHAIN_ALARM_TARGET: &str = "cognigate::chain_alarm";

#[derive(Debug, Error)]
pub enum ProofError {
    #[error("proof payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Durable write failed; callers retry with backoff.
    #[error("proof storage failed: {0}")]
    Storage(#[from] std::io::Error),

    #[error("proof not found: {0}")]
    NotFound(ProofId),

    #[error("sequence {0} does not exist")]
    UnknownSequence(u64),

    /// Fatal. Anchoring halts until the ledger is manually reconciled.
    #[error("chain integrity broken at sequence {0}")]
    ChainBroken(u64),
}

impl ProofError {
    pub fn error_code(&self) -> &'static str {
        match self {
            ProofError::Serialization(_) => "E1401",
            ProofError::Storage(_) => "E1402",
            ProofError::NotFound(_) => "E1403",
            ProofError::UnknownSequence(_) => "E1404",
            ProofError::ChainBroken(_) => "E1501",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ProofError::Storage(_))
    }
}
