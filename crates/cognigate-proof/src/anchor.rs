//! Background anchoring pipeline.
//!
//! Batches of committed records are Merkle-rooted and handed to an
//! `AnchorSubmitter` (the CHAIN boundary). The decision path only
//! nudges the pipeline; it never awaits submission. Failed submissions
//! back off exponentially and are abandoned after the retry budget,
//! to be retried on the next nudge. A broken chain halts the pipeline
//! entirely until the ledger is reconciled.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cognigate_types::{AnchorId, ProofId};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::ledger::ProofLedger;
use crate::record::{sha256_hex, AnchorRef};
use crate::CHAIN_ALARM_TARGET;

#[derive(Debug, Error)]
pub enum AnchorError {
    /// External submission failed; retried with backoff.
    #[error("anchor submission failed: {0}")]
    Submission(String),
}

impl AnchorError {
    pub fn error_code(&self) -> &'static str {
        "E1502"
    }

    pub fn is_retryable(&self) -> bool {
        true
    }
}

/// Merkle root over leaf hashes, pairwise SHA-256 with the last leaf
/// duplicated on odd levels. A single leaf is its own root.
pub fn merkle_root(leaves: &[String]) -> String {
    if leaves.is_empty() {
        return sha256_hex("");
    }
    let mut level = leaves.to_vec();
    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        for pair in level.chunks(2) {
            let right = pair.get(1).unwrap_or(&pair[0]);
            next.push(sha256_hex(&format!("{}{}", pair[0], right)));
        }
        level = next;
    }
    level.swap_remove(0)
}

/// Confirmation from the external chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AnchorReceipt {
    pub tx_id: String,
    pub block: u64,
    pub anchored_at: DateTime<Utc>,
}

/// The CHAIN boundary: submit a Merkle root covering a batch of proof
/// records, receive a confirmation asynchronously.
#[async_trait]
pub trait AnchorSubmitter: Send + Sync {
    async fn submit(
        &self,
        merkle_root: &str,
        proof_ids: &[ProofId],
    ) -> Result<AnchorReceipt, AnchorError>;
}

#[derive(Clone, Debug)]
pub struct AnchorConfig {
    pub batch_size: usize,
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for AnchorConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            max_retries: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// Handle to the background anchoring task.
pub struct AnchorPipeline {
    notify: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl AnchorPipeline {
    pub fn spawn(
        ledger: Arc<ProofLedger>,
        submitter: Arc<dyn AnchorSubmitter>,
        config: AnchorConfig,
    ) -> Self {
        let (notify, mut wakeups) = mpsc::channel::<()>(64);
        let handle = tokio::spawn(async move {
            while wakeups.recv().await.is_some() {
                // Coalesce queued nudges into one drain pass.
                while wakeups.try_recv().is_ok() {}
                drain(&ledger, submitter.as_ref(), &config).await;
            }
        });
        Self { notify, handle }
    }

    /// Fire-and-forget nudge from the decision path. A full queue means
    /// a drain is already pending, so dropping the nudge is fine.
    pub fn notify(&self) {
        let _ = self.notify.try_send(());
    }

    pub async fn shutdown(self) {
        drop(self.notify);
        let _ = self.handle.await;
    }
}

async fn drain(ledger: &ProofLedger, submitter: &dyn AnchorSubmitter, config: &AnchorConfig) {
    loop {
        if !ledger.chain_intact() {
            error!(
                target: CHAIN_ALARM_TARGET,
                "anchoring halted: proof chain integrity broken"
            );
            return;
        }
        let batch = ledger.unanchored(config.batch_size);
        if batch.is_empty() {
            return;
        }
        let leaves: Vec<String> = batch.iter().map(|r| r.chain_hash.clone()).collect();
        let root = merkle_root(&leaves);
        let proof_ids: Vec<ProofId> = batch.iter().map(|r| r.proof_id.clone()).collect();
        let sequences: Vec<u64> = batch.iter().map(|r| r.sequence).collect();

        let Some(receipt) = submit_with_backoff(submitter, &root, &proof_ids, config).await else {
            return;
        };
        let anchor = AnchorRef {
            anchor_id: AnchorId::generate(),
            tx_id: receipt.tx_id,
            block: receipt.block,
            merkle_root: root,
            anchored_at: receipt.anchored_at,
        };
        if let Err(e) = ledger.attach_anchor(&sequences, anchor) {
            warn!(error = %e, "failed to attach anchor to ledger");
            return;
        }
        info!(records = sequences.len(), "anchored proof batch");
    }
}

async fn submit_with_backoff(
    submitter: &dyn AnchorSubmitter,
    root: &str,
    proof_ids: &[ProofId],
    config: &AnchorConfig,
) -> Option<AnchorReceipt> {
    let mut backoff = config.initial_backoff;
    let mut attempt = 0;
    loop {
        match submitter.submit(root, proof_ids).await {
            Ok(receipt) => return Some(receipt),
            Err(e) => {
                attempt += 1;
                if attempt >= config.max_retries {
                    warn!(
                        error = %e,
                        attempts = attempt,
                        "anchor batch abandoned until the next nudge"
                    );
                    return None;
                }
                warn!(
                    error = %e,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    "anchor submission failed, backing off"
                );
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(config.max_backoff);
            }
        }
    }
}
