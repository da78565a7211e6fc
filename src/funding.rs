//! Funding proof subsystem
//!
//! Provisional proofs are written inline when tasks are derived. Upgrading
//! them to confirmed proofs happens here, in a background loop that asks a
//! pluggable [`FundingProvider`] about every task whose proof is still
//! provisional.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::MarketError;
use crate::models::{MerkleProof, ProofStatus, Task, TaskFilter};
use crate::services::MarketService;
use crate::shutdown::Shutdown;

/// SHA-256 (lowercase hex) of a base64-encoded image's decoded bytes
pub fn visible_pixel_hash(image_base64: &str) -> Result<String, MarketError> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(image_base64.trim())
        .map_err(|e| MarketError::InvalidInput(format!("Image is not valid base64: {}", e)))?;
    if bytes.is_empty() {
        return Err(MarketError::InvalidInput("Image is empty".to_string()));
    }
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// Source of confirmed funding proofs
#[async_trait]
pub trait FundingProvider: Send + Sync {
    /// Return the best proof currently known for the task. A provisional
    /// answer means "not confirmed yet" and leaves the stored proof alone.
    async fn fetch_proof(&self, task: &Task) -> Result<MerkleProof, MarketError>;
}

/// Deterministic provider that confirms every task it is asked about.
///
/// Proof fields are derived from SHA-256 of the task and its funding
/// address, so repeated calls return the same proof. No network access.
pub struct SimulatedFundingProvider {
    block_height: u64,
}

impl SimulatedFundingProvider {
    pub fn new(block_height: u64) -> Self {
        Self { block_height }
    }
}

fn sha256_parts(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

#[async_trait]
impl FundingProvider for SimulatedFundingProvider {
    async fn fetch_proof(&self, task: &Task) -> Result<MerkleProof, MarketError> {
        let current = task
            .merkle_proof
            .as_ref()
            .ok_or_else(|| MarketError::Funding(format!("task {} has no funding proof", task.task_id)))?;
        let address = current.funding_address.clone().unwrap_or_default();
        let amount = current.funded_amount_sats.to_be_bytes();

        let leaf = sha256_parts(&[task.task_id.as_bytes(), address.as_bytes(), amount.as_slice()]);
        let left = sha256_parts(&[task.contract_id.as_bytes()]);
        let right = sha256_parts(&[address.as_bytes(), b"sibling".as_slice()]);
        let inner = sha256_parts(&[leaf.as_slice(), left.as_slice()]);
        let root = sha256_parts(&[inner.as_slice(), right.as_slice()]);

        let now = Utc::now();
        Ok(MerkleProof {
            tx_id: hex::encode(sha256_parts(&[leaf.as_slice()])),
            block_height: self.block_height,
            merkle_root: hex::encode(root),
            proof_path: vec![hex::encode(left), hex::encode(right)],
            funded_amount_sats: current.funded_amount_sats,
            funding_address: current.funding_address.clone(),
            confirmation_status: ProofStatus::Confirmed,
            seen_at: current.seen_at,
            confirmed_at: Some(now),
        })
    }
}

/// Counters for one reconciler tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    pub checked: usize,
    pub confirmed: usize,
    pub still_provisional: usize,
    pub failed: usize,
}

/// Background loop upgrading provisional proofs
pub struct FundingReconciler {
    service: Arc<MarketService>,
    provider: Arc<dyn FundingProvider>,
    interval: Duration,
    shutdown: Shutdown,
}

impl FundingReconciler {
    pub fn new(
        service: Arc<MarketService>,
        provider: Arc<dyn FundingProvider>,
        interval: Duration,
    ) -> Self {
        Self {
            service,
            provider,
            interval,
            shutdown: Shutdown::never(),
        }
    }

    /// Set shutdown signal
    pub fn with_shutdown(mut self, shutdown: impl Into<Shutdown>) -> Self {
        self.shutdown = shutdown.into();
        self
    }

    /// One pass over every provisional proof. Per-task failures are logged
    /// and counted, never returned.
    pub async fn tick(&self) -> Result<ReconcileStats, MarketError> {
        let tasks = self.service.list_tasks(&TaskFilter::provisional_proofs())?;
        let mut stats = ReconcileStats::default();

        for task in tasks {
            stats.checked += 1;

            let mut proof = match self.provider.fetch_proof(&task).await {
                Ok(proof) => proof,
                Err(e) => {
                    warn!(task_id = %task.task_id, error = %e, "Funding provider failed, skipping task");
                    stats.failed += 1;
                    continue;
                }
            };

            if !proof.is_confirmed() {
                debug!(task_id = %task.task_id, "Funding proof still provisional");
                stats.still_provisional += 1;
                continue;
            }
            if proof.confirmed_at.is_none() {
                proof.confirmed_at = Some(Utc::now());
            }

            match self.service.update_task_proof(&task.task_id, proof) {
                Ok(()) => {
                    info!(task_id = %task.task_id, "Funding proof confirmed");
                    stats.confirmed += 1;
                }
                Err(e) => {
                    warn!(task_id = %task.task_id, error = %e, "Failed to store confirmed proof");
                    stats.failed += 1;
                }
            }
        }

        Ok(stats)
    }

    /// Run until shutdown; a tick in progress always finishes first
    pub async fn run(mut self) {
        let mut timer = tokio::time::interval(self.interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(interval_secs = self.interval.as_secs(), "Funding reconciler started");

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    match self.tick().await {
                        Ok(stats) if stats.checked > 0 => {
                            info!(
                                checked = stats.checked,
                                confirmed = stats.confirmed,
                                failed = stats.failed,
                                "Funding reconcile pass complete"
                            );
                        }
                        Ok(_) => debug!("No provisional proofs to reconcile"),
                        Err(e) => warn!(error = %e, "Funding reconcile pass failed"),
                    }
                }
                _ = self.shutdown.recv() => {
                    info!("Funding reconciler shutdown requested");
                    break;
                }
            }
        }
    }
}
