//! Ingestion reconciler
//!
//! Pulls externally sourced wish records and turns each one into a contract
//! plus a pending proposal:
//!
//! ```text
//! IngestionSource (pending records)
//!     ↓ normalize envelope, hash attached image
//! structured contract+tasks doc ──or──> markdown wish
//!     ↓
//! MarketService::upsert_contract + upsert_proposal
//!     ↓
//! record marked verified | invalid (with note)
//! ```
//!
//! Wishes never produce tasks directly. Their tasks exist only as proposal
//! drafts until a proposal is approved.

pub mod parse;
pub mod source;

pub use parse::{normalize_payload, parse_markdown_wish, parse_structured, IngestedPlan, NormalizedPayload};
pub use source::{MemoryIngestionSource, SqliteIngestionSource};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::MarketError;
use crate::funding::visible_pixel_hash;
use crate::models::IngestionStatus;
use crate::services::{EventType, MarketService, SYSTEM_ACTOR};
use crate::shutdown::Shutdown;

/// One externally sourced wish
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionRecord {
    pub id: String,
    pub status: IngestionStatus,
    /// Markdown, a JSON document, or a JSON message envelope
    pub payload: String,
    #[serde(default)]
    pub image_base64: Option<String>,
    #[serde(default)]
    pub creator_api_key_hash: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl IngestionRecord {
    pub fn new(id: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: IngestionStatus::Pending,
            payload: payload.into(),
            image_base64: None,
            creator_api_key_hash: None,
            note: None,
            created_at: Utc::now(),
        }
    }
}

/// Where ingestion records come from and where their outcome goes back to
#[async_trait]
pub trait IngestionSource: Send + Sync {
    /// Most recent records in `status`, newest first
    async fn list_recent(
        &self,
        status: IngestionStatus,
        limit: usize,
    ) -> Result<Vec<IngestionRecord>, MarketError>;

    async fn update_status_with_note(
        &self,
        id: &str,
        status: IngestionStatus,
        note: &str,
    ) -> Result<(), MarketError>;
}

/// Counters for one ingestion tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub processed: usize,
    pub verified: usize,
    pub invalid: usize,
}

pub struct IngestionReconciler {
    service: Arc<MarketService>,
    source: Arc<dyn IngestionSource>,
    interval: Duration,
    batch_size: usize,
    shutdown: Shutdown,
}

impl IngestionReconciler {
    pub fn new(
        service: Arc<MarketService>,
        source: Arc<dyn IngestionSource>,
        interval: Duration,
        batch_size: usize,
    ) -> Self {
        Self {
            service,
            source,
            interval,
            batch_size,
            shutdown: Shutdown::never(),
        }
    }

    pub fn with_shutdown(mut self, shutdown: impl Into<Shutdown>) -> Self {
        self.shutdown = shutdown.into();
        self
    }

    /// Process one batch of pending records. Only a failure to list the
    /// batch is returned; per-record failures end up in the record's note.
    pub async fn tick(&self) -> Result<IngestStats, MarketError> {
        let records = self
            .source
            .list_recent(IngestionStatus::Pending, self.batch_size)
            .await?;
        let mut stats = IngestStats::default();

        for record in records {
            stats.processed += 1;

            let (status, note) = match self.process_record(&record) {
                Ok(note) => {
                    stats.verified += 1;
                    (IngestionStatus::Verified, note)
                }
                Err(e) => {
                    warn!(record_id = %record.id, error = %e, "Ingestion record rejected");
                    stats.invalid += 1;
                    (IngestionStatus::Invalid, e.to_string())
                }
            };

            if let Err(e) = self
                .source
                .update_status_with_note(&record.id, status, &note)
                .await
            {
                warn!(record_id = %record.id, error = %e, "Failed to mark ingestion record");
                continue;
            }

            self.service.events().emit(
                EventType::IngestionProcessed,
                &record.id,
                record
                    .creator_api_key_hash
                    .as_deref()
                    .unwrap_or(SYSTEM_ACTOR),
                format!("{}: {}", status, note),
            );
        }

        Ok(stats)
    }

    /// Parse one record and upsert what it describes; returns the note
    /// stored on success
    fn process_record(&self, record: &IngestionRecord) -> Result<String, MarketError> {
        let pixel_hash = record
            .image_base64
            .as_deref()
            .filter(|img| !img.trim().is_empty())
            .map(visible_pixel_hash)
            .transpose()?;

        let payload = normalize_payload(&record.payload);
        if payload.text.trim().is_empty() {
            return Err(MarketError::Ingestion("empty payload".to_string()));
        }

        let (kind, plan) = match parse_structured(&payload, record, pixel_hash.as_deref()) {
            Some(plan) => ("structured", plan),
            None => (
                "wish",
                parse_markdown_wish(&payload, record, pixel_hash.as_deref())?,
            ),
        };

        let contract = self.service.upsert_contract(plan.contract)?;
        let proposal = self.service.upsert_proposal(plan.proposal)?;
        debug!(record_id = %record.id, contract_id = %contract.contract_id, "Ingested {}", kind);

        Ok(format!(
            "{} ingested as {} with proposal {} ({} tasks)",
            kind,
            contract.contract_id,
            proposal.id,
            proposal.tasks.len()
        ))
    }

    /// Run until shutdown; a batch in progress always finishes first
    pub async fn run(mut self) {
        let mut timer = tokio::time::interval(self.interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            interval_secs = self.interval.as_secs(),
            batch_size = self.batch_size,
            "Ingestion reconciler started"
        );

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    match self.tick().await {
                        Ok(stats) if stats.processed > 0 => {
                            info!(
                                processed = stats.processed,
                                verified = stats.verified,
                                invalid = stats.invalid,
                                "Ingestion pass complete"
                            );
                        }
                        Ok(_) => debug!("No pending ingestion records"),
                        Err(e) => warn!(error = %e, "Ingestion pass failed"),
                    }
                }
                _ = self.shutdown.recv() => {
                    info!("Ingestion reconciler shutdown requested");
                    break;
                }
            }
        }
    }
}
