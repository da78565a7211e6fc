//! Marketplace store
//!
//! One capability interface, [`MarketStore`], with two variants:
//!
//! - [`SqliteStore`] - durable, every mutation is one `BEGIN IMMEDIATE`
//!   transaction so reads of sibling rows and the write share a snapshot
//! - [`MemoryStore`] - process-local maps behind a single coarse mutex
//!
//! Both delegate every lifecycle decision to [`rules`], so claim leasing,
//! submission transitions and proposal approval/publish behave identically.
//!
//! ## Tables (SQLite variant)
//!
//! - `contracts` - contract rows, skills as JSON
//! - `tasks` - task rows with lease mirror columns and the embedded proof as JSON
//! - `claims` - lease history, one `active` row per task at most
//! - `submissions` - deliverables and review state
//! - `proposals` - proposals with task drafts and metadata as JSON

pub mod memory;
pub mod rules;
pub mod schema;
pub mod sqlite;

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::info;

use crate::config::{Config, StoreBackend};
use crate::error::MarketError;
use crate::models::{
    Claim, Contract, ContractFilter, MerkleProof, Proposal, ProposalFilter, Submission, Task,
    TaskFilter,
};

pub use memory::MemoryStore;
pub use rules::ReviewAction;
pub use sqlite::SqliteStore;

/// Result of `ClaimTask`
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimOutcome {
    pub claim: Claim,
    /// True when the caller already held this lease (idempotent re-claim)
    pub reused: bool,
}

/// Result of a proposal write that may leave the stored row as it was
#[derive(Debug, Clone, PartialEq)]
pub struct ProposalOutcome {
    pub proposal: Proposal,
    /// False when the stored proposal was returned untouched
    pub changed: bool,
}

/// Operations every store backend provides.
///
/// Each mutating call is one atomic unit of work. Errors are deterministic
/// for a given state; no retries happen in here.
pub trait MarketStore: Send + Sync {
    /// Short backend name for logs
    fn backend(&self) -> &'static str;

    // Contracts
    fn create_contract(&self, contract: Contract) -> Result<Contract, MarketError>;
    fn upsert_contract(&self, contract: Contract) -> Result<Contract, MarketError>;
    fn get_contract(&self, contract_id: &str) -> Result<Contract, MarketError>;
    fn list_contracts(&self, filter: &ContractFilter) -> Result<Vec<Contract>, MarketError>;

    // Tasks and leases
    fn create_task(&self, task: Task) -> Result<Task, MarketError>;
    fn get_task(&self, task_id: &str) -> Result<Task, MarketError>;
    fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, MarketError>;
    fn claim_task(
        &self,
        task_id: &str,
        agent_id: &str,
        wallet: Option<&str>,
    ) -> Result<ClaimOutcome, MarketError>;
    fn get_claim(&self, claim_id: &str) -> Result<Claim, MarketError>;
    fn list_claims(&self, task_id: &str) -> Result<Vec<Claim>, MarketError>;

    // Submissions
    fn submit_work(
        &self,
        claim_id: &str,
        deliverables: Map<String, Value>,
        completion_proof: Value,
    ) -> Result<Submission, MarketError>;
    fn get_submission(&self, submission_id: &str) -> Result<Submission, MarketError>;
    fn list_submissions(&self, task_ids: &[String]) -> Result<Vec<Submission>, MarketError>;
    fn update_submission_status(
        &self,
        submission_id: &str,
        action: ReviewAction,
        notes: Option<&str>,
        rejection_type: Option<&str>,
    ) -> Result<Submission, MarketError>;

    // Funding proofs
    fn get_task_proof(&self, task_id: &str) -> Result<Option<MerkleProof>, MarketError>;
    fn update_task_proof(&self, task_id: &str, proof: MerkleProof) -> Result<(), MarketError>;

    // Proposals
    fn create_proposal(&self, proposal: Proposal) -> Result<Proposal, MarketError>;
    fn upsert_proposal(&self, proposal: Proposal) -> Result<ProposalOutcome, MarketError>;
    fn get_proposal(&self, id: &str) -> Result<Proposal, MarketError>;
    fn list_proposals(&self, filter: &ProposalFilter) -> Result<Vec<Proposal>, MarketError>;
    fn approve_proposal(
        &self,
        id: &str,
        approver_key_hash: Option<&str>,
    ) -> Result<ProposalOutcome, MarketError>;
    fn publish_proposal(&self, id: &str) -> Result<Proposal, MarketError>;
}

/// Open the backend selected by the config
pub fn open_store(config: &Config) -> Result<Arc<dyn MarketStore>, MarketError> {
    let lease_ttl = config.lease_ttl()?;
    match config.backend {
        StoreBackend::Memory => {
            info!("Using in-memory marketplace store");
            Ok(Arc::new(MemoryStore::new(lease_ttl)))
        }
        StoreBackend::Sqlite => {
            std::fs::create_dir_all(&config.storage_dir).map_err(|e| {
                MarketError::Config(format!(
                    "Cannot create storage dir {}: {}",
                    config.storage_dir.display(),
                    e
                ))
            })?;
            Ok(Arc::new(SqliteStore::open(&config.market_db_path(), lease_ttl)?))
        }
    }
}
