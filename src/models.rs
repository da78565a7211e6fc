//! Entity model for the marketplace
//!
//! Plain records with explicit status fields. Persistence layout is owned by
//! the store backends; these types are what every backend hands back.
//!
//! - Contract: funded body of work (a "wish" is a contract with id `wish-<hash>`)
//! - Task: leasable, payable unit of work under a contract
//! - Claim: time-bounded lease of a task by one agent
//! - Submission: deliverables for a claim, subject to review
//! - Proposal: human-reviewable plan competing to become a contract's approved plan
//! - MerkleProof: funding evidence embedded in a task

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::MarketError;

// ============================================================================
// Status Enums
// ============================================================================

macro_rules! status_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = MarketError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(MarketError::InvalidInput(format!(
                        "Invalid {}: {}",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

status_enum!(
    /// Contract lifecycle: pending wish, active after approval, completed after publish
    ContractStatus {
        Pending => "pending",
        Active => "active",
        Completed => "completed",
    }
);

status_enum!(
    TaskStatus {
        Available => "available",
        Claimed => "claimed",
        Submitted => "submitted",
        Published => "published",
        Unverified => "unverified",
    }
);

status_enum!(
    ClaimStatus {
        Active => "active",
        Expired => "expired",
        Submitted => "submitted",
    }
);

status_enum!(
    SubmissionStatus {
        PendingReview => "pending_review",
        Reviewed => "reviewed",
        Approved => "approved",
        Rejected => "rejected",
    }
);

status_enum!(
    ProposalStatus {
        Pending => "pending",
        Approved => "approved",
        Rejected => "rejected",
        Published => "published",
    }
);

status_enum!(
    ProofStatus {
        Provisional => "provisional",
        Confirmed => "confirmed",
    }
);

status_enum!(
    /// Processing state of an externally sourced ingestion record
    IngestionStatus {
        Pending => "pending",
        Verified => "verified",
        Invalid => "invalid",
    }
);

// ============================================================================
// Entities
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contract {
    pub contract_id: String,
    pub title: String,
    pub total_budget_sats: u64,
    pub goals_count: u32,
    pub available_tasks_count: u32,
    pub status: ContractStatus,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub creator_api_key_hash: Option<String>,
    #[serde(default)]
    pub funding_address: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Contract {
    /// New pending contract with no tasks yet
    pub fn new(contract_id: impl Into<String>, title: impl Into<String>, total_budget_sats: u64) -> Self {
        let now = Utc::now();
        Self {
            contract_id: contract_id.into(),
            title: title.into(),
            total_budget_sats,
            goals_count: 0,
            available_tasks_count: 0,
            status: ContractStatus::Pending,
            skills: Vec::new(),
            creator_api_key_hash: None,
            funding_address: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_wish(&self) -> bool {
        self.contract_id.starts_with("wish-")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub contract_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub budget_sats: u64,
    #[serde(default)]
    pub skills: Vec<String>,
    pub status: TaskStatus,
    #[serde(default)]
    pub claimed_by: Option<String>,
    #[serde(default)]
    pub claimed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub claim_expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub contractor_wallet: Option<String>,
    #[serde(default)]
    pub merkle_proof: Option<MerkleProof>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(
        task_id: impl Into<String>,
        contract_id: impl Into<String>,
        title: impl Into<String>,
        budget_sats: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            task_id: task_id.into(),
            contract_id: contract_id.into(),
            title: title.into(),
            description: String::new(),
            budget_sats,
            skills: Vec::new(),
            status: TaskStatus::Available,
            claimed_by: None,
            claimed_at: None,
            claim_expires_at: None,
            contractor_wallet: None,
            merkle_proof: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// True when the task is held under a lease that has already lapsed
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Claimed
            && self.claim_expires_at.map(|at| at <= now).unwrap_or(false)
    }

    /// Status as seen by readers: a lapsed lease reads as available
    pub fn effective_status(&self, now: DateTime<Utc>) -> TaskStatus {
        if self.lease_expired(now) {
            TaskStatus::Available
        } else {
            self.status
        }
    }

    /// Copy of the task with lazy expiry applied to the status field
    pub fn as_seen_at(mut self, now: DateTime<Utc>) -> Self {
        self.status = self.effective_status(now);
        self
    }

    pub fn has_provisional_proof(&self) -> bool {
        matches!(&self.merkle_proof, Some(p) if p.confirmation_status == ProofStatus::Provisional)
    }

    /// Release the lease fields and return the task to the open pool
    pub(crate) fn reopen(&mut self, now: DateTime<Utc>) {
        self.status = if self.merkle_proof.is_some() {
            TaskStatus::Available
        } else {
            TaskStatus::Unverified
        };
        self.claimed_by = None;
        self.claimed_at = None;
        self.claim_expires_at = None;
        self.updated_at = now;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    pub claim_id: String,
    pub task_id: String,
    pub ai_identifier: String,
    #[serde(default)]
    pub wallet: Option<String>,
    pub status: ClaimStatus,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Claim {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Active and not yet past its lease
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.status == ClaimStatus::Active && !self.is_expired(now)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    pub submission_id: String,
    pub claim_id: String,
    pub task_id: String,
    pub status: SubmissionStatus,
    #[serde(default)]
    pub deliverables: Map<String, Value>,
    #[serde(default)]
    pub completion_proof: Value,
    #[serde(default)]
    pub review_notes: Option<String>,
    #[serde(default)]
    pub rejection_type: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Typed view of the metadata carried by a proposal.
///
/// Keys that ingestion flattens in (`address`, `price`, ...) land in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProposalMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator_api_key_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub funding_address: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description_md: String,
    #[serde(default)]
    pub visible_pixel_hash: Option<String>,
    pub budget_sats: u64,
    pub status: ProposalStatus,
    /// Task drafts; only materialised as real tasks on approval
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub metadata: ProposalMetadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Proposal {
    pub fn new(id: impl Into<String>, title: impl Into<String>, budget_sats: u64) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            title: title.into(),
            description_md: String::new(),
            visible_pixel_hash: None,
            budget_sats,
            status: ProposalStatus::Pending,
            tasks: Vec::new(),
            metadata: ProposalMetadata::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Contract this proposal competes for (falls back to the proposal id)
    pub fn contract_id(&self) -> &str {
        self.metadata.contract_id.as_deref().unwrap_or(&self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MerkleProof {
    #[serde(default)]
    pub tx_id: String,
    #[serde(default)]
    pub block_height: u64,
    #[serde(default)]
    pub merkle_root: String,
    #[serde(default)]
    pub proof_path: Vec<String>,
    pub funded_amount_sats: u64,
    #[serde(default)]
    pub funding_address: Option<String>,
    pub confirmation_status: ProofStatus,
    pub seen_at: DateTime<Utc>,
    #[serde(default)]
    pub confirmed_at: Option<DateTime<Utc>>,
}

impl MerkleProof {
    /// Placeholder proof recorded before any on-chain evidence exists
    pub fn provisional(funding_address: Option<String>, funded_amount_sats: u64) -> Self {
        Self {
            tx_id: String::new(),
            block_height: 0,
            merkle_root: String::new(),
            proof_path: Vec::new(),
            funded_amount_sats,
            funding_address,
            confirmation_status: ProofStatus::Provisional,
            seen_at: Utc::now(),
            confirmed_at: None,
        }
    }

    pub fn is_confirmed(&self) -> bool {
        self.confirmation_status == ProofStatus::Confirmed
    }
}

// ============================================================================
// Query Filters
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContractFilter {
    #[serde(default)]
    pub status: Option<ContractStatus>,
    #[serde(default)]
    pub skill: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskFilter {
    #[serde(default)]
    pub contract_id: Option<String>,
    /// Matched against the effective (lazily expired) status
    #[serde(default)]
    pub status: Option<TaskStatus>,
    #[serde(default)]
    pub skill: Option<String>,
    #[serde(default)]
    pub proof_status: Option<ProofStatus>,
    #[serde(default)]
    pub min_budget_sats: Option<u64>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
}

impl TaskFilter {
    pub fn for_contract(contract_id: impl Into<String>) -> Self {
        Self {
            contract_id: Some(contract_id.into()),
            ..Default::default()
        }
    }

    pub fn provisional_proofs() -> Self {
        Self {
            proof_status: Some(ProofStatus::Provisional),
            ..Default::default()
        }
    }

    /// Whether a task (already normalised for lazy expiry) passes the filter
    pub fn matches(&self, task: &Task) -> bool {
        if let Some(contract_id) = &self.contract_id {
            if &task.contract_id != contract_id {
                return false;
            }
        }
        if let Some(status) = self.status {
            if task.status != status {
                return false;
            }
        }
        if let Some(skill) = &self.skill {
            if !task.skills.iter().any(|s| s.eq_ignore_ascii_case(skill)) {
                return false;
            }
        }
        if let Some(proof_status) = self.proof_status {
            match &task.merkle_proof {
                Some(proof) if proof.confirmation_status == proof_status => {}
                _ => return false,
            }
        }
        if let Some(min) = self.min_budget_sats {
            if task.budget_sats < min {
                return false;
            }
        }
        true
    }

    /// Apply offset/limit to an already filtered, ordered list
    pub fn paginate(&self, tasks: Vec<Task>) -> Vec<Task> {
        let offset = self.offset.unwrap_or(0);
        let iter = tasks.into_iter().skip(offset);
        match self.limit {
            Some(limit) => iter.take(limit).collect(),
            None => iter.collect(),
        }
    }
}

impl ContractFilter {
    pub fn matches(&self, contract: &Contract) -> bool {
        if let Some(status) = self.status {
            if contract.status != status {
                return false;
            }
        }
        if let Some(skill) = &self.skill {
            if !contract.skills.iter().any(|s| s.eq_ignore_ascii_case(skill)) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProposalFilter {
    #[serde(default)]
    pub status: Option<ProposalStatus>,
    #[serde(default)]
    pub contract_id: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl ProposalFilter {
    pub fn matches(&self, proposal: &Proposal) -> bool {
        if let Some(status) = self.status {
            if proposal.status != status {
                return false;
            }
        }
        if let Some(contract_id) = &self.contract_id {
            if proposal.contract_id() != contract_id {
                return false;
            }
        }
        true
    }
}
