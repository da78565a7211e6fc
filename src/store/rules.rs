//! Lifecycle rules shared by every store backend
//!
//! Backends own locking and persistence; these functions own the decisions.
//! Each one works on rows the backend has already read inside its atomic
//! unit of work, so both variants enforce the same invariants.

use std::collections::HashSet;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde_json::{Map, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::derivation::derive_tasks_from_markdown;
use crate::error::MarketError;
use crate::models::{
    Claim, ClaimStatus, Contract, ContractStatus, Proposal, ProposalStatus, Submission,
    SubmissionStatus, Task, TaskStatus,
};

// ============================================================================
// Claims
// ============================================================================

/// What `ClaimTask` should do after inspecting the task's claims
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimDecision {
    /// Caller already holds a live lease; hand it back unchanged
    Reuse(Claim),
    /// Create a new lease, first expiring these lapsed `active` claims
    Create { lapsed: Vec<String> },
}

pub fn decide_claim(
    task: &Task,
    claims: &[Claim],
    agent_id: &str,
    now: DateTime<Utc>,
) -> Result<ClaimDecision, MarketError> {
    if let Some(live) = claims.iter().find(|c| c.is_live(now)) {
        if live.ai_identifier == agent_id {
            return Ok(ClaimDecision::Reuse(live.clone()));
        }
        return Err(MarketError::TaskTaken {
            task_id: task.task_id.clone(),
        });
    }

    if matches!(task.status, TaskStatus::Submitted | TaskStatus::Published) {
        return Err(MarketError::TaskUnavailable {
            task_id: task.task_id.clone(),
            status: task.status.to_string(),
        });
    }

    let lapsed = claims
        .iter()
        .filter(|c| c.status == ClaimStatus::Active)
        .map(|c| c.claim_id.clone())
        .collect();

    Ok(ClaimDecision::Create { lapsed })
}

pub fn new_claim(
    task_id: &str,
    agent_id: &str,
    wallet: Option<&str>,
    lease_ttl: Duration,
    now: DateTime<Utc>,
) -> Result<Claim, MarketError> {
    let expires_at = now.checked_add_signed(lease_ttl).ok_or_else(|| {
        MarketError::InvalidInput(format!(
            "lease of {} seconds does not fit a timestamp",
            lease_ttl.num_seconds()
        ))
    })?;
    Ok(Claim {
        claim_id: format!("claim-{}", Uuid::new_v4()),
        task_id: task_id.to_string(),
        ai_identifier: agent_id.to_string(),
        wallet: wallet.map(str::to_string),
        status: ClaimStatus::Active,
        expires_at,
        created_at: now,
    })
}

/// Mirror a fresh lease onto its task
pub fn apply_claim(task: &mut Task, claim: &Claim) {
    task.status = TaskStatus::Claimed;
    task.claimed_by = Some(claim.ai_identifier.clone());
    task.claimed_at = Some(claim.created_at);
    task.claim_expires_at = Some(claim.expires_at);
    if claim.wallet.is_some() {
        task.contractor_wallet = claim.wallet.clone();
    }
    task.updated_at = claim.created_at;
}

// ============================================================================
// Submissions
// ============================================================================

/// Outcome of validating a claim for `SubmitWork`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitCheck {
    Accept,
    /// Lease lapsed; the backend must persist the expiry and then fail
    Expired,
}

pub fn check_submittable(claim: &Claim, now: DateTime<Utc>) -> Result<SubmitCheck, MarketError> {
    if claim.status != ClaimStatus::Active {
        return Err(MarketError::ClaimNotActive {
            claim_id: claim.claim_id.clone(),
            status: claim.status.to_string(),
        });
    }
    if claim.is_expired(now) {
        return Ok(SubmitCheck::Expired);
    }
    Ok(SubmitCheck::Accept)
}

/// Apply lazy expiry on the write path: expire the claim and, if the task
/// still mirrors this lease, reopen it
pub fn expire_claim(claim: &mut Claim, task: Option<&mut Task>, now: DateTime<Utc>) {
    claim.status = ClaimStatus::Expired;
    if let Some(task) = task {
        if task.status == TaskStatus::Claimed
            && task.claimed_by.as_deref() == Some(claim.ai_identifier.as_str())
        {
            task.reopen(now);
        }
    }
}

pub fn new_submission(
    claim: &Claim,
    deliverables: Map<String, Value>,
    completion_proof: Value,
    now: DateTime<Utc>,
) -> Submission {
    Submission {
        submission_id: format!("sub-{}", Uuid::new_v4()),
        claim_id: claim.claim_id.clone(),
        task_id: claim.task_id.clone(),
        status: SubmissionStatus::PendingReview,
        deliverables,
        completion_proof,
        review_notes: None,
        rejection_type: None,
        created_at: now,
        updated_at: now,
    }
}

/// Reviewer action on a submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewAction {
    Review,
    Approve,
    Reject,
    Rework,
}

impl ReviewAction {
    pub fn target_status(&self) -> SubmissionStatus {
        match self {
            ReviewAction::Review => SubmissionStatus::Reviewed,
            ReviewAction::Approve => SubmissionStatus::Approved,
            ReviewAction::Reject => SubmissionStatus::Rejected,
            ReviewAction::Rework => SubmissionStatus::PendingReview,
        }
    }
}

impl FromStr for ReviewAction {
    type Err = MarketError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "review" | "reviewed" => Ok(ReviewAction::Review),
            "approve" | "approved" => Ok(ReviewAction::Approve),
            "reject" | "rejected" => Ok(ReviewAction::Reject),
            "rework_submission" | "rework" | "pending_review" => Ok(ReviewAction::Rework),
            other => Err(MarketError::InvalidInput(format!(
                "Invalid submission action: {}",
                other
            ))),
        }
    }
}

/// Side effect a review has on the submission's task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskEffect {
    None,
    /// Final rejection: task goes back to the open pool
    Reopen,
    /// Rework: task is awaiting review again
    Resubmit,
}

pub const FINAL_REJECTION: &str = "final";

pub fn apply_review(
    submission: &mut Submission,
    action: ReviewAction,
    notes: Option<&str>,
    rejection_type: Option<&str>,
    now: DateTime<Utc>,
) -> TaskEffect {
    submission.status = action.target_status();
    submission.updated_at = now;

    match action {
        ReviewAction::Rework => {
            // Additive: prior deliverable fields are kept
            submission.deliverables.insert(
                "rework_notes".to_string(),
                Value::String(notes.unwrap_or_default().to_string()),
            );
            submission
                .deliverables
                .insert("reworked_at".to_string(), Value::String(now.to_rfc3339()));
            TaskEffect::Resubmit
        }
        ReviewAction::Reject => {
            if let Some(n) = notes {
                submission.review_notes = Some(n.to_string());
            }
            submission.rejection_type = rejection_type.map(str::to_string);
            if rejection_type == Some(FINAL_REJECTION) {
                TaskEffect::Reopen
            } else {
                TaskEffect::None
            }
        }
        ReviewAction::Review | ReviewAction::Approve => {
            if let Some(n) = notes {
                submission.review_notes = Some(n.to_string());
            }
            TaskEffect::None
        }
    }
}

pub fn apply_task_effect(task: &mut Task, effect: TaskEffect, now: DateTime<Utc>) {
    match effect {
        TaskEffect::None => {}
        TaskEffect::Reopen => {
            if task.status != TaskStatus::Published {
                task.reopen(now);
            }
        }
        TaskEffect::Resubmit => {
            if matches!(task.status, TaskStatus::Available | TaskStatus::Unverified) {
                task.status = TaskStatus::Submitted;
                task.updated_at = now;
            }
        }
    }
}

// ============================================================================
// Proposals
// ============================================================================

/// A re-ingested row may only rewrite a stored one sent by the same creator,
/// or one that never had a creator
pub fn same_owner(stored: Option<&str>, incoming: Option<&str>) -> bool {
    stored.is_none() || stored == incoming
}

/// Contract row after re-ingesting a contract that already exists.
///
/// Ownership, status and the fields derived from approved tasks stay with the
/// stored row. A different creator cannot rewrite it at all.
pub fn merge_contract(existing: &Contract, mut incoming: Contract, now: DateTime<Utc>) -> Contract {
    if !same_owner(
        existing.creator_api_key_hash.as_deref(),
        incoming.creator_api_key_hash.as_deref(),
    ) {
        debug!(contract_id = %existing.contract_id, "Ignoring contract rewrite from another creator");
        return existing.clone();
    }

    incoming.created_at = existing.created_at;
    incoming.status = existing.status;
    incoming.goals_count = existing.goals_count;
    incoming.available_tasks_count = existing.available_tasks_count;
    if existing.funding_address.is_some() {
        incoming.funding_address = existing.funding_address.clone();
    }
    if existing.status != ContractStatus::Pending || incoming.total_budget_sats == 0 {
        incoming.total_budget_sats = existing.total_budget_sats;
    }
    let mut skills = existing.skills.clone();
    for skill in incoming.skills.drain(..) {
        if !skills.contains(&skill) {
            skills.push(skill);
        }
    }
    incoming.skills = skills;
    incoming.updated_at = now;
    incoming
}

/// What `UpsertProposal` should store over an existing row; `None` keeps the
/// stored proposal untouched
pub fn merge_proposal(existing: &Proposal, mut incoming: Proposal) -> Option<Proposal> {
    if existing.status != ProposalStatus::Pending {
        debug!(proposal_id = %existing.id, status = %existing.status, "Keeping non-pending proposal");
        return None;
    }
    if !same_owner(
        existing.metadata.creator_api_key_hash.as_deref(),
        incoming.metadata.creator_api_key_hash.as_deref(),
    ) {
        debug!(proposal_id = %existing.id, "Ignoring proposal rewrite from another creator");
        return None;
    }

    incoming.created_at = existing.created_at;
    incoming.status = ProposalStatus::Pending;
    Some(incoming)
}

/// Normalise a proposal before its first insert
pub fn prepare_proposal(mut proposal: Proposal, now: DateTime<Utc>) -> Result<Proposal, MarketError> {
    if proposal.id.trim().is_empty() {
        return Err(MarketError::InvalidInput("Proposal id is required".to_string()));
    }
    if proposal.metadata.contract_id.is_none() {
        proposal.metadata.contract_id = Some(proposal.id.clone());
    }
    if proposal.tasks.is_empty() {
        proposal.tasks = derive_tasks_from_markdown(&proposal);
    } else {
        let contract_id = proposal.contract_id().to_string();
        for task in &mut proposal.tasks {
            task.contract_id = contract_id.clone();
        }
    }
    proposal.created_at = now;
    proposal.updated_at = now;
    Ok(proposal)
}

/// Approval is allowed when the approver matches the proposal's creator or
/// the originating wish's creator. Legacy rows with no creator metadata at
/// all are let through with a warning.
pub fn authorize_approval(
    proposal: &Proposal,
    wish: Option<&Contract>,
    approver_key_hash: Option<&str>,
) -> Result<(), MarketError> {
    let proposal_creator = proposal.metadata.creator_api_key_hash.as_deref();
    let wish_creator = wish.and_then(|c| c.creator_api_key_hash.as_deref());

    if proposal_creator.is_none() && wish_creator.is_none() {
        warn!(
            proposal_id = %proposal.id,
            "Approving proposal without creator metadata on proposal or wish"
        );
        return Ok(());
    }

    let matches = approver_key_hash
        .map(|key| Some(key) == proposal_creator || Some(key) == wish_creator)
        .unwrap_or(false);

    if matches {
        Ok(())
    } else {
        Err(MarketError::Unauthorized(format!(
            "approver is not the creator of proposal {} or its wish",
            proposal.id
        )))
    }
}

/// What `ApproveProposal` should do with the target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approve,
    AlreadyApproved,
}

/// Status check plus the single-winner check across sibling proposals.
/// `siblings` must be read in the same unit of work as the write.
pub fn decide_approval(
    target: &Proposal,
    siblings: &[Proposal],
) -> Result<ApprovalDecision, MarketError> {
    match target.status {
        ProposalStatus::Approved => return Ok(ApprovalDecision::AlreadyApproved),
        ProposalStatus::Pending => {}
        other => {
            return Err(MarketError::Conflict(format!(
                "proposal {} is {} and cannot be approved",
                target.id, other
            )))
        }
    }

    // a published winner still owns the contract
    if let Some(winner) = siblings.iter().find(|p| {
        p.id != target.id
            && matches!(p.status, ProposalStatus::Approved | ProposalStatus::Published)
    }) {
        return Err(MarketError::Conflict(format!(
            "contract {} already has {} proposal {}",
            target.contract_id(),
            winner.status,
            winner.id
        )));
    }

    Ok(ApprovalDecision::Approve)
}

/// Turn the approved proposal's drafts into real tasks, skipping ids that
/// already exist under the store
pub fn materialize_tasks(
    proposal: &Proposal,
    existing_ids: &HashSet<String>,
    now: DateTime<Utc>,
) -> Vec<Task> {
    let contract_id = proposal.contract_id().to_string();
    proposal
        .tasks
        .iter()
        .filter(|draft| !existing_ids.contains(&draft.task_id))
        .map(|draft| {
            let mut task = draft.clone();
            task.contract_id = contract_id.clone();
            task.status = if task.merkle_proof.is_some() {
                TaskStatus::Available
            } else {
                TaskStatus::Unverified
            };
            task.claimed_by = None;
            task.claimed_at = None;
            task.claim_expires_at = None;
            task.created_at = now;
            task.updated_at = now;
            task
        })
        .collect()
}

/// Contract row after a proposal for it is approved
pub fn activate_contract(
    existing: Option<Contract>,
    proposal: &Proposal,
    tasks: &[Task],
    now: DateTime<Utc>,
) -> Contract {
    let mut contract = existing.unwrap_or_else(|| {
        let mut c = Contract::new(proposal.contract_id(), proposal.title.clone(), proposal.budget_sats);
        c.creator_api_key_hash = proposal.metadata.creator_api_key_hash.clone();
        c.funding_address = proposal.metadata.funding_address.clone();
        c.created_at = now;
        c
    });

    contract.status = ContractStatus::Active;
    contract.goals_count = tasks.len() as u32;
    refresh_task_counts(&mut contract, tasks, now);
    if contract.total_budget_sats == 0 {
        contract.total_budget_sats = tasks.iter().map(|t| t.budget_sats).sum();
    }
    for skill in tasks.iter().flat_map(|t| t.skills.iter()) {
        if !contract.skills.contains(skill) {
            contract.skills.push(skill.clone());
        }
    }
    contract.updated_at = now;
    contract
}

/// Open for claiming as readers see it, so a lapsed lease counts
pub fn is_open(task: &Task, now: DateTime<Utc>) -> bool {
    matches!(
        task.effective_status(now),
        TaskStatus::Available | TaskStatus::Unverified
    )
}

/// Recompute `available_tasks_count` from the contract's own tasks
pub fn refresh_task_counts(contract: &mut Contract, tasks: &[Task], now: DateTime<Utc>) {
    contract.available_tasks_count = tasks
        .iter()
        .filter(|t| t.contract_id == contract.contract_id && is_open(t, now))
        .count() as u32;
}

/// Every task under the contract must carry at least one approved submission
pub fn check_publish_ready(
    proposal: &Proposal,
    tasks: &[Task],
    submissions: &[Submission],
) -> Result<(), MarketError> {
    if proposal.status != ProposalStatus::Approved {
        return Err(MarketError::Conflict(format!(
            "proposal {} is {}; only approved proposals can be published",
            proposal.id, proposal.status
        )));
    }
    if tasks.is_empty() {
        return Err(MarketError::Conflict(format!(
            "contract {} has no tasks to publish",
            proposal.contract_id()
        )));
    }

    let mut ordered: Vec<&Task> = tasks.iter().collect();
    ordered.sort_by(|a, b| a.task_id.cmp(&b.task_id));

    for task in ordered {
        let approved = submissions
            .iter()
            .any(|s| s.task_id == task.task_id && s.status == SubmissionStatus::Approved);
        if !approved {
            return Err(MarketError::PublishBlocked {
                proposal_id: proposal.id.clone(),
                task_id: task.task_id.clone(),
            });
        }
    }
    Ok(())
}
