//! In-memory store variant
//!
//! All state lives in ordered maps behind one mutex. Contention windows are
//! tiny and the store is process-local, so a store-wide lock is the unit of
//! work for every operation.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use serde_json::{Map, Value};
use tracing::{debug, info};

use super::rules::{self, ApprovalDecision, ClaimDecision, ReviewAction, SubmitCheck};
use super::{ClaimOutcome, MarketStore, ProposalOutcome};
use crate::error::MarketError;
use crate::models::{
    Claim, ClaimStatus, Contract, ContractFilter, ContractStatus, MerkleProof, Proposal,
    ProposalFilter, ProposalStatus, Submission, Task, TaskFilter, TaskStatus,
};

#[derive(Debug, Default)]
struct MemoryState {
    contracts: BTreeMap<String, Contract>,
    tasks: BTreeMap<String, Task>,
    claims: BTreeMap<String, Claim>,
    submissions: BTreeMap<String, Submission>,
    proposals: BTreeMap<String, Proposal>,
}

impl MemoryState {
    fn task_mut(&mut self, task_id: &str) -> Result<&mut Task, MarketError> {
        self.tasks
            .get_mut(task_id)
            .ok_or_else(|| MarketError::TaskNotFound(task_id.to_string()))
    }

    fn claims_for(&self, task_id: &str) -> Vec<Claim> {
        self.claims
            .values()
            .filter(|c| c.task_id == task_id)
            .cloned()
            .collect()
    }

    fn tasks_for(&self, contract_id: &str) -> Vec<Task> {
        self.tasks
            .values()
            .filter(|t| t.contract_id == contract_id)
            .cloned()
            .collect()
    }

    fn with_task_counts(&self, mut contract: Contract, now: DateTime<Utc>) -> Contract {
        let tasks = self.tasks_for(&contract.contract_id);
        rules::refresh_task_counts(&mut contract, &tasks, now);
        contract
    }

    fn siblings_of(&self, contract_id: &str) -> Vec<Proposal> {
        self.proposals
            .values()
            .filter(|p| p.contract_id() == contract_id)
            .cloned()
            .collect()
    }
}

/// Mutex-guarded map store
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    lease_ttl: Duration,
}

impl MemoryStore {
    pub fn new(lease_ttl: Duration) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            lease_ttl,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, MarketError> {
        self.state
            .lock()
            .map_err(|e| MarketError::Internal(format!("Lock poisoned: {}", e)))
    }
}

impl MarketStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    // =========================================================================
    // Contracts
    // =========================================================================

    fn create_contract(&self, contract: Contract) -> Result<Contract, MarketError> {
        let mut state = self.lock()?;
        if state.contracts.contains_key(&contract.contract_id) {
            return Err(MarketError::Conflict(format!(
                "contract {} already exists",
                contract.contract_id
            )));
        }
        state
            .contracts
            .insert(contract.contract_id.clone(), contract.clone());
        Ok(contract)
    }

    fn upsert_contract(&self, contract: Contract) -> Result<Contract, MarketError> {
        let now = Utc::now();
        let mut state = self.lock()?;
        let contract = match state.contracts.get(&contract.contract_id) {
            Some(existing) => rules::merge_contract(existing, contract, now),
            None => Contract {
                updated_at: now,
                ..contract
            },
        };
        state
            .contracts
            .insert(contract.contract_id.clone(), contract.clone());
        Ok(contract)
    }

    fn get_contract(&self, contract_id: &str) -> Result<Contract, MarketError> {
        let now = Utc::now();
        let state = self.lock()?;
        state
            .contracts
            .get(contract_id)
            .cloned()
            .map(|c| state.with_task_counts(c, now))
            .ok_or_else(|| MarketError::ContractNotFound(contract_id.to_string()))
    }

    fn list_contracts(&self, filter: &ContractFilter) -> Result<Vec<Contract>, MarketError> {
        let now = Utc::now();
        let state = self.lock()?;
        let iter = state
            .contracts
            .values()
            .filter(|c| filter.matches(c))
            .cloned()
            .map(|c| state.with_task_counts(c, now));
        Ok(match filter.limit {
            Some(limit) => iter.take(limit).collect(),
            None => iter.collect(),
        })
    }

    // =========================================================================
    // Tasks and leases
    // =========================================================================

    fn create_task(&self, task: Task) -> Result<Task, MarketError> {
        let mut state = self.lock()?;
        if state.tasks.contains_key(&task.task_id) {
            return Err(MarketError::Conflict(format!("task {} already exists", task.task_id)));
        }
        state.tasks.insert(task.task_id.clone(), task.clone());
        Ok(task)
    }

    fn get_task(&self, task_id: &str) -> Result<Task, MarketError> {
        let now = Utc::now();
        self.lock()?
            .tasks
            .get(task_id)
            .cloned()
            .map(|t| t.as_seen_at(now))
            .ok_or_else(|| MarketError::TaskNotFound(task_id.to_string()))
    }

    fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, MarketError> {
        let now = Utc::now();
        let state = self.lock()?;
        let tasks = state
            .tasks
            .values()
            .cloned()
            .map(|t| t.as_seen_at(now))
            .filter(|t| filter.matches(t))
            .collect();
        Ok(filter.paginate(tasks))
    }

    fn claim_task(
        &self,
        task_id: &str,
        agent_id: &str,
        wallet: Option<&str>,
    ) -> Result<ClaimOutcome, MarketError> {
        let now = Utc::now();
        let mut state = self.lock()?;

        let task = state
            .tasks
            .get(task_id)
            .cloned()
            .ok_or_else(|| MarketError::TaskNotFound(task_id.to_string()))?;
        let claims = state.claims_for(task_id);

        match rules::decide_claim(&task, &claims, agent_id, now)? {
            ClaimDecision::Reuse(claim) => {
                debug!(task_id, agent_id, claim_id = %claim.claim_id, "Reusing live claim");
                Ok(ClaimOutcome { claim, reused: true })
            }
            ClaimDecision::Create { lapsed } => {
                for claim_id in &lapsed {
                    if let Some(old) = state.claims.get_mut(claim_id) {
                        old.status = ClaimStatus::Expired;
                    }
                }

                let claim = rules::new_claim(task_id, agent_id, wallet, self.lease_ttl, now)?;
                rules::apply_claim(state.task_mut(task_id)?, &claim);
                state.claims.insert(claim.claim_id.clone(), claim.clone());

                info!(task_id, agent_id, claim_id = %claim.claim_id, "Task claimed");
                Ok(ClaimOutcome { claim, reused: false })
            }
        }
    }

    fn get_claim(&self, claim_id: &str) -> Result<Claim, MarketError> {
        self.lock()?
            .claims
            .get(claim_id)
            .cloned()
            .ok_or_else(|| MarketError::ClaimNotFound(claim_id.to_string()))
    }

    fn list_claims(&self, task_id: &str) -> Result<Vec<Claim>, MarketError> {
        Ok(self.lock()?.claims_for(task_id))
    }

    // =========================================================================
    // Submissions
    // =========================================================================

    fn submit_work(
        &self,
        claim_id: &str,
        deliverables: Map<String, Value>,
        completion_proof: Value,
    ) -> Result<Submission, MarketError> {
        let now = Utc::now();
        let mut guard = self.lock()?;
        let state = &mut *guard;

        let claim = state
            .claims
            .get_mut(claim_id)
            .ok_or_else(|| MarketError::ClaimNotFound(claim_id.to_string()))?;

        if rules::check_submittable(claim, now)? == SubmitCheck::Expired {
            let task_id = claim.task_id.clone();
            rules::expire_claim(claim, state.tasks.get_mut(&task_id), now);
            info!(claim_id, "Claim expired before submission");
            return Err(MarketError::ClaimExpired(claim_id.to_string()));
        }

        claim.status = ClaimStatus::Submitted;
        let submission = rules::new_submission(claim, deliverables, completion_proof, now);

        let task = state
            .tasks
            .get_mut(&submission.task_id)
            .ok_or_else(|| MarketError::TaskNotFound(submission.task_id.clone()))?;
        task.status = TaskStatus::Submitted;
        task.updated_at = now;

        state
            .submissions
            .insert(submission.submission_id.clone(), submission.clone());

        info!(claim_id, submission_id = %submission.submission_id, "Work submitted");
        Ok(submission)
    }

    fn get_submission(&self, submission_id: &str) -> Result<Submission, MarketError> {
        self.lock()?
            .submissions
            .get(submission_id)
            .cloned()
            .ok_or_else(|| MarketError::SubmissionNotFound(submission_id.to_string()))
    }

    fn list_submissions(&self, task_ids: &[String]) -> Result<Vec<Submission>, MarketError> {
        let state = self.lock()?;
        let mut subs: Vec<Submission> = state
            .submissions
            .values()
            .filter(|s| task_ids.contains(&s.task_id))
            .cloned()
            .collect();
        subs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(subs)
    }

    fn update_submission_status(
        &self,
        submission_id: &str,
        action: ReviewAction,
        notes: Option<&str>,
        rejection_type: Option<&str>,
    ) -> Result<Submission, MarketError> {
        let now = Utc::now();
        let mut guard = self.lock()?;
        let state = &mut *guard;

        let submission = state
            .submissions
            .get_mut(submission_id)
            .ok_or_else(|| MarketError::SubmissionNotFound(submission_id.to_string()))?;

        let effect = rules::apply_review(submission, action, notes, rejection_type, now);
        if let Some(task) = state.tasks.get_mut(&submission.task_id) {
            rules::apply_task_effect(task, effect, now);
        }

        debug!(submission_id, status = %submission.status, "Submission status updated");
        Ok(submission.clone())
    }

    // =========================================================================
    // Funding proofs
    // =========================================================================

    fn get_task_proof(&self, task_id: &str) -> Result<Option<MerkleProof>, MarketError> {
        self.lock()?
            .tasks
            .get(task_id)
            .map(|t| t.merkle_proof.clone())
            .ok_or_else(|| MarketError::TaskNotFound(task_id.to_string()))
    }

    fn update_task_proof(&self, task_id: &str, proof: MerkleProof) -> Result<(), MarketError> {
        let mut state = self.lock()?;
        let task = state.task_mut(task_id)?;
        task.merkle_proof = Some(proof);
        if task.status == TaskStatus::Unverified {
            task.status = TaskStatus::Available;
        }
        task.updated_at = Utc::now();
        Ok(())
    }

    // =========================================================================
    // Proposals
    // =========================================================================

    fn create_proposal(&self, proposal: Proposal) -> Result<Proposal, MarketError> {
        let proposal = rules::prepare_proposal(proposal, Utc::now())?;
        let mut state = self.lock()?;
        if state.proposals.contains_key(&proposal.id) {
            return Err(MarketError::Conflict(format!("proposal {} already exists", proposal.id)));
        }
        state.proposals.insert(proposal.id.clone(), proposal.clone());
        Ok(proposal)
    }

    fn upsert_proposal(&self, proposal: Proposal) -> Result<ProposalOutcome, MarketError> {
        let proposal = rules::prepare_proposal(proposal, Utc::now())?;
        let mut state = self.lock()?;
        let proposal = match state.proposals.get(&proposal.id) {
            Some(existing) => match rules::merge_proposal(existing, proposal) {
                Some(merged) => merged,
                None => {
                    return Ok(ProposalOutcome {
                        proposal: existing.clone(),
                        changed: false,
                    })
                }
            },
            None => proposal,
        };
        state.proposals.insert(proposal.id.clone(), proposal.clone());
        Ok(ProposalOutcome {
            proposal,
            changed: true,
        })
    }

    fn get_proposal(&self, id: &str) -> Result<Proposal, MarketError> {
        self.lock()?
            .proposals
            .get(id)
            .cloned()
            .ok_or_else(|| MarketError::ProposalNotFound(id.to_string()))
    }

    fn list_proposals(&self, filter: &ProposalFilter) -> Result<Vec<Proposal>, MarketError> {
        let state = self.lock()?;
        let iter = state.proposals.values().filter(|p| filter.matches(p)).cloned();
        Ok(match filter.limit {
            Some(limit) => iter.take(limit).collect(),
            None => iter.collect(),
        })
    }

    fn approve_proposal(
        &self,
        id: &str,
        approver_key_hash: Option<&str>,
    ) -> Result<ProposalOutcome, MarketError> {
        let now = Utc::now();
        let mut state = self.lock()?;

        let proposal = state
            .proposals
            .get(id)
            .cloned()
            .ok_or_else(|| MarketError::ProposalNotFound(id.to_string()))?;
        let contract_id = proposal.contract_id().to_string();
        let wish = state.contracts.get(&contract_id).cloned();

        rules::authorize_approval(&proposal, wish.as_ref(), approver_key_hash)?;
        let siblings = state.siblings_of(&contract_id);
        if rules::decide_approval(&proposal, &siblings)? == ApprovalDecision::AlreadyApproved {
            return Ok(ProposalOutcome {
                proposal,
                changed: false,
            });
        }

        let existing_ids: HashSet<String> = state.tasks.keys().cloned().collect();
        for task in rules::materialize_tasks(&proposal, &existing_ids, now) {
            state.tasks.insert(task.task_id.clone(), task);
        }
        let contract_tasks = state.tasks_for(&contract_id);
        let contract = rules::activate_contract(wish, &proposal, &contract_tasks, now);
        state.contracts.insert(contract_id.clone(), contract);

        let approved = state
            .proposals
            .get_mut(id)
            .ok_or_else(|| MarketError::ProposalNotFound(id.to_string()))?;
        approved.status = ProposalStatus::Approved;
        approved.updated_at = now;

        info!(proposal_id = id, contract_id = %contract_id, "Proposal approved");
        Ok(ProposalOutcome {
            proposal: approved.clone(),
            changed: true,
        })
    }

    fn publish_proposal(&self, id: &str) -> Result<Proposal, MarketError> {
        let now = Utc::now();
        let mut state = self.lock()?;

        let proposal = state
            .proposals
            .get(id)
            .cloned()
            .ok_or_else(|| MarketError::ProposalNotFound(id.to_string()))?;
        let contract_id = proposal.contract_id().to_string();
        let tasks = state.tasks_for(&contract_id);
        let task_ids: Vec<&String> = tasks.iter().map(|t| &t.task_id).collect();
        let submissions: Vec<Submission> = state
            .submissions
            .values()
            .filter(|s| task_ids.contains(&&s.task_id))
            .cloned()
            .collect();

        rules::check_publish_ready(&proposal, &tasks, &submissions)?;

        for task in tasks {
            if let Some(t) = state.tasks.get_mut(&task.task_id) {
                t.status = TaskStatus::Published;
                t.updated_at = now;
            }
        }
        if let Some(contract) = state.contracts.get_mut(&contract_id) {
            contract.status = ContractStatus::Completed;
            contract.available_tasks_count = 0;
            contract.updated_at = now;
        }

        let published = state
            .proposals
            .get_mut(id)
            .ok_or_else(|| MarketError::ProposalNotFound(id.to_string()))?;
        published.status = ProposalStatus::Published;
        published.updated_at = now;

        info!(proposal_id = id, contract_id = %contract_id, "Proposal published");
        Ok(published.clone())
    }
}
