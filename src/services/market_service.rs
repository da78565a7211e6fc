//! Market service - the public operations of the marketplace core
//!
//! Wraps a [`MarketStore`] with input validation and event emission. This is
//! what the protocol layer and both reconcilers call.

use std::sync::Arc;

use serde_json::{Map, Value};

use crate::error::MarketError;
use crate::models::{
    Claim, Contract, ContractFilter, MerkleProof, Proposal, ProposalFilter, Submission, Task,
    TaskFilter,
};
use crate::store::{MarketStore, ReviewAction};

use super::events::{EventLog, EventType};

/// Actor recorded for transitions made by the core itself
pub const SYSTEM_ACTOR: &str = "system";

pub struct MarketService {
    store: Arc<dyn MarketStore>,
    events: Arc<EventLog>,
}

impl MarketService {
    pub fn new(store: Arc<dyn MarketStore>, events: Arc<EventLog>) -> Self {
        Self { store, events }
    }

    pub fn store(&self) -> &Arc<dyn MarketStore> {
        &self.store
    }

    pub fn events(&self) -> &Arc<EventLog> {
        &self.events
    }

    // =========================================================================
    // Read Operations
    // =========================================================================

    pub fn list_contracts(&self, filter: &ContractFilter) -> Result<Vec<Contract>, MarketError> {
        self.store.list_contracts(filter)
    }

    pub fn get_contract(&self, contract_id: &str) -> Result<Contract, MarketError> {
        self.store.get_contract(contract_id)
    }

    pub fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, MarketError> {
        self.store.list_tasks(filter)
    }

    pub fn get_task(&self, task_id: &str) -> Result<Task, MarketError> {
        self.store.get_task(task_id)
    }

    pub fn get_task_proof(&self, task_id: &str) -> Result<Option<MerkleProof>, MarketError> {
        self.store.get_task_proof(task_id)
    }

    pub fn list_proposals(&self, filter: &ProposalFilter) -> Result<Vec<Proposal>, MarketError> {
        self.store.list_proposals(filter)
    }

    pub fn get_proposal(&self, id: &str) -> Result<Proposal, MarketError> {
        self.store.get_proposal(id)
    }

    pub fn list_submissions(&self, task_ids: &[String]) -> Result<Vec<Submission>, MarketError> {
        self.store.list_submissions(task_ids)
    }

    // =========================================================================
    // Write Operations
    // =========================================================================

    pub fn create_contract(&self, contract: Contract) -> Result<Contract, MarketError> {
        require("contract_id", &contract.contract_id)?;
        let created = self.store.create_contract(contract)?;
        self.events.emit(
            EventType::ContractCreated,
            &created.contract_id,
            SYSTEM_ACTOR,
            format!("Contract created: {}", created.title),
        );
        Ok(created)
    }

    pub fn upsert_contract(&self, contract: Contract) -> Result<Contract, MarketError> {
        require("contract_id", &contract.contract_id)?;
        let saved = self.store.upsert_contract(contract)?;
        self.events.emit(
            EventType::ContractUpdated,
            &saved.contract_id,
            SYSTEM_ACTOR,
            format!("Contract upserted: {}", saved.title),
        );
        Ok(saved)
    }

    pub fn create_task(&self, task: Task) -> Result<Task, MarketError> {
        require("task_id", &task.task_id)?;
        require("contract_id", &task.contract_id)?;
        let created = self.store.create_task(task)?;
        self.events.emit(
            EventType::TaskCreated,
            &created.task_id,
            SYSTEM_ACTOR,
            format!("Task created under {}", created.contract_id),
        );
        Ok(created)
    }

    /// Lease a task. Re-claiming with the same agent id returns the same claim
    pub fn claim_task(
        &self,
        task_id: &str,
        agent_id: &str,
        wallet: Option<&str>,
    ) -> Result<Claim, MarketError> {
        require("agent_id", agent_id)?;
        let outcome = self.store.claim_task(task_id, agent_id, wallet)?;
        if !outcome.reused {
            self.events.emit(
                EventType::TaskClaimed,
                task_id,
                agent_id,
                format!("Claim {} expires at {}", outcome.claim.claim_id, outcome.claim.expires_at),
            );
        }
        Ok(outcome.claim)
    }

    pub fn submit_work(
        &self,
        claim_id: &str,
        deliverables: Map<String, Value>,
        completion_proof: Value,
    ) -> Result<Submission, MarketError> {
        let submission = self.store.submit_work(claim_id, deliverables, completion_proof)?;
        let actor = self
            .store
            .get_claim(claim_id)
            .map(|c| c.ai_identifier)
            .unwrap_or_else(|_| SYSTEM_ACTOR.to_string());
        self.events.emit(
            EventType::WorkSubmitted,
            &submission.task_id,
            actor,
            format!("Submission {} awaiting review", submission.submission_id),
        );
        Ok(submission)
    }

    /// Apply a reviewer action (`review`, `approve`, `reject`, `rework_submission`)
    pub fn update_submission_status(
        &self,
        submission_id: &str,
        action: &str,
        notes: Option<&str>,
        rejection_type: Option<&str>,
    ) -> Result<Submission, MarketError> {
        let action: ReviewAction = action.parse()?;
        let submission =
            self.store
                .update_submission_status(submission_id, action, notes, rejection_type)?;
        self.events.emit(
            EventType::SubmissionReviewed,
            &submission.submission_id,
            "reviewer",
            format!("Submission is now {}", submission.status),
        );
        Ok(submission)
    }

    pub fn update_task_proof(&self, task_id: &str, proof: MerkleProof) -> Result<(), MarketError> {
        let status = proof.confirmation_status;
        self.store.update_task_proof(task_id, proof)?;
        self.events.emit(
            EventType::ProofUpdated,
            task_id,
            SYSTEM_ACTOR,
            format!("Funding proof is {}", status),
        );
        Ok(())
    }

    pub fn create_proposal(&self, proposal: Proposal) -> Result<Proposal, MarketError> {
        require("title", &proposal.title)?;
        let created = self.store.create_proposal(proposal)?;
        self.events.emit(
            EventType::ProposalCreated,
            &created.id,
            created
                .metadata
                .creator_api_key_hash
                .clone()
                .unwrap_or_else(|| SYSTEM_ACTOR.to_string()),
            format!(
                "Proposal for {} with {} tasks",
                created.contract_id(),
                created.tasks.len()
            ),
        );
        Ok(created)
    }

    /// Insert or refresh a pending proposal. Approved, published or
    /// foreign-owned rows come back unchanged and record no event.
    pub fn upsert_proposal(&self, proposal: Proposal) -> Result<Proposal, MarketError> {
        require("title", &proposal.title)?;
        let outcome = self.store.upsert_proposal(proposal)?;
        if outcome.changed {
            self.events.emit(
                EventType::ProposalCreated,
                &outcome.proposal.id,
                SYSTEM_ACTOR,
                format!("Proposal upserted for {}", outcome.proposal.contract_id()),
            );
        }
        Ok(outcome.proposal)
    }

    pub fn approve_proposal(
        &self,
        id: &str,
        approver_key_hash: Option<&str>,
    ) -> Result<Proposal, MarketError> {
        let outcome = self.store.approve_proposal(id, approver_key_hash)?;
        if outcome.changed {
            self.events.emit(
                EventType::ProposalApproved,
                id,
                approver_key_hash.unwrap_or(SYSTEM_ACTOR),
                format!("Approved plan for {}", outcome.proposal.contract_id()),
            );
        }
        Ok(outcome.proposal)
    }

    pub fn publish_proposal(&self, id: &str) -> Result<Proposal, MarketError> {
        let published = self.store.publish_proposal(id)?;
        self.events.emit(
            EventType::ProposalPublished,
            id,
            SYSTEM_ACTOR,
            format!("Published {}", published.contract_id()),
        );
        Ok(published)
    }
}

fn require(field: &str, value: &str) -> Result<(), MarketError> {
    if value.trim().is_empty() {
        return Err(MarketError::InvalidInput(format!("{} is required", field)));
    }
    Ok(())
}
