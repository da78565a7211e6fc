//! Lifecycle behaviour shared by every store backend
//!
//! Each scenario runs against both the in-memory and the SQLite store.

use std::sync::Arc;
use std::thread;

use chrono::Duration;
use serde_json::{json, Map, Value};
use tempfile::TempDir;

use wish_market::models::{
    ClaimStatus, Contract, ContractStatus, MerkleProof, Proposal, ProposalStatus, ProofStatus,
    SubmissionStatus, Task, TaskFilter, TaskStatus,
};
use wish_market::store::ReviewAction;
use wish_market::{ErrorKind, MarketError, MarketStore, MemoryStore, SqliteStore};

fn backends(ttl: Duration) -> Vec<Arc<dyn MarketStore>> {
    vec![
        Arc::new(MemoryStore::new(ttl)),
        Arc::new(SqliteStore::open_in_memory(ttl).unwrap()),
    ]
}

fn funded_task(id: &str, contract: &str) -> Task {
    let mut task = Task::new(id, contract, "Do the thing", 100);
    task.merkle_proof = Some(MerkleProof::provisional(Some("bc1qfund".into()), 100));
    task
}

fn deliverables() -> Map<String, Value> {
    let mut map = Map::new();
    map.insert("artifact".into(), json!("https://example.org/pr/1"));
    map
}

fn claim_and_submit(store: &dyn MarketStore, task_id: &str, agent: &str) -> String {
    let claim = store.claim_task(task_id, agent, None).unwrap().claim;
    store
        .submit_work(&claim.claim_id, deliverables(), json!({"hash": "abc"}))
        .unwrap()
        .submission_id
}

/// Wish owned by `alice` with one markdown proposal of two bullet tasks
fn seed_wish(store: &dyn MarketStore, proposal_id: &str) -> Proposal {
    let mut wish = Contract::new("wish-0011223344556677", "Community garden", 200);
    wish.creator_api_key_hash = Some("alice".into());
    if store.get_contract(&wish.contract_id).is_err() {
        store.create_contract(wish).unwrap();
    }

    let mut proposal = Proposal::new(proposal_id, "Garden plan", 200);
    proposal.description_md = "## Plan\n- dig beds\n- plant seeds".into();
    proposal.metadata.contract_id = Some("wish-0011223344556677".into());
    proposal.metadata.funding_address = Some("bc1qgarden".into());
    store.create_proposal(proposal).unwrap()
}

#[test]
fn test_single_live_lease_per_task() {
    for store in backends(Duration::hours(72)) {
        store.create_task(funded_task("t-1", "c-1")).unwrap();

        let first = store.claim_task("t-1", "agent-a", Some("bc1qa")).unwrap();
        assert!(!first.reused);

        let err = store.claim_task("t-1", "agent-b", None).unwrap_err();
        assert!(matches!(err, MarketError::TaskTaken { .. }), "{}", store.backend());
        assert_eq!(err.kind(), ErrorKind::Conflict);

        let again = store.claim_task("t-1", "agent-a", None).unwrap();
        assert!(again.reused);
        assert_eq!(again.claim.claim_id, first.claim.claim_id);
        assert_eq!(store.list_claims("t-1").unwrap().len(), 1);
    }
}

#[test]
fn test_lapsed_lease_is_reclaimable() {
    for store in backends(Duration::zero()) {
        store.create_task(funded_task("t-1", "c-1")).unwrap();

        let first = store.claim_task("t-1", "agent-a", None).unwrap().claim;
        let task = store.get_task("t-1").unwrap();
        assert_eq!(task.status, TaskStatus::Available, "{}", store.backend());
        assert!(task.claimed_by.is_none());

        let second = store.claim_task("t-1", "agent-b", None).unwrap().claim;
        assert_ne!(first.claim_id, second.claim_id);
        assert_eq!(store.get_claim(&first.claim_id).unwrap().status, ClaimStatus::Expired);

        let active = store
            .list_claims("t-1")
            .unwrap()
            .into_iter()
            .filter(|c| c.status == ClaimStatus::Active)
            .count();
        assert_eq!(active, 1);
    }
}

#[test]
fn test_submit_on_expired_claim_reopens_task() {
    for store in backends(Duration::zero()) {
        store.create_task(funded_task("t-1", "c-1")).unwrap();
        let claim = store.claim_task("t-1", "agent-a", None).unwrap().claim;

        let err = store
            .submit_work(&claim.claim_id, deliverables(), Value::Null)
            .unwrap_err();
        assert!(matches!(err, MarketError::ClaimExpired(_)), "{}", store.backend());
        assert!(err.is_conflict());

        // the expiry is persisted even though the call failed
        assert_eq!(store.get_claim(&claim.claim_id).unwrap().status, ClaimStatus::Expired);
        let task = store.get_task("t-1").unwrap();
        assert_eq!(task.status, TaskStatus::Available);
        assert!(task.claim_expires_at.is_none());
        assert!(store.list_submissions(&["t-1".to_string()]).unwrap().is_empty());
    }
}

#[test]
fn test_submission_locks_task() {
    for store in backends(Duration::hours(72)) {
        store.create_task(funded_task("t-1", "c-1")).unwrap();
        let submission_id = claim_and_submit(store.as_ref(), "t-1", "agent-a");

        let submission = store.get_submission(&submission_id).unwrap();
        assert_eq!(submission.status, SubmissionStatus::PendingReview);
        assert_eq!(store.get_task("t-1").unwrap().status, TaskStatus::Submitted);

        let err = store.claim_task("t-1", "agent-b", None).unwrap_err();
        assert!(matches!(err, MarketError::TaskUnavailable { .. }), "{}", store.backend());

        let claim = store.get_claim(&submission.claim_id).unwrap();
        assert_eq!(claim.status, ClaimStatus::Submitted);
        let err = store
            .submit_work(&claim.claim_id, deliverables(), Value::Null)
            .unwrap_err();
        assert!(matches!(err, MarketError::ClaimNotActive { .. }));
    }
}

#[test]
fn test_rework_is_additive() {
    for store in backends(Duration::hours(72)) {
        store.create_task(funded_task("t-1", "c-1")).unwrap();
        let submission_id = claim_and_submit(store.as_ref(), "t-1", "agent-a");

        let reworked = store
            .update_submission_status(&submission_id, ReviewAction::Rework, Some("add tests"), None)
            .unwrap();
        assert_eq!(reworked.status, SubmissionStatus::PendingReview);
        assert_eq!(reworked.deliverables["artifact"], json!("https://example.org/pr/1"));
        assert_eq!(reworked.deliverables["rework_notes"], json!("add tests"));
        assert!(reworked.deliverables.contains_key("reworked_at"));
        assert_eq!(store.get_task("t-1").unwrap().status, TaskStatus::Submitted);
    }
}

#[test]
fn test_final_rejection_reopens_task() {
    for store in backends(Duration::hours(72)) {
        store.create_task(funded_task("t-1", "c-1")).unwrap();
        let submission_id = claim_and_submit(store.as_ref(), "t-1", "agent-a");

        let rejected = store
            .update_submission_status(
                &submission_id,
                ReviewAction::Reject,
                Some("off topic"),
                Some("final"),
            )
            .unwrap();
        assert_eq!(rejected.status, SubmissionStatus::Rejected);
        assert_eq!(rejected.review_notes.as_deref(), Some("off topic"));
        assert_eq!(store.get_task("t-1").unwrap().status, TaskStatus::Available);

        let claim = store.claim_task("t-1", "agent-b", None).unwrap();
        assert!(!claim.reused);
    }
}

#[test]
fn test_proof_update_verifies_task() {
    for store in backends(Duration::hours(72)) {
        let mut task = Task::new("t-1", "c-1", "x", 50);
        task.status = TaskStatus::Unverified;
        store.create_task(task).unwrap();
        assert_eq!(store.get_task_proof("t-1").unwrap(), None);

        let mut proof = MerkleProof::provisional(Some("bc1q".into()), 50);
        proof.confirmation_status = ProofStatus::Confirmed;
        proof.tx_id = "deadbeef".into();
        store.update_task_proof("t-1", proof).unwrap();

        let stored = store.get_task_proof("t-1").unwrap().unwrap();
        assert!(stored.is_confirmed());
        assert_eq!(stored.tx_id, "deadbeef");
        assert_eq!(store.get_task("t-1").unwrap().status, TaskStatus::Available);

        let err = store.get_task_proof("missing").unwrap_err();
        assert!(err.is_not_found());
    }
}

#[test]
fn test_proposal_approval_is_single_winner() {
    for store in backends(Duration::hours(72)) {
        let first = seed_wish(store.as_ref(), "p-1");
        seed_wish(store.as_ref(), "p-2");
        assert_eq!(first.tasks.len(), 2);
        assert_eq!(first.tasks[0].task_id, "p-1-task-1");

        let err = store.approve_proposal("p-1", Some("mallory")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized, "{}", store.backend());

        let approved = store.approve_proposal("p-1", Some("alice")).unwrap();
        assert!(approved.changed);
        assert_eq!(approved.proposal.status, ProposalStatus::Approved);

        let contract = store.get_contract("wish-0011223344556677").unwrap();
        assert_eq!(contract.status, ContractStatus::Active);
        assert_eq!(contract.goals_count, 2);

        let tasks = store
            .list_tasks(&TaskFilter::for_contract("wish-0011223344556677"))
            .unwrap();
        assert_eq!(tasks.len(), 2);
        assert!(tasks.iter().all(|t| t.status == TaskStatus::Available));

        let err = store.approve_proposal("p-2", Some("alice")).unwrap_err();
        assert!(matches!(err, MarketError::Conflict(_)));
        assert_eq!(store.get_proposal("p-2").unwrap().status, ProposalStatus::Pending);

        // re-approving the winner changes nothing
        assert!(!store.approve_proposal("p-1", Some("alice")).unwrap().changed);
        let tasks = store
            .list_tasks(&TaskFilter::for_contract("wish-0011223344556677"))
            .unwrap();
        assert_eq!(tasks.len(), 2);
    }
}

#[test]
fn test_publish_requires_every_task_approved() {
    for store in backends(Duration::hours(72)) {
        seed_wish(store.as_ref(), "p-1");

        let err = store.publish_proposal("p-1").unwrap_err();
        assert!(err.is_conflict(), "pending proposal must not publish");

        store.approve_proposal("p-1", Some("alice")).unwrap();

        let first = claim_and_submit(store.as_ref(), "p-1-task-1", "agent-a");
        let second = claim_and_submit(store.as_ref(), "p-1-task-2", "agent-b");
        store
            .update_submission_status(&first, ReviewAction::Approve, None, None)
            .unwrap();

        match store.publish_proposal("p-1").unwrap_err() {
            MarketError::PublishBlocked { task_id, .. } => assert_eq!(task_id, "p-1-task-2"),
            other => panic!("unexpected error on {}: {}", store.backend(), other),
        }
        assert_eq!(store.get_proposal("p-1").unwrap().status, ProposalStatus::Approved);

        store
            .update_submission_status(&second, ReviewAction::Approve, Some("great"), None)
            .unwrap();
        let published = store.publish_proposal("p-1").unwrap();
        assert_eq!(published.status, ProposalStatus::Published);

        let contract = store.get_contract("wish-0011223344556677").unwrap();
        assert_eq!(contract.status, ContractStatus::Completed);
        for task_id in ["p-1-task-1", "p-1-task-2"] {
            assert_eq!(store.get_task(task_id).unwrap().status, TaskStatus::Published);
        }
    }
}

/// Approve `p-1` and carry both of its tasks through review
fn approve_and_complete(store: &dyn MarketStore) {
    store.approve_proposal("p-1", Some("alice")).unwrap();
    for (task_id, agent) in [("p-1-task-1", "agent-a"), ("p-1-task-2", "agent-b")] {
        let submission_id = claim_and_submit(store, task_id, agent);
        store
            .update_submission_status(&submission_id, ReviewAction::Approve, None, None)
            .unwrap();
    }
}

#[test]
fn test_published_winner_still_blocks_siblings() {
    for store in backends(Duration::hours(72)) {
        seed_wish(store.as_ref(), "p-1");
        seed_wish(store.as_ref(), "p-2");
        approve_and_complete(store.as_ref());
        store.publish_proposal("p-1").unwrap();

        let err = store.approve_proposal("p-2", Some("alice")).unwrap_err();
        assert!(matches!(err, MarketError::Conflict(_)), "{}", store.backend());
        assert_eq!(store.get_proposal("p-2").unwrap().status, ProposalStatus::Pending);

        let contract = store.get_contract("wish-0011223344556677").unwrap();
        assert_eq!(contract.status, ContractStatus::Completed);
        let tasks = store
            .list_tasks(&TaskFilter::for_contract("wish-0011223344556677"))
            .unwrap();
        assert_eq!(tasks.len(), 2);
        assert!(tasks.iter().all(|t| t.status == TaskStatus::Published));
    }
}

#[test]
fn test_resent_wish_keeps_owner_and_task_counts() {
    for store in backends(Duration::hours(72)) {
        let wish_id = "wish-0011223344556677";
        let mut wish = Contract::new(wish_id, "Community garden", 200);
        wish.creator_api_key_hash = Some("alice".into());
        store.upsert_contract(wish.clone()).unwrap();

        let mut proposal = Proposal::new("p-1", "Garden plan", 200);
        proposal.description_md = "- dig beds\n- plant seeds".into();
        proposal.metadata.contract_id = Some(wish_id.into());
        proposal.metadata.creator_api_key_hash = Some("alice".into());
        store.upsert_proposal(proposal.clone()).unwrap();

        // same text sent again by someone else
        let mut foreign_wish = wish.clone();
        foreign_wish.creator_api_key_hash = Some("mallory".into());
        store.upsert_contract(foreign_wish).unwrap();
        let mut foreign = proposal.clone();
        foreign.metadata.creator_api_key_hash = Some("mallory".into());
        assert!(!store.upsert_proposal(foreign).unwrap().changed, "{}", store.backend());

        assert_eq!(
            store.get_contract(wish_id).unwrap().creator_api_key_hash.as_deref(),
            Some("alice")
        );
        let stored = store.get_proposal("p-1").unwrap();
        assert_eq!(stored.metadata.creator_api_key_hash.as_deref(), Some("alice"));

        let err = store.approve_proposal("p-1", Some("mallory")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
        store.approve_proposal("p-1", Some("alice")).unwrap();

        // resending after approval leaves the derived fields alone
        store.upsert_contract(wish.clone()).unwrap();
        let contract = store.get_contract(wish_id).unwrap();
        assert_eq!(contract.status, ContractStatus::Active);
        assert_eq!((contract.goals_count, contract.available_tasks_count), (2, 2));
        assert_eq!(contract.total_budget_sats, 200);
    }
}

#[test]
fn test_available_count_follows_task_state() {
    for store in backends(Duration::hours(72)) {
        seed_wish(store.as_ref(), "p-1");
        store.approve_proposal("p-1", Some("alice")).unwrap();
        let count = |store: &dyn MarketStore| {
            store
                .get_contract("wish-0011223344556677")
                .unwrap()
                .available_tasks_count
        };
        assert_eq!(count(store.as_ref()), 2, "{}", store.backend());

        let submission_id = claim_and_submit(store.as_ref(), "p-1-task-1", "agent-a");
        store.claim_task("p-1-task-2", "agent-b", None).unwrap();
        assert_eq!(count(store.as_ref()), 0);
        let listed = store.list_contracts(&Default::default()).unwrap();
        assert_eq!(listed[0].available_tasks_count, 0);

        store
            .update_submission_status(&submission_id, ReviewAction::Reject, None, Some("final"))
            .unwrap();
        assert_eq!(count(store.as_ref()), 1);
    }
}

#[test]
fn test_lease_past_the_calendar_leaves_store_usable() {
    for store in backends(Duration::days(365 * 300_000)) {
        store.create_task(funded_task("t-1", "c-1")).unwrap();

        let err = store.claim_task("t-1", "agent-a", None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Invalid, "{}", store.backend());

        let task = store.get_task("t-1").unwrap();
        assert_eq!(task.status, TaskStatus::Available);
        assert!(store.list_claims("t-1").unwrap().is_empty());
    }
}

#[test]
fn test_concurrent_claims_have_one_winner() {
    let dir = TempDir::new().unwrap();
    let stores: Vec<Arc<dyn MarketStore>> = vec![
        Arc::new(MemoryStore::new(Duration::hours(72))),
        Arc::new(SqliteStore::open(&dir.path().join("market.db"), Duration::hours(72)).unwrap()),
    ];

    for store in stores {
        store.create_task(funded_task("t-race", "c-1")).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                thread::spawn(move || store.claim_task("t-race", &format!("agent-{}", i), None))
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let winners = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(winners, 1, "{}", store.backend());
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, MarketError::TaskTaken { .. })));
    }
}
