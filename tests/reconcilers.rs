//! Funding and ingestion reconcilers against a live service

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde_json::json;
use tempfile::TempDir;
use tokio::sync::broadcast;

use wish_market::funding::ReconcileStats;
use wish_market::ingestion::{IngestStats, MemoryIngestionSource, SqliteIngestionSource};
use wish_market::models::{
    IngestionStatus, MerkleProof, ProposalFilter, ProposalStatus, ProofStatus, Task, TaskFilter,
    TaskStatus,
};
use wish_market::services::EventType;
use wish_market::{
    EventLog, FundingProvider, FundingReconciler, IngestionReconciler, IngestionRecord,
    MarketError, MarketService, MemoryStore, SimulatedFundingProvider, SqliteStore,
};

fn memory_service() -> Arc<MarketService> {
    Arc::new(MarketService::new(
        Arc::new(MemoryStore::new(chrono::Duration::hours(72))),
        Arc::new(EventLog::new()),
    ))
}

fn provisional_task(id: &str) -> Task {
    let mut task = Task::new(id, "c-1", "x", 100);
    task.merkle_proof = Some(MerkleProof::provisional(Some("bc1qfund".into()), 100));
    task
}

/// Fails for one task id, delegates everything else
struct FlakyProvider {
    broken_task: String,
    inner: SimulatedFundingProvider,
}

#[async_trait]
impl FundingProvider for FlakyProvider {
    async fn fetch_proof(&self, task: &Task) -> Result<MerkleProof, MarketError> {
        if task.task_id == self.broken_task {
            return Err(MarketError::Funding("provider timeout".into()));
        }
        self.inner.fetch_proof(task).await
    }
}

/// Never confirms anything
struct PendingProvider;

#[async_trait]
impl FundingProvider for PendingProvider {
    async fn fetch_proof(&self, task: &Task) -> Result<MerkleProof, MarketError> {
        Ok(MerkleProof::provisional(None, task.budget_sats))
    }
}

#[tokio::test]
async fn test_funding_converges_despite_provider_failure() {
    let service = memory_service();
    for id in ["t-1", "t-2", "t-3"] {
        service.create_task(provisional_task(id)).unwrap();
    }

    let provider = Arc::new(FlakyProvider {
        broken_task: "t-2".into(),
        inner: SimulatedFundingProvider::new(840_000),
    });
    let reconciler = FundingReconciler::new(service.clone(), provider, Duration::from_secs(60));

    let stats = reconciler.tick().await.unwrap();
    assert_eq!(
        stats,
        ReconcileStats {
            checked: 3,
            confirmed: 2,
            still_provisional: 0,
            failed: 1
        }
    );

    let proof = service.get_task_proof("t-1").unwrap().unwrap();
    assert_eq!(proof.confirmation_status, ProofStatus::Confirmed);
    assert_eq!(proof.block_height, 840_000);
    assert!(proof.confirmed_at.is_some());
    assert_eq!(proof.funded_amount_sats, 100);

    let remaining = service.list_tasks(&TaskFilter::provisional_proofs()).unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].task_id, "t-2");

    let proof_events = service
        .events()
        .recent(50)
        .into_iter()
        .filter(|e| e.event_type == EventType::ProofUpdated)
        .count();
    assert_eq!(proof_events, 2);
}

#[tokio::test]
async fn test_provisional_answer_leaves_proof_alone() {
    let service = memory_service();
    service.create_task(provisional_task("t-1")).unwrap();

    let reconciler =
        FundingReconciler::new(service.clone(), Arc::new(PendingProvider), Duration::from_secs(60));
    let stats = reconciler.tick().await.unwrap();
    assert_eq!(stats.still_provisional, 1);
    assert_eq!(stats.confirmed, 0);

    let proof = service.get_task_proof("t-1").unwrap().unwrap();
    assert_eq!(proof.funding_address.as_deref(), Some("bc1qfund"));
    assert!(!proof.is_confirmed());
}

#[tokio::test]
async fn test_ingestion_batch_with_a_bad_record() {
    let service = memory_service();
    let source = Arc::new(MemoryIngestionSource::new());

    let mut wish = IngestionRecord::new(
        "rec-wish",
        json!({
            "message": "# Community garden\nWe need help.\n- dig beds\n- plant seeds",
            "address": "bc1qgarden",
            "price": 2000
        })
        .to_string(),
    );
    wish.creator_api_key_hash = Some("alice".into());
    wish.image_base64 = Some(base64::engine::general_purpose::STANDARD.encode(b"pixels"));
    source.push(wish).unwrap();

    let structured = IngestionRecord::new(
        "rec-doc",
        json!({
            "contract": {"contract_id": "bridge", "title": "Footbridge", "skills": ["welding"]},
            "tasks": [
                {"title": "Survey", "budget_sats": 400},
                {"title": "Weld", "budget_sats": 600, "skills": ["welding"]}
            ]
        })
        .to_string(),
    );
    source.push(structured).unwrap();
    source.push(IngestionRecord::new("rec-empty", "")).unwrap();

    let reconciler =
        IngestionReconciler::new(service.clone(), source.clone(), Duration::from_secs(30), 25);
    let stats = reconciler.tick().await.unwrap();
    assert_eq!(
        stats,
        IngestStats {
            processed: 3,
            verified: 2,
            invalid: 1
        }
    );

    let empty = source.get("rec-empty").unwrap().unwrap();
    assert_eq!(empty.status, IngestionStatus::Invalid);
    assert!(empty.note.unwrap().contains("empty"));
    assert_eq!(
        source.get("rec-wish").unwrap().unwrap().status,
        IngestionStatus::Verified
    );

    // ingestion never creates tasks directly
    assert!(service.list_tasks(&TaskFilter::default()).unwrap().is_empty());

    let proposals = service
        .list_proposals(&ProposalFilter {
            status: Some(ProposalStatus::Pending),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(proposals.len(), 2);

    let wish_proposal = proposals
        .iter()
        .find(|p| p.contract_id().starts_with("wish-"))
        .unwrap();
    assert_eq!(wish_proposal.title, "Community garden");
    assert_eq!(wish_proposal.budget_sats, 2000);
    assert_eq!(wish_proposal.tasks.len(), 2);
    assert!(wish_proposal.visible_pixel_hash.is_some());
    assert_eq!(wish_proposal.id, format!("proposal-{}", wish_proposal.contract_id()));

    let bridge = service.get_contract("bridge").unwrap();
    assert_eq!(bridge.total_budget_sats, 1000);
    assert_eq!(bridge.skills, vec!["welding".to_string()]);

    let ingested = service
        .events()
        .recent(50)
        .into_iter()
        .filter(|e| e.event_type == EventType::IngestionProcessed)
        .count();
    assert_eq!(ingested, 3);
}

#[tokio::test]
async fn test_wish_to_confirmed_tasks() {
    let service = memory_service();
    let source = Arc::new(MemoryIngestionSource::new());
    let mut wish = IngestionRecord::new(
        "rec-1",
        json!({"message": "# Paint fence\n- sand\n- paint", "address": "bc1qfence", "price": 300})
            .to_string(),
    );
    wish.creator_api_key_hash = Some("alice".into());
    source.push(wish).unwrap();

    IngestionReconciler::new(service.clone(), source, Duration::from_secs(30), 25)
        .tick()
        .await
        .unwrap();

    let proposal = service
        .list_proposals(&ProposalFilter::default())
        .unwrap()
        .pop()
        .unwrap();
    service.approve_proposal(&proposal.id, Some("alice")).unwrap();

    let tasks = service
        .list_tasks(&TaskFilter::for_contract(proposal.contract_id()))
        .unwrap();
    assert_eq!(tasks.len(), 2);
    assert!(tasks.iter().all(|t| t.status == TaskStatus::Available));
    assert_eq!(tasks.iter().map(|t| t.budget_sats).sum::<u64>(), 300);

    let funding = FundingReconciler::new(
        service.clone(),
        Arc::new(SimulatedFundingProvider::new(1)),
        Duration::from_secs(60),
    );
    assert_eq!(funding.tick().await.unwrap().confirmed, 2);
    assert!(service
        .list_tasks(&TaskFilter::provisional_proofs())
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_duplicate_wish_from_another_creator() {
    let services = vec![
        memory_service(),
        Arc::new(MarketService::new(
            Arc::new(SqliteStore::open_in_memory(chrono::Duration::hours(72)).unwrap()),
            Arc::new(EventLog::new()),
        )),
    ];

    for service in services {
        let payload = json!({"message": "# Paint fence\n- sand\n- paint", "price": 300}).to_string();
        let source = Arc::new(MemoryIngestionSource::new());

        let mut first = IngestionRecord::new("rec-alice", payload.clone());
        first.creator_api_key_hash = Some("alice".into());
        let mut duplicate = IngestionRecord::new("rec-mallory", payload);
        duplicate.creator_api_key_hash = Some("mallory".into());
        duplicate.created_at = first.created_at - chrono::Duration::minutes(1);
        source.push(first).unwrap();
        source.push(duplicate).unwrap();

        let stats = IngestionReconciler::new(service.clone(), source, Duration::from_secs(30), 25)
            .tick()
            .await
            .unwrap();
        assert_eq!(stats.processed, 2);

        let proposals = service.list_proposals(&ProposalFilter::default()).unwrap();
        assert_eq!(proposals.len(), 1, "{}", service.store().backend());
        let proposal = &proposals[0];
        assert_eq!(proposal.metadata.creator_api_key_hash.as_deref(), Some("alice"));
        let wish = service.get_contract(proposal.contract_id()).unwrap();
        assert_eq!(wish.creator_api_key_hash.as_deref(), Some("alice"));

        assert!(matches!(
            service.approve_proposal(&proposal.id, Some("mallory")),
            Err(MarketError::Unauthorized(_))
        ));
        service.approve_proposal(&proposal.id, Some("alice")).unwrap();
    }
}

#[tokio::test]
async fn test_sqlite_pipeline_end_to_end() {
    let dir = TempDir::new().unwrap();
    let store = SqliteStore::open(&dir.path().join("market.db"), chrono::Duration::hours(72)).unwrap();
    let service = Arc::new(MarketService::new(Arc::new(store), Arc::new(EventLog::new())));

    let source = Arc::new(SqliteIngestionSource::open(&dir.path().join("ingestion.db")).unwrap());
    source
        .enqueue(&IngestionRecord::new("rec-1", "Fix the roof\n* gutters\n* shingles"))
        .unwrap();
    let mut bad = IngestionRecord::new("rec-2", "# Mural");
    bad.image_base64 = Some("not//valid==base64!".into());
    source.enqueue(&bad).unwrap();

    let reconciler = IngestionReconciler::new(service.clone(), source.clone(), Duration::from_secs(30), 25);
    let stats = reconciler.tick().await.unwrap();
    assert_eq!(stats.verified, 1);
    assert_eq!(stats.invalid, 1);

    assert_eq!(source.get("rec-2").unwrap().unwrap().status, IngestionStatus::Invalid);
    let proposals = service.list_proposals(&ProposalFilter::default()).unwrap();
    assert_eq!(proposals.len(), 1);
    assert_eq!(proposals[0].title, "Fix the roof");

    // marked records are not picked up again
    assert_eq!(reconciler.tick().await.unwrap().processed, 0);
}

#[tokio::test]
async fn test_reconcilers_stop_on_shutdown() {
    let service = memory_service();
    service.create_task(provisional_task("t-1")).unwrap();
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let funding = FundingReconciler::new(
        service.clone(),
        Arc::new(SimulatedFundingProvider::new(1)),
        Duration::from_millis(10),
    )
    .with_shutdown(shutdown_tx.subscribe());
    let ingestion = IngestionReconciler::new(
        service.clone(),
        Arc::new(MemoryIngestionSource::new()),
        Duration::from_millis(10),
        25,
    )
    .with_shutdown(shutdown_tx.subscribe());

    let funding_handle = tokio::spawn(funding.run());
    let ingestion_handle = tokio::spawn(ingestion.run());

    tokio::time::sleep(Duration::from_millis(50)).await;
    shutdown_tx.send(()).unwrap();

    tokio::time::timeout(Duration::from_secs(5), funding_handle)
        .await
        .expect("funding reconciler did not stop")
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), ingestion_handle)
        .await
        .expect("ingestion reconciler did not stop")
        .unwrap();

    // the first tick fires immediately, so the proof was confirmed before shutdown
    assert!(service.get_task_proof("t-1").unwrap().unwrap().is_confirmed());
}
