//! SQLite store variant
//!
//! Every mutation runs in a `BEGIN IMMEDIATE` transaction: the write lock is
//! taken before the first read, so the rows a rule inspects (sibling
//! proposals, a task's claims) cannot change before the write commits.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, params_from_iter, Connection, Params, Row, TransactionBehavior};
use serde_json::{Map, Value};
use tracing::{debug, info};

use super::rules::{self, ApprovalDecision, ClaimDecision, ReviewAction, SubmitCheck};
use super::schema;
use super::{ClaimOutcome, MarketStore, ProposalOutcome};
use crate::error::MarketError;
use crate::models::{
    Claim, ClaimStatus, Contract, ContractFilter, ContractStatus, MerkleProof, Proposal,
    ProposalFilter, ProposalStatus, Submission, Task, TaskFilter, TaskStatus,
};

/// Durable store backed by a single SQLite connection
pub struct SqliteStore {
    conn: Mutex<Connection>,
    lease_ttl: Duration,
}

impl SqliteStore {
    /// Open or create the marketplace database
    pub fn open(db_path: &Path, lease_ttl: Duration) -> Result<Self, MarketError> {
        info!("Opening marketplace database at {:?}", db_path);

        let conn = Connection::open(db_path)
            .map_err(|e| MarketError::Internal(format!("Failed to open SQLite: {}", e)))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| MarketError::Internal(format!("Failed to set PRAGMA: {}", e)))?;

        Self::from_connection(conn, lease_ttl)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory(lease_ttl: Duration) -> Result<Self, MarketError> {
        debug!("Opening in-memory marketplace database");

        let conn = Connection::open_in_memory()
            .map_err(|e| MarketError::Internal(format!("Failed to open in-memory SQLite: {}", e)))?;

        Self::from_connection(conn, lease_ttl)
    }

    fn from_connection(conn: Connection, lease_ttl: Duration) -> Result<Self, MarketError> {
        schema::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            lease_ttl,
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, MarketError> {
        self.conn
            .lock()
            .map_err(|e| MarketError::Internal(format!("Lock poisoned: {}", e)))
    }

    /// Read-only access to the connection
    fn with_conn<F, T>(&self, f: F) -> Result<T, MarketError>
    where
        F: FnOnce(&Connection) -> Result<T, MarketError>,
    {
        let conn = self.lock()?;
        f(&conn)
    }

    /// Run `f` inside one immediate transaction; commits only on `Ok`
    fn with_tx<F, T>(&self, f: F) -> Result<T, MarketError>
    where
        F: FnOnce(&Connection) -> Result<T, MarketError>,
    {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }
}

// ============================================================================
// Row Mapping
// ============================================================================

const CONTRACT_COLUMNS: &str = "contract_id, title, total_budget_sats, goals_count, \
    available_tasks_count, status, skills_json, creator_api_key_hash, funding_address, \
    created_at, updated_at";

const TASK_COLUMNS: &str = "task_id, contract_id, title, description, budget_sats, skills_json, \
    status, claimed_by, claimed_at, claim_expires_at, contractor_wallet, merkle_proof_json, \
    created_at, updated_at";

const CLAIM_COLUMNS: &str = "claim_id, task_id, ai_identifier, wallet, status, expires_at, created_at";

const SUBMISSION_COLUMNS: &str = "submission_id, claim_id, task_id, status, deliverables_json, \
    completion_proof_json, review_notes, rejection_type, created_at, updated_at";

const PROPOSAL_COLUMNS: &str = "id, title, description_md, visible_pixel_hash, budget_sats, \
    status, tasks_json, metadata_json, created_at, updated_at";

fn contract_from_row(row: &Row) -> Result<Contract, MarketError> {
    let status: String = row.get("status")?;
    let skills: String = row.get("skills_json")?;
    Ok(Contract {
        contract_id: row.get("contract_id")?,
        title: row.get("title")?,
        total_budget_sats: row.get::<_, i64>("total_budget_sats")? as u64,
        goals_count: row.get::<_, i64>("goals_count")? as u32,
        available_tasks_count: row.get::<_, i64>("available_tasks_count")? as u32,
        status: status.parse()?,
        skills: serde_json::from_str(&skills)?,
        creator_api_key_hash: row.get("creator_api_key_hash")?,
        funding_address: row.get("funding_address")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn task_from_row(row: &Row) -> Result<Task, MarketError> {
    let status: String = row.get("status")?;
    let skills: String = row.get("skills_json")?;
    let proof: Option<String> = row.get("merkle_proof_json")?;
    Ok(Task {
        task_id: row.get("task_id")?,
        contract_id: row.get("contract_id")?,
        title: row.get("title")?,
        description: row.get("description")?,
        budget_sats: row.get::<_, i64>("budget_sats")? as u64,
        skills: serde_json::from_str(&skills)?,
        status: status.parse()?,
        claimed_by: row.get("claimed_by")?,
        claimed_at: row.get("claimed_at")?,
        claim_expires_at: row.get("claim_expires_at")?,
        contractor_wallet: row.get("contractor_wallet")?,
        merkle_proof: proof.map(|p| serde_json::from_str(&p)).transpose()?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn claim_from_row(row: &Row) -> Result<Claim, MarketError> {
    let status: String = row.get("status")?;
    Ok(Claim {
        claim_id: row.get("claim_id")?,
        task_id: row.get("task_id")?,
        ai_identifier: row.get("ai_identifier")?,
        wallet: row.get("wallet")?,
        status: status.parse()?,
        expires_at: row.get("expires_at")?,
        created_at: row.get("created_at")?,
    })
}

fn submission_from_row(row: &Row) -> Result<Submission, MarketError> {
    let status: String = row.get("status")?;
    let deliverables: String = row.get("deliverables_json")?;
    let proof: String = row.get("completion_proof_json")?;
    Ok(Submission {
        submission_id: row.get("submission_id")?,
        claim_id: row.get("claim_id")?,
        task_id: row.get("task_id")?,
        status: status.parse()?,
        deliverables: serde_json::from_str(&deliverables)?,
        completion_proof: serde_json::from_str(&proof)?,
        review_notes: row.get("review_notes")?,
        rejection_type: row.get("rejection_type")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn proposal_from_row(row: &Row) -> Result<Proposal, MarketError> {
    let status: String = row.get("status")?;
    let tasks: String = row.get("tasks_json")?;
    let metadata: String = row.get("metadata_json")?;
    Ok(Proposal {
        id: row.get("id")?,
        title: row.get("title")?,
        description_md: row.get("description_md")?,
        visible_pixel_hash: row.get("visible_pixel_hash")?,
        budget_sats: row.get::<_, i64>("budget_sats")? as u64,
        status: status.parse()?,
        tasks: serde_json::from_str(&tasks)?,
        metadata: serde_json::from_str(&metadata)?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn query_rows<T, P: Params>(
    conn: &Connection,
    sql: &str,
    params: P,
    map: fn(&Row) -> Result<T, MarketError>,
) -> Result<Vec<T>, MarketError> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(params)?;
    let mut results = Vec::new();
    while let Some(row) = rows.next()? {
        results.push(map(row)?);
    }
    Ok(results)
}

fn query_one<T, P: Params>(
    conn: &Connection,
    sql: &str,
    params: P,
    map: fn(&Row) -> Result<T, MarketError>,
) -> Result<Option<T>, MarketError> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(params)?;
    match rows.next()? {
        Some(row) => Ok(Some(map(row)?)),
        None => Ok(None),
    }
}

// ============================================================================
// Row Access
// ============================================================================

fn load_contract(conn: &Connection, contract_id: &str) -> Result<Option<Contract>, MarketError> {
    let sql = format!("SELECT {} FROM contracts WHERE contract_id = ?", CONTRACT_COLUMNS);
    query_one(conn, &sql, params![contract_id], contract_from_row)
}

fn find_task(conn: &Connection, task_id: &str) -> Result<Option<Task>, MarketError> {
    let sql = format!("SELECT {} FROM tasks WHERE task_id = ?", TASK_COLUMNS);
    query_one(conn, &sql, params![task_id], task_from_row)
}

fn load_task(conn: &Connection, task_id: &str) -> Result<Task, MarketError> {
    find_task(conn, task_id)?.ok_or_else(|| MarketError::TaskNotFound(task_id.to_string()))
}

fn load_tasks_for(conn: &Connection, contract_id: &str) -> Result<Vec<Task>, MarketError> {
    let sql = format!(
        "SELECT {} FROM tasks WHERE contract_id = ? ORDER BY task_id",
        TASK_COLUMNS
    );
    query_rows(conn, &sql, params![contract_id], task_from_row)
}

fn load_claim(conn: &Connection, claim_id: &str) -> Result<Claim, MarketError> {
    let sql = format!("SELECT {} FROM claims WHERE claim_id = ?", CLAIM_COLUMNS);
    query_one(conn, &sql, params![claim_id], claim_from_row)?
        .ok_or_else(|| MarketError::ClaimNotFound(claim_id.to_string()))
}

fn load_claims_for(conn: &Connection, task_id: &str) -> Result<Vec<Claim>, MarketError> {
    let sql = format!(
        "SELECT {} FROM claims WHERE task_id = ? ORDER BY created_at",
        CLAIM_COLUMNS
    );
    query_rows(conn, &sql, params![task_id], claim_from_row)
}

fn load_submission(conn: &Connection, submission_id: &str) -> Result<Submission, MarketError> {
    let sql = format!("SELECT {} FROM submissions WHERE submission_id = ?", SUBMISSION_COLUMNS);
    query_one(conn, &sql, params![submission_id], submission_from_row)?
        .ok_or_else(|| MarketError::SubmissionNotFound(submission_id.to_string()))
}

fn load_submissions_for(conn: &Connection, task_ids: &[String]) -> Result<Vec<Submission>, MarketError> {
    if task_ids.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders = vec!["?"; task_ids.len()].join(", ");
    let sql = format!(
        "SELECT {} FROM submissions WHERE task_id IN ({}) ORDER BY created_at",
        SUBMISSION_COLUMNS, placeholders
    );
    query_rows(conn, &sql, params_from_iter(task_ids.iter()), submission_from_row)
}

fn find_proposal(conn: &Connection, id: &str) -> Result<Option<Proposal>, MarketError> {
    let sql = format!("SELECT {} FROM proposals WHERE id = ?", PROPOSAL_COLUMNS);
    query_one(conn, &sql, params![id], proposal_from_row)
}

fn load_proposal(conn: &Connection, id: &str) -> Result<Proposal, MarketError> {
    find_proposal(conn, id)?.ok_or_else(|| MarketError::ProposalNotFound(id.to_string()))
}

/// Open task count per contract, with lazy expiry applied
fn open_task_counts(conn: &Connection, now: DateTime<Utc>) -> Result<HashMap<String, u32>, MarketError> {
    let sql = format!(
        "SELECT {} FROM tasks WHERE status IN ('available', 'unverified', 'claimed')",
        TASK_COLUMNS
    );
    let mut counts = HashMap::new();
    for task in query_rows(conn, &sql, [], task_from_row)? {
        if rules::is_open(&task, now) {
            *counts.entry(task.contract_id).or_insert(0) += 1;
        }
    }
    Ok(counts)
}

fn load_siblings(conn: &Connection, contract_id: &str) -> Result<Vec<Proposal>, MarketError> {
    let sql = format!(
        "SELECT {} FROM proposals WHERE contract_id = ? ORDER BY id",
        PROPOSAL_COLUMNS
    );
    query_rows(conn, &sql, params![contract_id], proposal_from_row)
}

fn exists(conn: &Connection, table: &str, key_column: &str, key: &str) -> Result<bool, MarketError> {
    let sql = format!("SELECT 1 FROM {} WHERE {} = ?", table, key_column);
    let mut stmt = conn.prepare(&sql)?;
    Ok(stmt.exists(params![key])?)
}

fn save_contract(conn: &Connection, contract: &Contract) -> Result<(), MarketError> {
    conn.execute(
        r#"
        INSERT INTO contracts (
            contract_id, title, total_budget_sats, goals_count, available_tasks_count,
            status, skills_json, creator_api_key_hash, funding_address, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(contract_id) DO UPDATE SET
            title = excluded.title,
            total_budget_sats = excluded.total_budget_sats,
            goals_count = excluded.goals_count,
            available_tasks_count = excluded.available_tasks_count,
            status = excluded.status,
            skills_json = excluded.skills_json,
            creator_api_key_hash = excluded.creator_api_key_hash,
            funding_address = excluded.funding_address,
            updated_at = excluded.updated_at
        "#,
        params![
            contract.contract_id,
            contract.title,
            contract.total_budget_sats as i64,
            contract.goals_count as i64,
            contract.available_tasks_count as i64,
            contract.status.as_str(),
            serde_json::to_string(&contract.skills)?,
            contract.creator_api_key_hash,
            contract.funding_address,
            contract.created_at,
            contract.updated_at,
        ],
    )?;
    Ok(())
}

fn save_task(conn: &Connection, task: &Task) -> Result<(), MarketError> {
    let proof_json = task.merkle_proof.as_ref().map(serde_json::to_string).transpose()?;
    let proof_status = task
        .merkle_proof
        .as_ref()
        .map(|p| p.confirmation_status.as_str());
    conn.execute(
        r#"
        INSERT INTO tasks (
            task_id, contract_id, title, description, budget_sats, skills_json, status,
            claimed_by, claimed_at, claim_expires_at, contractor_wallet,
            merkle_proof_json, proof_status, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(task_id) DO UPDATE SET
            contract_id = excluded.contract_id,
            title = excluded.title,
            description = excluded.description,
            budget_sats = excluded.budget_sats,
            skills_json = excluded.skills_json,
            status = excluded.status,
            claimed_by = excluded.claimed_by,
            claimed_at = excluded.claimed_at,
            claim_expires_at = excluded.claim_expires_at,
            contractor_wallet = excluded.contractor_wallet,
            merkle_proof_json = excluded.merkle_proof_json,
            proof_status = excluded.proof_status,
            updated_at = excluded.updated_at
        "#,
        params![
            task.task_id,
            task.contract_id,
            task.title,
            task.description,
            task.budget_sats as i64,
            serde_json::to_string(&task.skills)?,
            task.status.as_str(),
            task.claimed_by,
            task.claimed_at,
            task.claim_expires_at,
            task.contractor_wallet,
            proof_json,
            proof_status,
            task.created_at,
            task.updated_at,
        ],
    )?;
    Ok(())
}

fn insert_claim(conn: &Connection, claim: &Claim) -> Result<(), MarketError> {
    conn.execute(
        "INSERT INTO claims (claim_id, task_id, ai_identifier, wallet, status, expires_at, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?)",
        params![
            claim.claim_id,
            claim.task_id,
            claim.ai_identifier,
            claim.wallet,
            claim.status.as_str(),
            claim.expires_at,
            claim.created_at,
        ],
    )?;
    Ok(())
}

fn set_claim_status(conn: &Connection, claim_id: &str, status: ClaimStatus) -> Result<(), MarketError> {
    conn.execute(
        "UPDATE claims SET status = ? WHERE claim_id = ?",
        params![status.as_str(), claim_id],
    )?;
    Ok(())
}

fn save_submission(conn: &Connection, submission: &Submission) -> Result<(), MarketError> {
    conn.execute(
        r#"
        INSERT INTO submissions (
            submission_id, claim_id, task_id, status, deliverables_json, completion_proof_json,
            review_notes, rejection_type, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(submission_id) DO UPDATE SET
            status = excluded.status,
            deliverables_json = excluded.deliverables_json,
            completion_proof_json = excluded.completion_proof_json,
            review_notes = excluded.review_notes,
            rejection_type = excluded.rejection_type,
            updated_at = excluded.updated_at
        "#,
        params![
            submission.submission_id,
            submission.claim_id,
            submission.task_id,
            submission.status.as_str(),
            serde_json::to_string(&submission.deliverables)?,
            serde_json::to_string(&submission.completion_proof)?,
            submission.review_notes,
            submission.rejection_type,
            submission.created_at,
            submission.updated_at,
        ],
    )?;
    Ok(())
}

fn save_proposal(conn: &Connection, proposal: &Proposal) -> Result<(), MarketError> {
    conn.execute(
        r#"
        INSERT INTO proposals (
            id, contract_id, title, description_md, visible_pixel_hash, budget_sats, status,
            tasks_json, metadata_json, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            contract_id = excluded.contract_id,
            title = excluded.title,
            description_md = excluded.description_md,
            visible_pixel_hash = excluded.visible_pixel_hash,
            budget_sats = excluded.budget_sats,
            status = excluded.status,
            tasks_json = excluded.tasks_json,
            metadata_json = excluded.metadata_json,
            updated_at = excluded.updated_at
        "#,
        params![
            proposal.id,
            proposal.contract_id(),
            proposal.title,
            proposal.description_md,
            proposal.visible_pixel_hash,
            proposal.budget_sats as i64,
            proposal.status.as_str(),
            serde_json::to_string(&proposal.tasks)?,
            serde_json::to_string(&proposal.metadata)?,
            proposal.created_at,
            proposal.updated_at,
        ],
    )?;
    Ok(())
}

// ============================================================================
// MarketStore
// ============================================================================

impl MarketStore for SqliteStore {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    fn create_contract(&self, contract: Contract) -> Result<Contract, MarketError> {
        self.with_tx(|conn| {
            if exists(conn, "contracts", "contract_id", &contract.contract_id)? {
                return Err(MarketError::Conflict(format!(
                    "contract {} already exists",
                    contract.contract_id
                )));
            }
            save_contract(conn, &contract)?;
            Ok(contract)
        })
    }

    fn upsert_contract(&self, contract: Contract) -> Result<Contract, MarketError> {
        let now = Utc::now();
        self.with_tx(|conn| {
            let contract = match load_contract(conn, &contract.contract_id)? {
                Some(existing) => rules::merge_contract(&existing, contract, now),
                None => Contract {
                    updated_at: now,
                    ..contract
                },
            };
            save_contract(conn, &contract)?;
            Ok(contract)
        })
    }

    fn get_contract(&self, contract_id: &str) -> Result<Contract, MarketError> {
        let now = Utc::now();
        self.with_conn(|conn| {
            let mut contract = load_contract(conn, contract_id)?
                .ok_or_else(|| MarketError::ContractNotFound(contract_id.to_string()))?;
            let tasks = load_tasks_for(conn, contract_id)?;
            rules::refresh_task_counts(&mut contract, &tasks, now);
            Ok(contract)
        })
    }

    fn list_contracts(&self, filter: &ContractFilter) -> Result<Vec<Contract>, MarketError> {
        let now = Utc::now();
        let sql = format!("SELECT {} FROM contracts ORDER BY contract_id", CONTRACT_COLUMNS);
        let (contracts, counts) = self.with_conn(|conn| {
            Ok((
                query_rows(conn, &sql, [], contract_from_row)?,
                open_task_counts(conn, now)?,
            ))
        })?;
        let iter = contracts
            .into_iter()
            .filter(|c| filter.matches(c))
            .map(|mut c| {
                c.available_tasks_count = counts.get(&c.contract_id).copied().unwrap_or(0);
                c
            });
        Ok(match filter.limit {
            Some(limit) => iter.take(limit).collect(),
            None => iter.collect(),
        })
    }

    fn create_task(&self, task: Task) -> Result<Task, MarketError> {
        self.with_tx(|conn| {
            if exists(conn, "tasks", "task_id", &task.task_id)? {
                return Err(MarketError::Conflict(format!("task {} already exists", task.task_id)));
            }
            save_task(conn, &task)?;
            Ok(task)
        })
    }

    fn get_task(&self, task_id: &str) -> Result<Task, MarketError> {
        let now = Utc::now();
        self.with_conn(|conn| load_task(conn, task_id))
            .map(|t| t.as_seen_at(now))
    }

    fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, MarketError> {
        let now = Utc::now();
        // Status is filtered after lazy expiry, so only the stable columns go to SQL
        let sql = format!(
            "SELECT {} FROM tasks \
             WHERE (?1 IS NULL OR contract_id = ?1) AND (?2 IS NULL OR proof_status = ?2) \
             ORDER BY task_id",
            TASK_COLUMNS
        );
        let proof_status = filter.proof_status.map(|s| s.as_str());
        let tasks = self.with_conn(|conn| {
            query_rows(conn, &sql, params![filter.contract_id, proof_status], task_from_row)
        })?;
        let tasks = tasks
            .into_iter()
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
        let outcome = self.with_tx(|conn| {
            let mut task = load_task(conn, task_id)?;
            let claims = load_claims_for(conn, task_id)?;

            match rules::decide_claim(&task, &claims, agent_id, now)? {
                ClaimDecision::Reuse(claim) => Ok(ClaimOutcome { claim, reused: true }),
                ClaimDecision::Create { lapsed } => {
                    for claim_id in &lapsed {
                        set_claim_status(conn, claim_id, ClaimStatus::Expired)?;
                    }
                    let claim = rules::new_claim(task_id, agent_id, wallet, self.lease_ttl, now)?;
                    insert_claim(conn, &claim)?;
                    rules::apply_claim(&mut task, &claim);
                    save_task(conn, &task)?;
                    Ok(ClaimOutcome { claim, reused: false })
                }
            }
        })?;

        if outcome.reused {
            debug!(task_id, agent_id, claim_id = %outcome.claim.claim_id, "Reusing live claim");
        } else {
            info!(task_id, agent_id, claim_id = %outcome.claim.claim_id, "Task claimed");
        }
        Ok(outcome)
    }

    fn get_claim(&self, claim_id: &str) -> Result<Claim, MarketError> {
        self.with_conn(|conn| load_claim(conn, claim_id))
    }

    fn list_claims(&self, task_id: &str) -> Result<Vec<Claim>, MarketError> {
        self.with_conn(|conn| load_claims_for(conn, task_id))
    }

    fn submit_work(
        &self,
        claim_id: &str,
        deliverables: Map<String, Value>,
        completion_proof: Value,
    ) -> Result<Submission, MarketError> {
        let now = Utc::now();

        // The expiry mark must survive the failed call, so it commits on its own
        let expired = self.with_tx(|conn| {
            let mut claim = load_claim(conn, claim_id)?;
            if rules::check_submittable(&claim, now)? == SubmitCheck::Accept {
                return Ok(false);
            }
            let mut task = load_task(conn, &claim.task_id).ok();
            rules::expire_claim(&mut claim, task.as_mut(), now);
            set_claim_status(conn, claim_id, claim.status)?;
            if let Some(task) = &task {
                save_task(conn, task)?;
            }
            Ok(true)
        })?;
        if expired {
            info!(claim_id, "Claim expired before submission");
            return Err(MarketError::ClaimExpired(claim_id.to_string()));
        }

        let submission = self.with_tx(|conn| {
            let claim = load_claim(conn, claim_id)?;
            if rules::check_submittable(&claim, now)? == SubmitCheck::Expired {
                return Err(MarketError::ClaimExpired(claim_id.to_string()));
            }
            let mut task = load_task(conn, &claim.task_id)?;

            let submission = rules::new_submission(&claim, deliverables, completion_proof, now);
            save_submission(conn, &submission)?;
            set_claim_status(conn, claim_id, ClaimStatus::Submitted)?;
            task.status = TaskStatus::Submitted;
            task.updated_at = now;
            save_task(conn, &task)?;
            Ok(submission)
        })?;

        info!(claim_id, submission_id = %submission.submission_id, "Work submitted");
        Ok(submission)
    }

    fn get_submission(&self, submission_id: &str) -> Result<Submission, MarketError> {
        self.with_conn(|conn| load_submission(conn, submission_id))
    }

    fn list_submissions(&self, task_ids: &[String]) -> Result<Vec<Submission>, MarketError> {
        self.with_conn(|conn| load_submissions_for(conn, task_ids))
    }

    fn update_submission_status(
        &self,
        submission_id: &str,
        action: ReviewAction,
        notes: Option<&str>,
        rejection_type: Option<&str>,
    ) -> Result<Submission, MarketError> {
        let now = Utc::now();
        let submission = self.with_tx(|conn| {
            let mut submission = load_submission(conn, submission_id)?;
            let effect = rules::apply_review(&mut submission, action, notes, rejection_type, now);
            save_submission(conn, &submission)?;

            if let Some(mut task) = find_task(conn, &submission.task_id)? {
                rules::apply_task_effect(&mut task, effect, now);
                save_task(conn, &task)?;
            }
            Ok(submission)
        })?;

        debug!(submission_id, status = %submission.status, "Submission status updated");
        Ok(submission)
    }

    fn get_task_proof(&self, task_id: &str) -> Result<Option<MerkleProof>, MarketError> {
        self.with_conn(|conn| load_task(conn, task_id).map(|t| t.merkle_proof))
    }

    fn update_task_proof(&self, task_id: &str, proof: MerkleProof) -> Result<(), MarketError> {
        self.with_tx(|conn| {
            let mut task = load_task(conn, task_id)?;
            task.merkle_proof = Some(proof);
            if task.status == TaskStatus::Unverified {
                task.status = TaskStatus::Available;
            }
            task.updated_at = Utc::now();
            save_task(conn, &task)
        })
    }

    fn create_proposal(&self, proposal: Proposal) -> Result<Proposal, MarketError> {
        let proposal = rules::prepare_proposal(proposal, Utc::now())?;
        self.with_tx(|conn| {
            if exists(conn, "proposals", "id", &proposal.id)? {
                return Err(MarketError::Conflict(format!("proposal {} already exists", proposal.id)));
            }
            save_proposal(conn, &proposal)?;
            Ok(proposal)
        })
    }

    fn upsert_proposal(&self, proposal: Proposal) -> Result<ProposalOutcome, MarketError> {
        let proposal = rules::prepare_proposal(proposal, Utc::now())?;
        self.with_tx(|conn| {
            let proposal = match find_proposal(conn, &proposal.id)? {
                Some(existing) => match rules::merge_proposal(&existing, proposal) {
                    Some(merged) => merged,
                    None => {
                        return Ok(ProposalOutcome {
                            proposal: existing,
                            changed: false,
                        })
                    }
                },
                None => proposal,
            };
            save_proposal(conn, &proposal)?;
            Ok(ProposalOutcome {
                proposal,
                changed: true,
            })
        })
    }

    fn get_proposal(&self, id: &str) -> Result<Proposal, MarketError> {
        self.with_conn(|conn| load_proposal(conn, id))
    }

    fn list_proposals(&self, filter: &ProposalFilter) -> Result<Vec<Proposal>, MarketError> {
        let sql = format!(
            "SELECT {} FROM proposals \
             WHERE (?1 IS NULL OR status = ?1) AND (?2 IS NULL OR contract_id = ?2) \
             ORDER BY id",
            PROPOSAL_COLUMNS
        );
        let status = filter.status.map(|s| s.as_str());
        let proposals = self.with_conn(|conn| {
            query_rows(conn, &sql, params![status, filter.contract_id], proposal_from_row)
        })?;
        Ok(match filter.limit {
            Some(limit) => proposals.into_iter().take(limit).collect(),
            None => proposals,
        })
    }

    fn approve_proposal(
        &self,
        id: &str,
        approver_key_hash: Option<&str>,
    ) -> Result<ProposalOutcome, MarketError> {
        let now = Utc::now();
        let outcome = self.with_tx(|conn| {
            let mut proposal = load_proposal(conn, id)?;
            let contract_id = proposal.contract_id().to_string();
            let wish = load_contract(conn, &contract_id)?;

            rules::authorize_approval(&proposal, wish.as_ref(), approver_key_hash)?;
            let siblings = load_siblings(conn, &contract_id)?;
            if rules::decide_approval(&proposal, &siblings)? == ApprovalDecision::AlreadyApproved {
                return Ok(ProposalOutcome {
                    proposal,
                    changed: false,
                });
            }

            let mut existing_ids = HashSet::new();
            for task in &proposal.tasks {
                if exists(conn, "tasks", "task_id", &task.task_id)? {
                    existing_ids.insert(task.task_id.clone());
                }
            }
            for task in rules::materialize_tasks(&proposal, &existing_ids, now) {
                save_task(conn, &task)?;
            }
            let contract_tasks = load_tasks_for(conn, &contract_id)?;
            let contract = rules::activate_contract(wish, &proposal, &contract_tasks, now);
            save_contract(conn, &contract)?;

            proposal.status = ProposalStatus::Approved;
            proposal.updated_at = now;
            save_proposal(conn, &proposal)?;
            Ok(ProposalOutcome {
                proposal,
                changed: true,
            })
        })?;

        if outcome.changed {
            info!(proposal_id = id, contract_id = %outcome.proposal.contract_id(), "Proposal approved");
        }
        Ok(outcome)
    }

    fn publish_proposal(&self, id: &str) -> Result<Proposal, MarketError> {
        let now = Utc::now();
        let published = self.with_tx(|conn| {
            let mut proposal = load_proposal(conn, id)?;
            let contract_id = proposal.contract_id().to_string();
            let tasks = load_tasks_for(conn, &contract_id)?;
            let task_ids: Vec<String> = tasks.iter().map(|t| t.task_id.clone()).collect();
            let submissions = load_submissions_for(conn, &task_ids)?;

            rules::check_publish_ready(&proposal, &tasks, &submissions)?;

            for mut task in tasks {
                task.status = TaskStatus::Published;
                task.updated_at = now;
                save_task(conn, &task)?;
            }
            if let Some(mut contract) = load_contract(conn, &contract_id)? {
                contract.status = ContractStatus::Completed;
                contract.available_tasks_count = 0;
                contract.updated_at = now;
                save_contract(conn, &contract)?;
            }

            proposal.status = ProposalStatus::Published;
            proposal.updated_at = now;
            save_proposal(conn, &proposal)?;
            Ok(proposal)
        })?;

        info!(proposal_id = id, contract_id = %published.contract_id(), "Proposal published");
        Ok(published)
    }
}
