//! SQLite schema for the durable store

use rusqlite::Connection;
use tracing::info;

use crate::error::MarketError;

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> Result<(), MarketError> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        info!("Creating new marketplace schema v{}", SCHEMA_VERSION);
        conn.execute_batch(MARKET_SCHEMA)
            .map_err(|e| MarketError::Internal(format!("Failed to create tables: {}", e)))?;
        conn.execute_batch(INDEXES_SCHEMA)
            .map_err(|e| MarketError::Internal(format!("Failed to create indexes: {}", e)))?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if current_version < SCHEMA_VERSION {
        info!("Migrating schema from v{} to v{}", current_version, SCHEMA_VERSION);
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else {
        info!("Marketplace schema is up to date (v{})", current_version);
    }

    Ok(())
}

/// Get current schema version (0 if not initialized)
fn get_schema_version(conn: &Connection) -> Result<i32, MarketError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        [],
    )
    .map_err(|e| MarketError::Internal(format!("Failed to create schema_version table: {}", e)))?;

    let version: i32 = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
        .unwrap_or(0);

    Ok(version)
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<(), MarketError> {
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?)", [version])?;
    Ok(())
}

const MARKET_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS contracts (
    contract_id TEXT PRIMARY KEY NOT NULL,
    title TEXT NOT NULL,
    total_budget_sats INTEGER NOT NULL DEFAULT 0,
    goals_count INTEGER NOT NULL DEFAULT 0,
    available_tasks_count INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'pending',
    skills_json TEXT NOT NULL DEFAULT '[]',
    creator_api_key_hash TEXT,
    funding_address TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS tasks (
    task_id TEXT PRIMARY KEY NOT NULL,
    contract_id TEXT NOT NULL,
    title TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    budget_sats INTEGER NOT NULL DEFAULT 0,
    skills_json TEXT NOT NULL DEFAULT '[]',
    status TEXT NOT NULL DEFAULT 'available',

    -- Lease mirror of the active claim
    claimed_by TEXT,
    claimed_at TEXT,
    claim_expires_at TEXT,
    contractor_wallet TEXT,

    -- Embedded funding proof (NULL when none recorded)
    merkle_proof_json TEXT,
    proof_status TEXT,

    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- Lease history; terminal rows are kept for audit
CREATE TABLE IF NOT EXISTS claims (
    claim_id TEXT PRIMARY KEY NOT NULL,
    task_id TEXT NOT NULL,
    ai_identifier TEXT NOT NULL,
    wallet TEXT,
    status TEXT NOT NULL DEFAULT 'active',
    expires_at TEXT NOT NULL,
    created_at TEXT NOT NULL,
    FOREIGN KEY (task_id) REFERENCES tasks(task_id)
);

CREATE TABLE IF NOT EXISTS submissions (
    submission_id TEXT PRIMARY KEY NOT NULL,
    claim_id TEXT NOT NULL,
    task_id TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending_review',
    deliverables_json TEXT NOT NULL DEFAULT '{}',
    completion_proof_json TEXT NOT NULL DEFAULT 'null',
    review_notes TEXT,
    rejection_type TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    FOREIGN KEY (claim_id) REFERENCES claims(claim_id)
);

CREATE TABLE IF NOT EXISTS proposals (
    id TEXT PRIMARY KEY NOT NULL,
    contract_id TEXT NOT NULL,
    title TEXT NOT NULL,
    description_md TEXT NOT NULL DEFAULT '',
    visible_pixel_hash TEXT,
    budget_sats INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'pending',
    tasks_json TEXT NOT NULL DEFAULT '[]',
    metadata_json TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

const INDEXES_SCHEMA: &str = r#"
CREATE INDEX IF NOT EXISTS idx_tasks_contract ON tasks(contract_id);
CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
CREATE INDEX IF NOT EXISTS idx_tasks_proof_status ON tasks(proof_status);
CREATE INDEX IF NOT EXISTS idx_claims_task ON claims(task_id, status);
CREATE INDEX IF NOT EXISTS idx_submissions_task ON submissions(task_id);
CREATE INDEX IF NOT EXISTS idx_submissions_claim ON submissions(claim_id);
CREATE INDEX IF NOT EXISTS idx_proposals_contract ON proposals(contract_id, status);
CREATE INDEX IF NOT EXISTS idx_contracts_status ON contracts(status);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_schema_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap();

        let version: i32 = conn
            .query_row("SELECT version FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);

        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN \
                 ('contracts', 'tasks', 'claims', 'submissions', 'proposals')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 5);
    }
}
