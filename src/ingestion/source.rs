//! Ingestion record sources

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info};

use crate::error::MarketError;
use crate::models::IngestionStatus;

use super::{IngestionRecord, IngestionSource};

// ============================================================================
// In-memory
// ============================================================================

/// Vec-backed source for tests and embedding
#[derive(Default)]
pub struct MemoryIngestionSource {
    records: Mutex<Vec<IngestionRecord>>,
}

impl MemoryIngestionSource {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Vec<IngestionRecord>>, MarketError> {
        self.records
            .lock()
            .map_err(|e| MarketError::Internal(format!("Lock poisoned: {}", e)))
    }

    pub fn push(&self, record: IngestionRecord) -> Result<(), MarketError> {
        self.lock()?.push(record);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<IngestionRecord>, MarketError> {
        Ok(self.lock()?.iter().find(|r| r.id == id).cloned())
    }
}

#[async_trait]
impl IngestionSource for MemoryIngestionSource {
    async fn list_recent(
        &self,
        status: IngestionStatus,
        limit: usize,
    ) -> Result<Vec<IngestionRecord>, MarketError> {
        let mut matching: Vec<IngestionRecord> = self
            .lock()?
            .iter()
            .filter(|r| r.status == status)
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        matching.truncate(limit);
        Ok(matching)
    }

    async fn update_status_with_note(
        &self,
        id: &str,
        status: IngestionStatus,
        note: &str,
    ) -> Result<(), MarketError> {
        let mut records = self.lock()?;
        let record = records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| MarketError::Ingestion(format!("record not found: {}", id)))?;
        record.status = status;
        record.note = Some(note.to_string());
        Ok(())
    }
}

// ============================================================================
// SQLite
// ============================================================================

const INGESTION_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS ingestion_records (
    id TEXT PRIMARY KEY,
    status TEXT NOT NULL DEFAULT 'pending',
    payload TEXT NOT NULL,
    image_base64 TEXT,
    creator_api_key_hash TEXT,
    note TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_ingestion_status_created
    ON ingestion_records(status, created_at);
"#;

/// Queue of pending records in its own SQLite file
pub struct SqliteIngestionSource {
    conn: Mutex<Connection>,
}

impl SqliteIngestionSource {
    pub fn open(db_path: &Path) -> Result<Self, MarketError> {
        info!("Opening ingestion database at {:?}", db_path);

        let conn = Connection::open(db_path)
            .map_err(|e| MarketError::Internal(format!("Failed to open SQLite: {}", e)))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .map_err(|e| MarketError::Internal(format!("Failed to set PRAGMA: {}", e)))?;

        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, MarketError> {
        debug!("Opening in-memory ingestion database");
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, MarketError> {
        conn.execute_batch(INGESTION_SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, MarketError> {
        self.conn
            .lock()
            .map_err(|e| MarketError::Internal(format!("Lock poisoned: {}", e)))
    }

    /// Queue a new pending record
    pub fn enqueue(&self, record: &IngestionRecord) -> Result<(), MarketError> {
        let now = Utc::now();
        self.lock()?.execute(
            "INSERT INTO ingestion_records
                (id, status, payload, image_base64, creator_api_key_hash, note, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.id,
                record.status.as_str(),
                record.payload,
                record.image_base64,
                record.creator_api_key_hash,
                record.note,
                record.created_at,
                now,
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<IngestionRecord>, MarketError> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT id, status, payload, image_base64, creator_api_key_hash, note, created_at
                 FROM ingestion_records WHERE id = ?1",
                params![id],
                raw_from_row,
            )
            .optional()?;
        row.map(RawRecord::into_record).transpose()
    }
}

/// Columns as read, before the status text is parsed
struct RawRecord {
    id: String,
    status: String,
    payload: String,
    image_base64: Option<String>,
    creator_api_key_hash: Option<String>,
    note: Option<String>,
    created_at: chrono::DateTime<Utc>,
}

impl RawRecord {
    fn into_record(self) -> Result<IngestionRecord, MarketError> {
        Ok(IngestionRecord {
            id: self.id,
            status: self.status.parse()?,
            payload: self.payload,
            image_base64: self.image_base64,
            creator_api_key_hash: self.creator_api_key_hash,
            note: self.note,
            created_at: self.created_at,
        })
    }
}

fn raw_from_row(row: &Row) -> Result<RawRecord, rusqlite::Error> {
    Ok(RawRecord {
        id: row.get(0)?,
        status: row.get(1)?,
        payload: row.get(2)?,
        image_base64: row.get(3)?,
        creator_api_key_hash: row.get(4)?,
        note: row.get(5)?,
        created_at: row.get(6)?,
    })
}

#[async_trait]
impl IngestionSource for SqliteIngestionSource {
    async fn list_recent(
        &self,
        status: IngestionStatus,
        limit: usize,
    ) -> Result<Vec<IngestionRecord>, MarketError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, status, payload, image_base64, creator_api_key_hash, note, created_at
             FROM ingestion_records
             WHERE status = ?1
             ORDER BY created_at DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![status.as_str(), limit as i64], raw_from_row)?;

        let mut records = Vec::new();
        for raw in rows {
            records.push(raw?.into_record()?);
        }
        Ok(records)
    }

    async fn update_status_with_note(
        &self,
        id: &str,
        status: IngestionStatus,
        note: &str,
    ) -> Result<(), MarketError> {
        let updated = self.lock()?.execute(
            "UPDATE ingestion_records SET status = ?2, note = ?3, updated_at = ?4 WHERE id = ?1",
            params![id, status.as_str(), note, Utc::now()],
        )?;
        if updated == 0 {
            return Err(MarketError::Ingestion(format!("record not found: {}", id)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_memory_source_lists_by_status() {
        let source = MemoryIngestionSource::new();
        let mut old = IngestionRecord::new("old", "a");
        old.created_at = Utc::now() - Duration::minutes(5);
        source.push(old).unwrap();
        source.push(IngestionRecord::new("new", "b")).unwrap();

        let pending = source.list_recent(IngestionStatus::Pending, 10).await.unwrap();
        assert_eq!(pending.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(), ["new", "old"]);

        source
            .update_status_with_note("old", IngestionStatus::Invalid, "bad")
            .await
            .unwrap();
        assert_eq!(source.list_recent(IngestionStatus::Pending, 10).await.unwrap().len(), 1);
        assert_eq!(source.get("old").unwrap().unwrap().note.as_deref(), Some("bad"));
    }

    #[tokio::test]
    async fn test_sqlite_source_round_trip() {
        let dir = TempDir::new().unwrap();
        let source = SqliteIngestionSource::open(&dir.path().join("ingestion.db")).unwrap();

        let mut record = IngestionRecord::new("rec-1", "# Wish");
        record.creator_api_key_hash = Some("creator".into());
        source.enqueue(&record).unwrap();
        source.enqueue(&IngestionRecord::new("rec-2", "# Other")).unwrap();

        let pending = source.list_recent(IngestionStatus::Pending, 1).await.unwrap();
        assert_eq!(pending.len(), 1);

        source
            .update_status_with_note("rec-1", IngestionStatus::Verified, "ok")
            .await
            .unwrap();
        let stored = source.get("rec-1").unwrap().unwrap();
        assert_eq!(stored.status, IngestionStatus::Verified);
        assert_eq!(stored.note.as_deref(), Some("ok"));
        assert_eq!(stored.creator_api_key_hash.as_deref(), Some("creator"));

        assert!(source
            .update_status_with_note("missing", IngestionStatus::Invalid, "x")
            .await
            .is_err());
    }
}
