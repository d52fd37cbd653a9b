//! Chunk ledger
//!
//! Persistent record of which byte ranges of which remote objects are
//! present in the local download area, backed by SQLite.

use std::path::Path;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{Error, Result};

/// Ledger database file name inside the state directory
pub const LEDGER_DB: &str = "chunks.db";

/// Rows written per transaction
pub const INSERT_BATCH: usize = 750;

/// Status recorded for chunks copied into the read cache
pub const STATUS_DOWNLOADING: &str = "downloading";

/// Ledger key for a chunk: `objectId-start-end`
pub fn chunk_key(object_id: &str, start: u64, end: u64) -> String {
    format!("{}-{}-{}", object_id, start, end)
}

/// One cached byte range `[start, end]` of a remote object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkEntry {
    pub key: String,
    pub object_id: String,
    pub start: u64,
    pub end: u64,
    /// Insert time, milliseconds since the epoch
    pub inserted_at: i64,
    pub status: String,
    pub size: u64,
}

impl ChunkEntry {
    /// A freshly cached chunk
    pub fn new(object_id: &str, start: u64, end: u64) -> Self {
        Self {
            key: chunk_key(object_id, start, end),
            object_id: object_id.to_string(),
            start,
            end,
            inserted_at: Utc::now().timestamp_millis(),
            status: STATUS_DOWNLOADING.to_string(),
            size: end - start + 1,
        }
    }
}

/// Aggregate ledger figures
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedgerTotals {
    pub chunks: u64,
    pub bytes: u64,
}

/// SQLite-backed chunk ledger
pub struct ChunkLedger {
    conn: Mutex<Connection>,
}

impl ChunkLedger {
    /// Create or open the ledger database
    pub fn open(state_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(state_dir)?;

        let conn = Connection::open(state_dir.join(LEDGER_DB))?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS chunks (
                name TEXT PRIMARY KEY,
                object_id TEXT NOT NULL,
                start INTEGER NOT NULL,
                "end" INTEGER NOT NULL,
                atime INTEGER NOT NULL,
                status TEXT NOT NULL,
                size INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_chunks_object
                ON chunks(object_id);
            "#,
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Record chunks, committing every [`INSERT_BATCH`] rows
    pub async fn insert_batch(&self, entries: &[ChunkEntry]) -> Result<usize> {
        let mut conn = self.conn.lock().await;
        let mut written = 0;

        for batch in entries.chunks(INSERT_BATCH) {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    r#"
                    INSERT OR REPLACE INTO chunks (name, object_id, start, "end", atime, status, size)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                    "#,
                )?;
                for entry in batch {
                    stmt.execute(params![
                        entry.key,
                        entry.object_id,
                        entry.start as i64,
                        entry.end as i64,
                        entry.inserted_at,
                        entry.status,
                        entry.size as i64,
                    ])?;
                }
            }
            tx.commit()?;
            written += batch.len();
            debug!("Recorded {} chunk rows", batch.len());
        }

        Ok(written)
    }

    /// Check whether a chunk is recorded
    pub async fn contains(&self, key: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let found: Option<i64> = conn
            .query_row("SELECT 1 FROM chunks WHERE name = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(found.is_some())
    }

    /// Refresh a chunk's access time after a cache hit
    pub async fn touch(&self, key: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE chunks SET atime = ?1 WHERE name = ?2",
            params![Utc::now().timestamp_millis(), key],
        )?;
        Ok(())
    }

    /// Sum of recorded chunk sizes for an object
    pub async fn total_size(&self, object_id: &str) -> Result<u64> {
        let conn = self.conn.lock().await;
        let total: i64 = conn.query_row(
            "SELECT COALESCE(SUM(size), 0) FROM chunks WHERE object_id = ?1",
            params![object_id],
            |row| row.get(0),
        )?;
        Ok(total as u64)
    }

    /// All chunks recorded for an object, in offset order
    pub async fn entries(&self, object_id: &str) -> Result<Vec<ChunkEntry>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            r#"
            SELECT name, object_id, start, "end", atime, status, size
            FROM chunks WHERE object_id = ?1 ORDER BY start
            "#,
        )?;

        let rows = stmt.query_map(params![object_id], |row| {
            Ok(ChunkEntry {
                key: row.get(0)?,
                object_id: row.get(1)?,
                start: row.get::<_, i64>(2)? as u64,
                end: row.get::<_, i64>(3)? as u64,
                inserted_at: row.get(4)?,
                status: row.get(5)?,
                size: row.get::<_, i64>(6)? as u64,
            })
        })?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    /// Forget every chunk of an object; returns the removed rows
    pub async fn remove_object(&self, object_id: &str) -> Result<Vec<String>> {
        let keys: Vec<String> = self
            .entries(object_id)
            .await?
            .into_iter()
            .map(|e| e.key)
            .collect();

        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM chunks WHERE object_id = ?1", params![object_id])?;
        Ok(keys)
    }

    /// Totals across the whole ledger
    pub async fn totals(&self) -> Result<LedgerTotals> {
        let conn = self.conn.lock().await;
        let (chunks, bytes): (i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(size), 0) FROM chunks",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(LedgerTotals {
            chunks: chunks as u64,
            bytes: bytes as u64,
        })
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Ledger(e.to_string())
    }
}
