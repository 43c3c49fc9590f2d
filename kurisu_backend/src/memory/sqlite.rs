use std::path::Path;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use uuid::Uuid;

use super::{MemoryChain, MemoryRecord, MemoryStore};
use crate::error::MemoryStoreError;

/// Local memory store: canonical `memories` table plus an FTS5 index ranked by bm25.
pub struct SqliteMemoryStore {
    conn: Mutex<Connection>,
    assistant_name: String,
    context_limit: usize,
    max_distance: f64,
}

impl SqliteMemoryStore {
    /// Create or open the database
    pub fn open<P: AsRef<Path>>(
        path: P,
        assistant_name: impl Into<String>,
        context_limit: usize,
        max_distance: f64,
    ) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn, assistant_name, context_limit, max_distance)
    }

    pub fn in_memory(
        assistant_name: impl Into<String>,
        context_limit: usize,
        max_distance: f64,
    ) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::with_connection(conn, assistant_name, context_limit, max_distance)
    }

    fn with_connection(
        conn: Connection,
        assistant_name: impl Into<String>,
        context_limit: usize,
        max_distance: f64,
    ) -> Result<Self> {
        ensure_memory_tables(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            assistant_name: assistant_name.into(),
            context_limit: context_limit.max(1),
            max_distance,
        })
    }

    /// Helper to lock the connection
    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>, MemoryStoreError> {
        self.conn
            .lock()
            .map_err(|e| MemoryStoreError::Storage(format!("Database lock poisoned: {}", e)))
    }
}

fn insert(conn: &Connection, record: &MemoryRecord) -> Result<bool, MemoryStoreError> {
    let uuid = record
        .uuid
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let inserted = conn.execute(
        "INSERT OR IGNORE INTO memories (uuid, from_name, message, time)
         VALUES (?1, ?2, ?3, ?4)",
        params![uuid, record.from_name, record.message, record.time.to_rfc3339()],
    )?;
    if inserted == 0 {
        return Ok(false);
    }

    // Keep the FTS index in sync for context retrieval.
    conn.execute(
        "INSERT INTO memories_fts (uuid, message) VALUES (?1, ?2)",
        params![uuid, record.message],
    )?;
    Ok(true)
}

#[async_trait]
impl MemoryStore for SqliteMemoryStore {
    async fn connect(&self) -> Result<(), MemoryStoreError> {
        let conn = self.lock_conn()?;
        conn.query_row("SELECT COUNT(*) FROM memories", [], |row| row.get::<_, i64>(0))
            .map(|count| tracing::info!("Memory database ready with {} record(s)", count))
            .map_err(MemoryStoreError::from)
    }

    async fn close(&self) {
        tracing::debug!("Memory database closed");
    }

    async fn add_memories(&self, chain: &MemoryChain) -> Result<(), MemoryStoreError> {
        if let Some(empty) = chain.iter().find(|record| record.message.trim().is_empty()) {
            return Err(MemoryStoreError::InvalidRecord(format!(
                "empty message from {}",
                empty.from_name
            )));
        }

        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        for record in chain.iter() {
            if !insert(&tx, record)? {
                tracing::warn!(
                    "Skipping duplicate memory from {} at {}",
                    record.from_name,
                    record.time
                );
            }
        }
        tx.commit()?;
        Ok(())
    }

    async fn get_context(&self, query: &str) -> Result<MemoryChain, MemoryStoreError> {
        let Some(match_expr) = fts_match_expression(query) else {
            return Ok(MemoryChain::default());
        };

        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT m.uuid, m.from_name, m.message, m.time, bm25(memories_fts) AS rank
             FROM memories_fts
             JOIN memories m ON m.uuid = memories_fts.uuid
             WHERE memories_fts MATCH ?1 AND m.from_name != ?2
             ORDER BY rank
             LIMIT ?3",
        )?;

        let rows = stmt
            .query_map(
                params![match_expr, self.assistant_name, self.context_limit as i64],
                |row| {
                    let record = MemoryRecord {
                        uuid: Some(row.get(0)?),
                        from_name: row.get(1)?,
                        message: row.get(2)?,
                        time: parse_rfc3339(row.get::<_, String>(3)?, 3)?,
                        distance: None,
                        certainty: None,
                        score: None,
                    };
                    // bm25 is lower-is-better; flip it so higher scores rank first.
                    Ok((record, -row.get::<_, f64>(4)?))
                },
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(rank_results(rows, self.max_distance))
    }

    async fn get_chat_memory(&self, limit: usize) -> Result<MemoryChain, MemoryStoreError> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT uuid, from_name, message, time
             FROM memories
             ORDER BY time DESC, id DESC
             LIMIT ?1",
        )?;

        let mut records = stmt
            .query_map([limit as i64], |row| {
                Ok(MemoryRecord {
                    uuid: Some(row.get(0)?),
                    from_name: row.get(1)?,
                    message: row.get(2)?,
                    time: parse_rfc3339(row.get::<_, String>(3)?, 3)?,
                    distance: None,
                    certainty: None,
                    score: None,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        records.reverse();
        Ok(MemoryChain::new(records))
    }

    async fn delete_memory(&self, uuid: &str) -> Result<bool, MemoryStoreError> {
        let conn = self.lock_conn()?;
        let deleted = conn.execute("DELETE FROM memories WHERE uuid = ?1", [uuid])?;
        conn.execute("DELETE FROM memories_fts WHERE uuid = ?1", [uuid])?;
        Ok(deleted > 0)
    }
}

/// Normalize scores against the best hit: distance 0 for the best match,
/// approaching 1 for the weakest.
fn rank_results(rows: Vec<(MemoryRecord, f64)>, max_distance: f64) -> MemoryChain {
    let best = rows
        .iter()
        .map(|(_, score)| *score)
        .fold(f64::NEG_INFINITY, f64::max);

    let records = rows
        .into_iter()
        .map(|(mut record, score)| {
            let distance = if best > 0.0 {
                (1.0 - score / best).clamp(0.0, 1.0)
            } else {
                0.0
            };
            record.score = Some(score);
            record.distance = Some(distance);
            record.certainty = Some(1.0 - distance);
            record
        })
        .filter(|record| record.distance.unwrap_or(0.0) <= max_distance)
        .collect();

    MemoryChain::new(records)
}

/// Quote every word so user text can never be parsed as FTS5 syntax.
fn fts_match_expression(query: &str) -> Option<String> {
    let terms: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(|word| format!("\"{}\"", word.to_lowercase()))
        .collect();

    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}

fn ensure_memory_tables(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"CREATE TABLE IF NOT EXISTS memories (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            uuid TEXT NOT NULL UNIQUE,
            from_name TEXT NOT NULL,
            message TEXT NOT NULL,
            time TEXT NOT NULL,
            UNIQUE(from_name, message, time)
        )"#,
        [],
    )?;

    conn.execute(
        r#"CREATE VIRTUAL TABLE IF NOT EXISTS memories_fts
            USING fts5(uuid UNINDEXED, message)"#,
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_memories_time ON memories(time DESC)",
        [],
    )?;
    Ok(())
}

fn parse_rfc3339(
    value: String,
    column: usize,
) -> std::result::Result<DateTime<Utc>, rusqlite::Error> {
    value.parse().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
    })
}
