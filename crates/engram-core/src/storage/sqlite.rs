//! SQLite Event Store
//!
//! Durable append-only event log with idempotent ingestion, the embedding
//! outbox, FTS5 keyword search, sessions, memory levels, the access log,
//! and the endless-mode tables.
//!
//! Uses separate reader/writer connections for interior mutability. All
//! methods take `&self`, making the store `Send + Sync` so callers can use
//! `Arc<EventStore>` without an outer mutex. WAL mode gives one writer and
//! many concurrent readers per database file.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OpenFlags, OptionalExtension, params};
use uuid::Uuid;

use crate::canonical::{KeyContext, canonical_key, dedupe_key};
use crate::events::{
    AppendInput, AppendResult, ConsolidatedMemory, Event, EventType, Insight, InsightKind,
    MemoryLevel, OutboxJob, OutboxStatus, Session, SessionUpdate, WorkingSetItem,
};

use super::migrations;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Event store error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    /// Storage unavailable (cannot open or lock the database)
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
    /// Database was written by a newer engine version
    #[error("Schema version mismatch: found v{found}, supported up to v{supported}")]
    SchemaVersionMismatch { found: u32, supported: u32 },
    /// Unique constraint collision (converted to a duplicate result on append)
    #[error("Conflict: {0}")]
    Conflict(String),
    /// Row not found
    #[error("Not found: {0}")]
    NotFound(String),
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Event store result type
pub type Result<T> = std::result::Result<T, StoreError>;

// ============================================================================
// SUPPORT TYPES
// ============================================================================

/// Aggregated access-log figures for one event
#[derive(Debug, Clone, Default)]
pub struct AccessStats {
    /// Total recorded accesses
    pub access_count: i64,
    /// Most recent access
    pub last_accessed: Option<DateTime<Utc>>,
    /// Distinct accessing sessions, excluding the event's origin session
    pub cross_session_refs: i64,
    /// Highest match confidence observed
    pub confidence: f64,
}

/// Store-wide counters; the outbox backlog here is the backpressure signal
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub events: i64,
    pub sessions: i64,
    pub insights: i64,
    pub working_set: i64,
    pub consolidated: i64,
    pub levels: Vec<(MemoryLevel, i64)>,
    pub outbox_pending: i64,
    pub outbox_processing: i64,
    pub outbox_failed: i64,
    pub db_size_bytes: u64,
}

// ============================================================================
// EVENT STORE
// ============================================================================

/// The append-only event store
pub struct EventStore {
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
    path: PathBuf,
    max_retries: i64,
}

impl EventStore {
    /// Apply PRAGMAs to a connection
    fn configure_connection(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA cache_size = -64000;
             PRAGMA temp_store = MEMORY;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        Ok(())
    }

    /// Open (creating if necessary) the store at `db_path`
    pub fn open(db_path: &Path, max_retries: i64) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let _ = std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700));
            }
        }

        let writer_conn = Connection::open(db_path)
            .map_err(|e| StoreError::Unavailable(format!("{}: {}", db_path.display(), e)))?;

        #[cfg(unix)]
        if db_path.exists() {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(db_path, std::fs::Permissions::from_mode(0o600));
        }

        Self::configure_connection(&writer_conn)?;

        let found = migrations::get_current_version(&writer_conn)?;
        let supported = migrations::MIGRATIONS.last().map(|m| m.version).unwrap_or(0);
        if found > supported {
            return Err(StoreError::SchemaVersionMismatch { found, supported });
        }

        migrations::apply_migrations(&writer_conn)?;

        let reader_conn = Connection::open(db_path)
            .map_err(|e| StoreError::Unavailable(format!("{}: {}", db_path.display(), e)))?;
        Self::configure_connection(&reader_conn)?;

        Ok(Self {
            writer: Mutex::new(writer_conn),
            reader: Mutex::new(reader_conn),
            path: db_path.to_path_buf(),
            max_retries,
        })
    }

    /// Open read-only, skipping schema creation. Used by dashboard-style
    /// callers that must not block the writer; writes through this instance
    /// fail at the SQLite layer.
    pub fn open_read_only(db_path: &Path) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let open = |p: &Path| {
            Connection::open_with_flags(p, flags)
                .map_err(|e| StoreError::Unavailable(format!("{}: {}", p.display(), e)))
        };
        let writer_conn = open(db_path)?;
        let reader_conn = open(db_path)?;
        writer_conn.execute_batch("PRAGMA busy_timeout = 5000;")?;
        reader_conn.execute_batch("PRAGMA busy_timeout = 5000;")?;
        Ok(Self {
            writer: Mutex::new(writer_conn),
            reader: Mutex::new(reader_conn),
            path: db_path.to_path_buf(),
            max_retries: 0,
        })
    }

    fn writer(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.writer
            .lock()
            .map_err(|_| StoreError::Unavailable("Writer lock poisoned".into()))
    }

    fn reader(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.reader
            .lock()
            .map_err(|_| StoreError::Unavailable("Reader lock poisoned".into()))
    }

    /// Database file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    // ========================================================================
    // APPEND
    // ========================================================================

    /// Append an event. Idempotent: a dedupe-key hit returns the existing
    /// event id without writing. Otherwise the event row, the dedupe row,
    /// and the L0 level row are inserted in one transaction, and the
    /// session row is opened if this is the first event of the session.
    pub fn append(&self, input: AppendInput) -> Result<AppendResult> {
        let ctx = input.project.as_ref().map(|p| KeyContext {
            project: Some(p.clone()),
        });
        let canonical = canonical_key(&input.content, ctx.as_ref());
        let dedupe = dedupe_key(&input.content, &input.session_id);

        // Fast path: known duplicate
        if let Some(existing) = self.lookup_dedupe(&dedupe)? {
            return Ok(AppendResult {
                event_id: existing,
                is_duplicate: true,
            });
        }

        let id = Uuid::new_v4().to_string();
        let timestamp = input.timestamp.unwrap_or_else(Utc::now);
        let now = Utc::now();
        let metadata_json =
            serde_json::to_string(&input.metadata).unwrap_or_else(|_| "null".to_string());

        let mut writer = self.writer()?;
        let tx = writer.transaction()?;

        let inserted = tx.execute(
            "INSERT INTO event_dedup (dedupe_key, event_id, created_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(dedupe_key) DO NOTHING",
            params![dedupe, id, now.to_rfc3339()],
        )?;
        if inserted == 0 {
            // Lost a race with a concurrent retry; surface the winner
            let existing: String = tx.query_row(
                "SELECT event_id FROM event_dedup WHERE dedupe_key = ?1",
                params![dedupe],
                |row| row.get(0),
            )?;
            tx.rollback()?;
            return Ok(AppendResult {
                event_id: existing,
                is_duplicate: true,
            });
        }

        tx.execute(
            "INSERT INTO events (
                id, event_type, session_id, timestamp, content,
                canonical_key, dedupe_key, metadata, access_count
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0)",
            params![
                id,
                input.event_type.as_str(),
                input.session_id,
                timestamp.to_rfc3339(),
                input.content,
                canonical,
                dedupe,
                metadata_json,
            ],
        )?;

        tx.execute(
            "INSERT INTO memory_levels (event_id, level, promoted_at)
             VALUES (?1, 'L0', ?2)",
            params![id, now.to_rfc3339()],
        )?;

        tx.execute(
            "INSERT OR IGNORE INTO sessions (id, started_at) VALUES (?1, ?2)",
            params![input.session_id, timestamp.to_rfc3339()],
        )?;

        tx.commit()?;

        Ok(AppendResult {
            event_id: id,
            is_duplicate: false,
        })
    }

    fn lookup_dedupe(&self, key: &str) -> Result<Option<String>> {
        let reader = self.reader()?;
        let id = reader
            .query_row(
                "SELECT event_id FROM event_dedup WHERE dedupe_key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    // ========================================================================
    // OUTBOX
    // ========================================================================

    /// Enqueue an embedding job. Called only for non-duplicate appends.
    pub fn enqueue_for_embedding(&self, event_id: &str, content: &str) -> Result<()> {
        let writer = self.writer()?;
        writer.execute(
            "INSERT INTO embedding_outbox (event_id, content, status, retry_count, created_at)
             VALUES (?1, ?2, 'pending', 0, ?3)",
            params![event_id, content, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Atomically claim up to `limit` pending jobs, oldest first. A single
    /// UPDATE..RETURNING flips them to `processing`, so concurrent claimers
    /// can never double-claim a row.
    pub fn claim_pending(&self, limit: usize) -> Result<Vec<OutboxJob>> {
        let writer = self.writer()?;
        let mut stmt = writer.prepare(
            "UPDATE embedding_outbox SET status = 'processing'
             WHERE id IN (
                 SELECT id FROM embedding_outbox
                 WHERE status = 'pending'
                 ORDER BY created_at ASC, id ASC
                 LIMIT ?1
             )
             RETURNING id, event_id, content, status, retry_count,
                       created_at, processed_at, error_message",
        )?;
        let jobs = stmt
            .query_map(params![limit as i64], Self::row_to_job)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    /// Delete completed jobs
    pub fn complete_jobs(&self, ids: &[i64]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let writer = self.writer()?;
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!("DELETE FROM embedding_outbox WHERE id IN ({})", placeholders);
        writer.execute(&sql, rusqlite::params_from_iter(ids.iter()))?;
        Ok(())
    }

    /// Fail jobs: requeue with a retry bump, or mark terminally `failed`
    /// once retries are exhausted
    pub fn fail_jobs(&self, ids: &[i64], error: &str) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let writer = self.writer()?;
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            "UPDATE embedding_outbox SET
                status = CASE WHEN retry_count >= ?1 THEN 'failed' ELSE 'pending' END,
                retry_count = CASE WHEN retry_count >= ?1 THEN retry_count ELSE retry_count + 1 END,
                processed_at = ?2,
                error_message = ?3
             WHERE id IN ({})",
            placeholders,
        );
        let now = Utc::now().to_rfc3339();
        let mut values: Vec<&dyn rusqlite::ToSql> = vec![&self.max_retries, &now, &error];
        for id in ids {
            values.push(id);
        }
        writer.execute(&sql, values.as_slice())?;
        Ok(())
    }

    /// Reset jobs stranded in `processing` by a crashed worker back to
    /// `pending`, bumping their retry count. Called on startup.
    pub fn reconcile_processing(&self) -> Result<usize> {
        let writer = self.writer()?;
        let reset = writer.execute(
            "UPDATE embedding_outbox
             SET status = 'pending', retry_count = retry_count + 1
             WHERE status = 'processing'",
            [],
        )?;
        if reset > 0 {
            tracing::warn!("Reconciled {} stranded outbox jobs", reset);
        }
        Ok(reset)
    }

    /// Outbox backlog by status: (pending, processing, failed)
    pub fn outbox_counts(&self) -> Result<(i64, i64, i64)> {
        let reader = self.reader()?;
        let count = |status: &str| -> rusqlite::Result<i64> {
            reader.query_row(
                "SELECT COUNT(*) FROM embedding_outbox WHERE status = ?1",
                params![status],
                |row| row.get(0),
            )
        };
        Ok((count("pending")?, count("processing")?, count("failed")?))
    }

    fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<OutboxJob> {
        let status: String = row.get("status")?;
        let created_at: String = row.get("created_at")?;
        let processed_at: Option<String> = row.get("processed_at")?;
        Ok(OutboxJob {
            id: row.get("id")?,
            event_id: row.get("event_id")?,
            content: row.get("content")?,
            status: OutboxStatus::parse_name(&status),
            retry_count: row.get("retry_count")?,
            created_at: Self::parse_timestamp(&created_at, "created_at")?,
            processed_at: processed_at.and_then(|s| parse_rfc3339(&s)),
            error_message: row.get("error_message")?,
        })
    }

    // ========================================================================
    // READS
    // ========================================================================

    /// Parse RFC3339 timestamp
    fn parse_timestamp(value: &str, field_name: &str) -> rusqlite::Result<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(value)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    0,
                    rusqlite::types::Type::Text,
                    Box::new(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("Invalid {} timestamp '{}': {}", field_name, value, e),
                    )),
                )
            })
    }

    /// Convert a row to Event
    fn row_to_event(row: &rusqlite::Row) -> rusqlite::Result<Event> {
        let event_type: String = row.get("event_type")?;
        let timestamp: String = row.get("timestamp")?;
        let metadata_json: String = row.get("metadata")?;
        let last_accessed_at: Option<String> = row.get("last_accessed_at")?;

        Ok(Event {
            id: row.get("id")?,
            event_type: EventType::parse_name(&event_type),
            session_id: row.get("session_id")?,
            timestamp: Self::parse_timestamp(&timestamp, "timestamp")?,
            content: row.get("content")?,
            canonical_key: row.get("canonical_key")?,
            dedupe_key: row.get("dedupe_key")?,
            metadata: serde_json::from_str(&metadata_json).unwrap_or(serde_json::Value::Null),
            access_count: row.get("access_count")?,
            last_accessed_at: last_accessed_at.and_then(|s| parse_rfc3339(&s)),
        })
    }

    /// Get an event by id
    pub fn get_event(&self, id: &str) -> Result<Option<Event>> {
        let reader = self.reader()?;
        let event = reader
            .query_row(
                "SELECT * FROM events WHERE id = ?1",
                params![id],
                Self::row_to_event,
            )
            .optional()?;
        Ok(event)
    }

    /// Get several events by id, in the order found
    pub fn get_events(&self, ids: &[String]) -> Result<Vec<Event>> {
        if ids.is_empty() {
            return Ok(vec![]);
        }
        let reader = self.reader()?;
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!("SELECT * FROM events WHERE id IN ({})", placeholders);
        let mut stmt = reader.prepare(&sql)?;
        let events = stmt
            .query_map(
                rusqlite::params_from_iter(ids.iter()),
                Self::row_to_event,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }

    /// All events of a session in timestamp order
    pub fn get_session_events(&self, session_id: &str) -> Result<Vec<Event>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT * FROM events WHERE session_id = ?1 ORDER BY timestamp ASC, rowid ASC",
        )?;
        let events = stmt
            .query_map(params![session_id], Self::row_to_event)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }

    /// Most recent events, newest first
    pub fn get_recent(&self, limit: usize) -> Result<Vec<Event>> {
        let reader = self.reader()?;
        let mut stmt = reader
            .prepare("SELECT * FROM events ORDER BY timestamp DESC, rowid DESC LIMIT ?1")?;
        let events = stmt
            .query_map(params![limit as i64], Self::row_to_event)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }

    /// Events appended at or after `since`, oldest first (sync scans)
    pub fn get_events_since(&self, since: DateTime<Utc>, limit: usize) -> Result<Vec<Event>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT * FROM events WHERE timestamp >= ?1 ORDER BY timestamp ASC, rowid ASC LIMIT ?2",
        )?;
        let events = stmt
            .query_map(params![since.to_rfc3339(), limit as i64], Self::row_to_event)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }

    /// Events currently at a given level, oldest first
    pub fn get_events_by_level(
        &self,
        level: MemoryLevel,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Event>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT e.* FROM events e
             JOIN memory_levels m ON m.event_id = e.id
             WHERE m.level = ?1
             ORDER BY e.timestamp ASC, e.rowid ASC
             LIMIT ?2 OFFSET ?3",
        )?;
        let events = stmt
            .query_map(
                params![level.as_str(), limit as i64, offset as i64],
                Self::row_to_event,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }

    /// Events with the highest use counts
    pub fn get_most_accessed(&self, limit: usize) -> Result<Vec<Event>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT * FROM events WHERE access_count > 0
             ORDER BY access_count DESC, timestamp DESC LIMIT ?1",
        )?;
        let events = stmt
            .query_map(params![limit as i64], Self::row_to_event)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }

    /// The session neighbors of an event: the event immediately before and
    /// immediately after it in the same session
    pub fn get_neighbors(&self, event: &Event) -> Result<(Option<Event>, Option<Event>)> {
        let reader = self.reader()?;
        let rowid: i64 = reader.query_row(
            "SELECT rowid FROM events WHERE id = ?1",
            params![event.id],
            |row| row.get(0),
        )?;
        let ts = event.timestamp.to_rfc3339();
        let before = reader
            .query_row(
                "SELECT * FROM events
                 WHERE session_id = ?1 AND (timestamp < ?2 OR (timestamp = ?2 AND rowid < ?3))
                 ORDER BY timestamp DESC, rowid DESC LIMIT 1",
                params![event.session_id, ts, rowid],
                Self::row_to_event,
            )
            .optional()?;
        let after = reader
            .query_row(
                "SELECT * FROM events
                 WHERE session_id = ?1 AND (timestamp > ?2 OR (timestamp = ?2 AND rowid > ?3))
                 ORDER BY timestamp ASC, rowid ASC LIMIT 1",
                params![event.session_id, ts, rowid],
                Self::row_to_event,
            )
            .optional()?;
        Ok((before, after))
    }

    // ========================================================================
    // KEYWORD SEARCH
    // ========================================================================

    /// FTS keyword search with per-token prefix matching. Malformed FTS
    /// input (or a missing index) falls back to a substring scan ordered by
    /// timestamp. Returns `(event, rank)` pairs, best first.
    pub fn keyword_search(&self, query: &str, limit: usize) -> Result<Vec<(Event, f64)>> {
        let fts_query = build_fts_query(query);
        if fts_query.is_empty() {
            return Ok(vec![]);
        }

        match self.fts_search(&fts_query, limit) {
            Ok(hits) => Ok(hits),
            Err(e) => {
                tracing::debug!("FTS search failed ({}); falling back to substring scan", e);
                self.substring_search(query, limit)
            }
        }
    }

    fn fts_search(&self, fts_query: &str, limit: usize) -> Result<Vec<(Event, f64)>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT e.*, rank FROM events e
             JOIN events_fts ON events_fts.id = e.id
             WHERE events_fts MATCH ?1
             ORDER BY rank
             LIMIT ?2",
        )?;
        let hits = stmt
            .query_map(params![fts_query, limit as i64], |row| {
                let event = Self::row_to_event(row)?;
                let rank: f64 = row.get("rank")?;
                Ok((event, rank))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(hits)
    }

    fn substring_search(&self, query: &str, limit: usize) -> Result<Vec<(Event, f64)>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT * FROM events
             WHERE content LIKE '%' || ?1 || '%'
             ORDER BY timestamp DESC, rowid DESC
             LIMIT ?2",
        )?;
        let hits = stmt
            .query_map(params![query, limit as i64], |row| {
                Ok((Self::row_to_event(row)?, 0.0))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(hits)
    }

    /// Rebuild the FTS index from the events table
    pub fn rebuild_fts(&self) -> Result<()> {
        let writer = self.writer()?;
        writer.execute("INSERT INTO events_fts(events_fts) VALUES('rebuild')", [])?;
        Ok(())
    }

    /// Checkpoint the WAL into the main database file
    pub fn checkpoint(&self) -> Result<()> {
        let writer = self.writer()?;
        writer.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
        Ok(())
    }

    // ========================================================================
    // ACCESS ACCOUNTING
    // ========================================================================

    /// Bump use counters. Invoked only when memories were actually injected
    /// into a prompt, never on search hits.
    pub fn increment_access_count(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let writer = self.writer()?;
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            "UPDATE events SET access_count = access_count + 1, last_accessed_at = ?1
             WHERE id IN ({})",
            placeholders
        );
        let now = Utc::now().to_rfc3339();
        let mut values: Vec<&dyn rusqlite::ToSql> = vec![&now];
        for id in ids {
            values.push(id);
        }
        writer.execute(&sql, values.as_slice())?;
        Ok(())
    }

    /// Record a retrieval access for graduation metrics
    pub fn record_access(&self, event_id: &str, session_id: &str, confidence: f64) -> Result<()> {
        let writer = self.writer()?;
        writer.execute(
            "INSERT INTO access_log (event_id, session_id, confidence, accessed_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![event_id, session_id, confidence, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Aggregate the access log for one event. `origin_session` is excluded
    /// from the cross-session count.
    pub fn access_stats(&self, event_id: &str, origin_session: &str) -> Result<AccessStats> {
        let reader = self.reader()?;
        let row = reader
            .query_row(
                "SELECT COUNT(*), MAX(confidence), MAX(accessed_at),
                        COUNT(DISTINCT CASE WHEN session_id != ?2 THEN session_id END)
                 FROM access_log WHERE event_id = ?1",
                params![event_id, origin_session],
                |row| {
                    let count: i64 = row.get(0)?;
                    let confidence: Option<f64> = row.get(1)?;
                    let last: Option<String> = row.get(2)?;
                    let cross: i64 = row.get(3)?;
                    Ok((count, confidence, last, cross))
                },
            )
            .optional()?;
        let (count, confidence, last, cross) = row.unwrap_or((0, None, None, 0));
        Ok(AccessStats {
            access_count: count,
            last_accessed: last.and_then(|s| parse_rfc3339(&s)),
            cross_session_refs: cross,
            confidence: confidence.unwrap_or(0.0),
        })
    }

    // ========================================================================
    // SESSIONS
    // ========================================================================

    /// Insert the session if absent; otherwise update only supplied fields
    pub fn upsert_session(&self, id: &str, update: SessionUpdate) -> Result<()> {
        let writer = self.writer()?;
        writer.execute(
            "INSERT OR IGNORE INTO sessions (id, started_at) VALUES (?1, ?2)",
            params![id, Utc::now().to_rfc3339()],
        )?;
        if let Some(ended_at) = update.ended_at {
            writer.execute(
                "UPDATE sessions SET ended_at = ?2 WHERE id = ?1",
                params![id, ended_at.to_rfc3339()],
            )?;
        }
        if let Some(project_path) = update.project_path {
            writer.execute(
                "UPDATE sessions SET project_path = ?2 WHERE id = ?1",
                params![id, project_path],
            )?;
        }
        if let Some(summary) = update.summary {
            writer.execute(
                "UPDATE sessions SET summary = ?2 WHERE id = ?1",
                params![id, summary],
            )?;
        }
        if let Some(tags) = update.tags {
            let tags_json = serde_json::to_string(&tags).unwrap_or_else(|_| "[]".to_string());
            writer.execute(
                "UPDATE sessions SET tags = ?2 WHERE id = ?1",
                params![id, tags_json],
            )?;
        }
        Ok(())
    }

    /// Get a session by id
    pub fn get_session(&self, id: &str) -> Result<Option<Session>> {
        let reader = self.reader()?;
        let session = reader
            .query_row("SELECT * FROM sessions WHERE id = ?1", params![id], |row| {
                let started_at: String = row.get("started_at")?;
                let ended_at: Option<String> = row.get("ended_at")?;
                let tags_json: String = row.get("tags")?;
                Ok(Session {
                    id: row.get("id")?,
                    started_at: Self::parse_timestamp(&started_at, "started_at")?,
                    ended_at: ended_at.and_then(|s| parse_rfc3339(&s)),
                    project_path: row.get("project_path")?,
                    summary: row.get("summary")?,
                    tags: serde_json::from_str(&tags_json).unwrap_or_default(),
                })
            })
            .optional()?;
        Ok(session)
    }

    // ========================================================================
    // MEMORY LEVELS
    // ========================================================================

    /// Current level of an event
    pub fn get_level(&self, event_id: &str) -> Result<Option<MemoryLevel>> {
        let reader = self.reader()?;
        let level: Option<String> = reader
            .query_row(
                "SELECT level FROM memory_levels WHERE event_id = ?1",
                params![event_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(level.map(|l| MemoryLevel::parse_name(&l)))
    }

    /// Unconditional level overwrite; the graduation pipeline is the only
    /// caller and enforces monotonicity
    pub fn update_memory_level(&self, event_id: &str, level: MemoryLevel) -> Result<()> {
        let writer = self.writer()?;
        let changed = writer.execute(
            "UPDATE memory_levels SET level = ?2, promoted_at = ?3 WHERE event_id = ?1",
            params![event_id, level.as_str(), Utc::now().to_rfc3339()],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(event_id.to_string()));
        }
        Ok(())
    }

    // ========================================================================
    // INSIGHTS
    // ========================================================================

    /// Persist an extracted insight
    pub fn insert_insight(&self, insight: &Insight) -> Result<()> {
        let writer = self.writer()?;
        writer.execute(
            "INSERT OR REPLACE INTO insights (id, kind, insight, source_events, confidence, extracted_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                insight.id,
                insight.kind.as_str(),
                insight.insight,
                serde_json::to_string(&insight.source_events).unwrap_or_else(|_| "[]".to_string()),
                insight.confidence,
                insight.extracted_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Most recently extracted insights
    pub fn list_insights(&self, limit: usize) -> Result<Vec<Insight>> {
        let reader = self.reader()?;
        let mut stmt = reader
            .prepare("SELECT * FROM insights ORDER BY extracted_at DESC LIMIT ?1")?;
        let insights = stmt
            .query_map(params![limit as i64], |row| {
                let kind: String = row.get("kind")?;
                let source_events: String = row.get("source_events")?;
                let extracted_at: String = row.get("extracted_at")?;
                Ok(Insight {
                    id: row.get("id")?,
                    kind: InsightKind::parse_name(&kind),
                    insight: row.get("insight")?,
                    source_events: serde_json::from_str(&source_events).unwrap_or_default(),
                    confidence: row.get("confidence")?,
                    extracted_at: Self::parse_timestamp(&extracted_at, "extracted_at")?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(insights)
    }

    // ========================================================================
    // ENDLESS MODE
    // ========================================================================

    /// Read a key from the endless config table
    pub fn get_endless_config(&self, key: &str) -> Result<Option<String>> {
        let reader = self.reader()?;
        let value = reader
            .query_row(
                "SELECT value FROM endless_config WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    /// Write a key to the endless config table
    pub fn set_endless_config(&self, key: &str, value: &str) -> Result<()> {
        let writer = self.writer()?;
        writer.execute(
            "INSERT INTO endless_config (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Add (or refresh) a working-set item
    pub fn working_set_add(&self, item: &WorkingSetItem) -> Result<()> {
        let writer = self.writer()?;
        writer.execute(
            "INSERT OR REPLACE INTO working_set (id, event_id, added_at, relevance_score, topics, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                item.id,
                item.event_id,
                item.added_at.to_rfc3339(),
                item.relevance_score,
                serde_json::to_string(&item.topics).unwrap_or_else(|_| "[]".to_string()),
                item.expires_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Current working-set items. Expired items are removed, then the set
    /// is capped to `max_events` by discarding lowest
    /// `(relevance_score, added_at)` first.
    pub fn working_set_items(&self, now: DateTime<Utc>, max_events: usize) -> Result<Vec<WorkingSetItem>> {
        {
            let writer = self.writer()?;
            writer.execute(
                "DELETE FROM working_set WHERE expires_at < ?1",
                params![now.to_rfc3339()],
            )?;
            writer.execute(
                "DELETE FROM working_set WHERE id NOT IN (
                     SELECT id FROM working_set
                     ORDER BY relevance_score DESC, added_at DESC
                     LIMIT ?1
                 )",
                params![max_events as i64],
            )?;
        }
        let reader = self.reader()?;
        let mut stmt =
            reader.prepare("SELECT * FROM working_set ORDER BY added_at ASC, id ASC")?;
        let items = stmt
            .query_map([], |row| {
                let added_at: String = row.get("added_at")?;
                let expires_at: String = row.get("expires_at")?;
                let topics: String = row.get("topics")?;
                Ok(WorkingSetItem {
                    id: row.get("id")?,
                    event_id: row.get("event_id")?,
                    added_at: Self::parse_timestamp(&added_at, "added_at")?,
                    relevance_score: row.get("relevance_score")?,
                    topics: serde_json::from_str(&topics).unwrap_or_default(),
                    expires_at: Self::parse_timestamp(&expires_at, "expires_at")?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(items)
    }

    /// Remove working-set items by id
    pub fn working_set_remove(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let writer = self.writer()?;
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!("DELETE FROM working_set WHERE id IN ({})", placeholders);
        writer.execute(&sql, rusqlite::params_from_iter(ids.iter()))?;
        Ok(())
    }

    /// Most recent working-set activity
    pub fn working_set_latest_activity(&self) -> Result<Option<DateTime<Utc>>> {
        let reader = self.reader()?;
        let latest: Option<String> = reader
            .query_row("SELECT MAX(added_at) FROM working_set", [], |row| row.get(0))
            .optional()?
            .flatten();
        Ok(latest.and_then(|s| parse_rfc3339(&s)))
    }

    /// Persist a consolidated memory
    pub fn insert_consolidated(&self, memory: &ConsolidatedMemory) -> Result<()> {
        let writer = self.writer()?;
        writer.execute(
            "INSERT INTO consolidated_memories
                 (memory_id, summary, topics, source_events, confidence, created_at, accessed_at, access_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                memory.memory_id,
                memory.summary,
                serde_json::to_string(&memory.topics).unwrap_or_else(|_| "[]".to_string()),
                serde_json::to_string(&memory.source_events).unwrap_or_else(|_| "[]".to_string()),
                memory.confidence,
                memory.created_at.to_rfc3339(),
                memory.accessed_at.map(|t| t.to_rfc3339()),
                memory.access_count,
            ],
        )?;
        Ok(())
    }

    /// Most recent consolidated memories
    pub fn list_consolidated(&self, limit: usize) -> Result<Vec<ConsolidatedMemory>> {
        let reader = self.reader()?;
        let mut stmt = reader
            .prepare("SELECT * FROM consolidated_memories ORDER BY created_at DESC LIMIT ?1")?;
        let memories = stmt
            .query_map(params![limit as i64], Self::row_to_consolidated)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(memories)
    }

    fn row_to_consolidated(row: &rusqlite::Row) -> rusqlite::Result<ConsolidatedMemory> {
        let topics: String = row.get("topics")?;
        let source_events: String = row.get("source_events")?;
        let created_at: String = row.get("created_at")?;
        let accessed_at: Option<String> = row.get("accessed_at")?;
        Ok(ConsolidatedMemory {
            memory_id: row.get("memory_id")?,
            summary: row.get("summary")?,
            topics: serde_json::from_str(&topics).unwrap_or_default(),
            source_events: serde_json::from_str(&source_events).unwrap_or_default(),
            confidence: row.get("confidence")?,
            created_at: Self::parse_timestamp(&created_at, "created_at")?,
            accessed_at: accessed_at.and_then(|s| parse_rfc3339(&s)),
            access_count: row.get("access_count")?,
        })
    }

    /// Append a continuity-log row, returning its id
    pub fn insert_continuity(
        &self,
        from_context_id: Option<&str>,
        to_context_id: Option<&str>,
        score: f64,
        transition_type: crate::events::TransitionType,
    ) -> Result<i64> {
        let writer = self.writer()?;
        writer.execute(
            "INSERT INTO continuity_log (from_context_id, to_context_id, score, transition_type, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                from_context_id,
                to_context_id,
                score,
                transition_type.as_str(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(writer.last_insert_rowid())
    }

    /// Most recent continuity-log row
    pub fn latest_continuity(&self) -> Result<Option<crate::events::ContinuityRecord>> {
        let reader = self.reader()?;
        let record = reader
            .query_row(
                "SELECT * FROM continuity_log ORDER BY id DESC LIMIT 1",
                [],
                |row| {
                    let transition: String = row.get("transition_type")?;
                    let created_at: String = row.get("created_at")?;
                    Ok(crate::events::ContinuityRecord {
                        id: row.get("id")?,
                        from_context_id: row.get("from_context_id")?,
                        to_context_id: row.get("to_context_id")?,
                        score: row.get("score")?,
                        transition_type: crate::events::TransitionType::parse_name(&transition),
                        created_at: Self::parse_timestamp(&created_at, "created_at")?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    // ========================================================================
    // STATS
    // ========================================================================

    /// Store-wide counters
    pub fn stats(&self) -> Result<StoreStats> {
        let (outbox_pending, outbox_processing, outbox_failed) = self.outbox_counts()?;
        let reader = self.reader()?;
        let count = |sql: &str| -> rusqlite::Result<i64> {
            reader.query_row(sql, [], |row| row.get(0))
        };

        let mut levels = Vec::new();
        {
            let mut stmt = reader
                .prepare("SELECT level, COUNT(*) FROM memory_levels GROUP BY level ORDER BY level")?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let level: String = row.get(0)?;
                let n: i64 = row.get(1)?;
                levels.push((MemoryLevel::parse_name(&level), n));
            }
        }

        let db_size_bytes = std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);

        Ok(StoreStats {
            events: count("SELECT COUNT(*) FROM events")?,
            sessions: count("SELECT COUNT(*) FROM sessions")?,
            insights: count("SELECT COUNT(*) FROM insights")?,
            working_set: count("SELECT COUNT(*) FROM working_set")?,
            consolidated: count("SELECT COUNT(*) FROM consolidated_memories")?,
            levels,
            outbox_pending,
            outbox_processing,
            outbox_failed,
            db_size_bytes,
        })
    }
}

/// Parse an RFC3339 timestamp, dropping invalid values
fn parse_rfc3339(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

/// Build an FTS5 MATCH expression with per-token prefix matching. Tokens
/// are stripped to alphanumerics and quoted, so user input can never be
/// interpreted as FTS syntax.
fn build_fts_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|token| {
            token
                .chars()
                .filter(|c| c.is_alphanumeric())
                .collect::<String>()
        })
        .filter(|token| !token.is_empty())
        .map(|token| format!("\"{}\"*", token))
        .collect::<Vec<_>>()
        .join(" ")
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_store() -> (EventStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = EventStore::open(&dir.path().join("events.db"), 3).unwrap();
        (store, dir)
    }

    fn input(session: &str, content: &str) -> AppendInput {
        AppendInput::new(EventType::UserPrompt, session, content)
    }

    #[test]
    fn test_append_is_idempotent() {
        let (store, _dir) = open_store();

        let first = store.append(input("s1", "Hello")).unwrap();
        assert!(!first.is_duplicate);

        let second = store.append(input("s1", "Hello")).unwrap();
        assert!(second.is_duplicate);
        assert_eq!(first.event_id, second.event_id);

        let stats = store.stats().unwrap();
        assert_eq!(stats.events, 1);
        assert_eq!(stats.levels, vec![(MemoryLevel::L0, 1)]);
    }

    #[test]
    fn test_append_partitions_by_session() {
        let (store, _dir) = open_store();
        let a = store.append(input("s1", "Hello")).unwrap();
        let b = store.append(input("s2", "Hello")).unwrap();
        assert!(!b.is_duplicate);
        assert_ne!(a.event_id, b.event_id);
    }

    #[test]
    fn test_append_opens_session() {
        let (store, _dir) = open_store();
        store.append(input("s1", "Hello")).unwrap();
        let session = store.get_session("s1").unwrap().unwrap();
        assert_eq!(session.id, "s1");
        assert!(session.ended_at.is_none());
    }

    #[test]
    fn test_outbox_claim_transitions_and_fifo() {
        let (store, _dir) = open_store();
        let a = store.append(input("s1", "first")).unwrap();
        let b = store.append(input("s1", "second")).unwrap();
        store.enqueue_for_embedding(&a.event_id, "first").unwrap();
        store.enqueue_for_embedding(&b.event_id, "second").unwrap();

        let claimed = store.claim_pending(1).unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].event_id, a.event_id);
        assert_eq!(claimed[0].status, OutboxStatus::Processing);

        // Already-claimed rows are not claimable again
        let claimed2 = store.claim_pending(10).unwrap();
        assert_eq!(claimed2.len(), 1);
        assert_eq!(claimed2[0].event_id, b.event_id);

        let (pending, processing, failed) = store.outbox_counts().unwrap();
        assert_eq!((pending, processing, failed), (0, 2, 0));
    }

    #[test]
    fn test_outbox_retry_then_terminal_failure() {
        let (store, _dir) = open_store();
        let a = store.append(input("s1", "x")).unwrap();
        store.enqueue_for_embedding(&a.event_id, "x").unwrap();

        for attempt in 0..3 {
            let claimed = store.claim_pending(10).unwrap();
            assert_eq!(claimed.len(), 1, "attempt {}", attempt);
            assert_eq!(claimed[0].retry_count, attempt);
            store.fail_jobs(&[claimed[0].id], "embedder offline").unwrap();
        }

        // retry_count reached max_retries: the next failure is terminal
        let claimed = store.claim_pending(10).unwrap();
        assert_eq!(claimed[0].retry_count, 3);
        store.fail_jobs(&[claimed[0].id], "embedder offline").unwrap();

        let (pending, processing, failed) = store.outbox_counts().unwrap();
        assert_eq!((pending, processing, failed), (0, 0, 1));
    }

    #[test]
    fn test_outbox_complete_deletes() {
        let (store, _dir) = open_store();
        let a = store.append(input("s1", "x")).unwrap();
        store.enqueue_for_embedding(&a.event_id, "x").unwrap();
        let claimed = store.claim_pending(10).unwrap();
        store.complete_jobs(&[claimed[0].id]).unwrap();
        let (pending, processing, failed) = store.outbox_counts().unwrap();
        assert_eq!((pending, processing, failed), (0, 0, 0));
    }

    #[test]
    fn test_reconcile_processing() {
        let (store, _dir) = open_store();
        let a = store.append(input("s1", "x")).unwrap();
        store.enqueue_for_embedding(&a.event_id, "x").unwrap();
        store.claim_pending(10).unwrap();

        let reset = store.reconcile_processing().unwrap();
        assert_eq!(reset, 1);
        let claimed = store.claim_pending(10).unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].retry_count, 1);
    }

    #[test]
    fn test_keyword_search_prefix_match() {
        let (store, _dir) = open_store();
        store
            .append(input("s1", "How to implement rate limiting in Express?"))
            .unwrap();
        store.append(input("s1", "Completely unrelated topic")).unwrap();

        let hits = store.keyword_search("rate limit", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].0.content.contains("rate limiting"));
    }

    #[test]
    fn test_keyword_search_malformed_input_falls_back() {
        let (store, _dir) = open_store();
        store.append(input("s1", "weird \"quoted\" content")).unwrap();
        // Only punctuation: no FTS tokens survive, no results, no error
        let hits = store.keyword_search("\"(", 10).unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn test_session_events_in_timestamp_order() {
        let (store, _dir) = open_store();
        let mut early = input("s1", "first");
        early.timestamp = Some(Utc::now() - chrono::Duration::minutes(5));
        store.append(input("s1", "second")).unwrap();
        store.append(early).unwrap();

        let events = store.get_session_events("s1").unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].content, "first");
        assert_eq!(events[1].content, "second");
    }

    #[test]
    fn test_neighbors() {
        let (store, _dir) = open_store();
        let base = Utc::now();
        for (i, content) in ["a", "b", "c"].iter().enumerate() {
            let mut inp = input("s1", content);
            inp.timestamp = Some(base + chrono::Duration::seconds(i as i64));
            store.append(inp).unwrap();
        }
        let events = store.get_session_events("s1").unwrap();
        let (before, after) = store.get_neighbors(&events[1]).unwrap();
        assert_eq!(before.unwrap().content, "a");
        assert_eq!(after.unwrap().content, "c");
    }

    #[test]
    fn test_access_accounting() {
        let (store, _dir) = open_store();
        let a = store.append(input("s1", "x")).unwrap();

        store.record_access(&a.event_id, "s2", 0.8).unwrap();
        store.record_access(&a.event_id, "s1", 0.9).unwrap();

        let stats = store.access_stats(&a.event_id, "s1").unwrap();
        assert_eq!(stats.access_count, 2);
        assert_eq!(stats.cross_session_refs, 1);
        assert!((stats.confidence - 0.9).abs() < 1e-9);
        assert!(stats.last_accessed.is_some());

        // Use counters move independently of the access log
        let event = store.get_event(&a.event_id).unwrap().unwrap();
        assert_eq!(event.access_count, 0);
        store.increment_access_count(&[a.event_id.clone()]).unwrap();
        let event = store.get_event(&a.event_id).unwrap().unwrap();
        assert_eq!(event.access_count, 1);
        assert!(event.last_accessed_at.is_some());
    }

    #[test]
    fn test_memory_level_update() {
        let (store, _dir) = open_store();
        let a = store.append(input("s1", "x")).unwrap();
        assert_eq!(store.get_level(&a.event_id).unwrap(), Some(MemoryLevel::L0));
        store.update_memory_level(&a.event_id, MemoryLevel::L1).unwrap();
        assert_eq!(store.get_level(&a.event_id).unwrap(), Some(MemoryLevel::L1));

        let missing = store.update_memory_level("nope", MemoryLevel::L1);
        assert!(matches!(missing, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_upsert_session_partial() {
        let (store, _dir) = open_store();
        store.append(input("s1", "x")).unwrap();
        store
            .upsert_session(
                "s1",
                SessionUpdate {
                    summary: Some("did things".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        let session = store.get_session("s1").unwrap().unwrap();
        assert_eq!(session.summary.as_deref(), Some("did things"));
        assert!(session.ended_at.is_none());

        store
            .upsert_session(
                "s1",
                SessionUpdate {
                    ended_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .unwrap();
        let session = store.get_session("s1").unwrap().unwrap();
        // Earlier fields survive a partial update
        assert_eq!(session.summary.as_deref(), Some("did things"));
        assert!(session.ended_at.is_some());
    }

    #[test]
    fn test_working_set_expiry_and_cap() {
        let (store, _dir) = open_store();
        let now = Utc::now();
        for i in 0..5 {
            store
                .working_set_add(&WorkingSetItem {
                    id: format!("w{}", i),
                    event_id: format!("e{}", i),
                    added_at: now,
                    relevance_score: i as f64 / 10.0,
                    topics: vec![],
                    expires_at: if i == 0 {
                        now - chrono::Duration::hours(1)
                    } else {
                        now + chrono::Duration::hours(1)
                    },
                })
                .unwrap();
        }

        // w0 expired; cap of 3 discards the lowest-relevance survivors
        let items = store.working_set_items(now, 3).unwrap();
        assert_eq!(items.len(), 3);
        let ids: Vec<&str> = items.iter().map(|i| i.id.as_str()).collect();
        assert!(ids.contains(&"w4") && ids.contains(&"w3") && ids.contains(&"w2"));
    }

    #[test]
    fn test_endless_config_roundtrip() {
        let (store, _dir) = open_store();
        assert!(store.get_endless_config("mode").unwrap().is_none());
        store.set_endless_config("mode", "endless").unwrap();
        assert_eq!(store.get_endless_config("mode").unwrap().as_deref(), Some("endless"));
        store.set_endless_config("mode", "session").unwrap();
        assert_eq!(store.get_endless_config("mode").unwrap().as_deref(), Some("session"));
    }

    #[test]
    fn test_read_only_open_skips_schema() {
        let (store, dir) = open_store();
        store.append(input("s1", "x")).unwrap();
        drop(store);

        let ro = EventStore::open_read_only(&dir.path().join("events.db")).unwrap();
        assert_eq!(ro.stats().unwrap().events, 1);
        assert!(ro.append(input("s1", "y")).is_err());
    }
}
