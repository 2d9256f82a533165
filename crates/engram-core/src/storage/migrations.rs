//! Database Migrations
//!
//! Schema migration definitions for the event store.

/// Migration definitions
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "Initial schema: event log, dedupe index, sessions, outbox, FTS",
        up: MIGRATION_V1_UP,
    },
    Migration {
        version: 2,
        description: "Graduation: access log and derived insights",
        up: MIGRATION_V2_UP,
    },
    Migration {
        version: 3,
        description: "Endless mode: working set, consolidated memories, continuity log",
        up: MIGRATION_V3_UP,
    },
];

/// A database migration
#[derive(Debug, Clone)]
pub struct Migration {
    /// Version number
    pub version: u32,
    /// Description
    pub description: &'static str,
    /// SQL to apply
    pub up: &'static str,
}

/// V1: Initial schema
const MIGRATION_V1_UP: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    id TEXT PRIMARY KEY,
    event_type TEXT NOT NULL,
    session_id TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    content TEXT NOT NULL,
    canonical_key TEXT NOT NULL,
    dedupe_key TEXT NOT NULL UNIQUE,
    metadata TEXT NOT NULL DEFAULT 'null',

    -- Access accounting: only bumped when a memory is actually used
    access_count INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_events_session ON events(session_id, timestamp);
CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp);
CREATE INDEX IF NOT EXISTS idx_events_canonical ON events(canonical_key);
CREATE INDEX IF NOT EXISTS idx_events_access ON events(access_count);

-- Idempotency index: existence implies a corresponding event row
CREATE TABLE IF NOT EXISTS event_dedup (
    dedupe_key TEXT PRIMARY KEY,
    event_id TEXT NOT NULL REFERENCES events(id),
    created_at TEXT NOT NULL
);

-- Sessions are upsert-only
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    started_at TEXT NOT NULL,
    ended_at TEXT,
    project_path TEXT,
    summary TEXT
);

CREATE INDEX IF NOT EXISTS idx_sessions_started ON sessions(started_at);

-- Every event has exactly one current level row, created at L0 with the event
CREATE TABLE IF NOT EXISTS memory_levels (
    event_id TEXT PRIMARY KEY REFERENCES events(id),
    level TEXT NOT NULL DEFAULT 'L0',
    promoted_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_levels_level ON memory_levels(level);

-- Durable embedding work queue (single-writer pattern)
CREATE TABLE IF NOT EXISTS embedding_outbox (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    event_id TEXT NOT NULL,
    content TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    retry_count INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    processed_at TEXT,
    error_message TEXT
);

CREATE INDEX IF NOT EXISTS idx_outbox_status ON embedding_outbox(status, created_at);

-- FTS5 virtual table for keyword search over event content
CREATE VIRTUAL TABLE IF NOT EXISTS events_fts USING fts5(
    id,
    content,
    content='events',
    content_rowid='rowid',
    tokenize='porter ascii'
);

-- Triggers to keep FTS in sync
CREATE TRIGGER IF NOT EXISTS events_ai AFTER INSERT ON events BEGIN
    INSERT INTO events_fts(rowid, id, content)
    VALUES (NEW.rowid, NEW.id, NEW.content);
END;

CREATE TRIGGER IF NOT EXISTS events_ad AFTER DELETE ON events BEGIN
    INSERT INTO events_fts(events_fts, rowid, id, content)
    VALUES ('delete', OLD.rowid, OLD.id, OLD.content);
END;

CREATE TRIGGER IF NOT EXISTS events_au AFTER UPDATE OF content ON events BEGIN
    INSERT INTO events_fts(events_fts, rowid, id, content)
    VALUES ('delete', OLD.rowid, OLD.id, OLD.content);
    INSERT INTO events_fts(rowid, id, content)
    VALUES (NEW.rowid, NEW.id, NEW.content);
END;

-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL
);

INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (1, datetime('now'));
"#;

/// V2: Graduation support
/// Access history is persisted rather than held in memory so promotion
/// metrics (cross-session refs in particular) survive restarts.
const MIGRATION_V2_UP: &str = r#"
CREATE TABLE IF NOT EXISTS access_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    event_id TEXT NOT NULL,
    session_id TEXT NOT NULL,
    confidence REAL NOT NULL DEFAULT 0.0,
    accessed_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_access_log_event ON access_log(event_id);
CREATE INDEX IF NOT EXISTS idx_access_log_time ON access_log(accessed_at);

CREATE TABLE IF NOT EXISTS insights (
    id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    insight TEXT NOT NULL,
    source_events TEXT NOT NULL DEFAULT '[]',
    confidence REAL NOT NULL,
    extracted_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_insights_kind ON insights(kind);

UPDATE schema_version SET version = 2, applied_at = datetime('now');
"#;

/// V3: Endless mode
const MIGRATION_V3_UP: &str = r#"
CREATE TABLE IF NOT EXISTS working_set (
    id TEXT PRIMARY KEY,
    event_id TEXT NOT NULL,
    added_at TEXT NOT NULL,
    relevance_score REAL NOT NULL DEFAULT 1.0,
    topics TEXT NOT NULL DEFAULT '[]',
    expires_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_working_set_expires ON working_set(expires_at);
CREATE INDEX IF NOT EXISTS idx_working_set_added ON working_set(added_at);

CREATE TABLE IF NOT EXISTS consolidated_memories (
    memory_id TEXT PRIMARY KEY,
    summary TEXT NOT NULL,
    topics TEXT NOT NULL DEFAULT '[]',
    source_events TEXT NOT NULL DEFAULT '[]',
    confidence REAL NOT NULL,
    created_at TEXT NOT NULL,
    accessed_at TEXT,
    access_count INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_consolidated_created ON consolidated_memories(created_at);

CREATE TABLE IF NOT EXISTS continuity_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    from_context_id TEXT,
    to_context_id TEXT,
    score REAL NOT NULL,
    transition_type TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS endless_config (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

UPDATE schema_version SET version = 3, applied_at = datetime('now');
"#;

/// Columns added after their table first shipped. Applied on every open via
/// a `PRAGMA table_info` probe so old installations self-migrate without a
/// version bump.
const LATE_COLUMNS: &[(&str, &str, &str)] = &[
    ("events", "last_accessed_at", "TEXT"),
    ("sessions", "tags", "TEXT NOT NULL DEFAULT '[]'"),
];

/// Get current schema version from database
pub fn get_current_version(conn: &rusqlite::Connection) -> rusqlite::Result<u32> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
    .or(Ok(0))
}

/// Check whether a column exists on a table
fn column_exists(conn: &rusqlite::Connection, table: &str, column: &str) -> rusqlite::Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Apply pending migrations and late-column additions
pub fn apply_migrations(conn: &rusqlite::Connection) -> rusqlite::Result<u32> {
    let current_version = get_current_version(conn)?;
    let mut applied = 0;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                "Applying migration v{}: {}",
                migration.version,
                migration.description
            );

            // execute_batch handles multi-statement SQL including triggers
            conn.execute_batch(migration.up)?;
            applied += 1;
        }
    }

    for (table, column, decl) in LATE_COLUMNS {
        if !column_exists(conn, table, column)? {
            tracing::info!("Adding column {}.{}", table, column);
            conn.execute_batch(&format!("ALTER TABLE {} ADD COLUMN {} {};", table, column, decl))?;
        }
    }

    Ok(applied)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn test_migrations_apply_cleanly() {
        let conn = Connection::open_in_memory().unwrap();
        let applied = apply_migrations(&conn).unwrap();
        assert_eq!(applied as usize, MIGRATIONS.len());
        assert_eq!(get_current_version(&conn).unwrap(), 3);
    }

    #[test]
    fn test_migrations_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        apply_migrations(&conn).unwrap();
        let applied = apply_migrations(&conn).unwrap();
        assert_eq!(applied, 0);
    }

    #[test]
    fn test_late_columns_probe() {
        let conn = Connection::open_in_memory().unwrap();
        apply_migrations(&conn).unwrap();
        assert!(column_exists(&conn, "events", "last_accessed_at").unwrap());
        assert!(column_exists(&conn, "sessions", "tags").unwrap());
        assert!(!column_exists(&conn, "events", "no_such_column").unwrap());
    }
}
