//! Shared Store
//!
//! Cross-project troubleshooting knowledge. Projects promote resolved
//! problems (title, symptoms, root cause, solution) into a store under the
//! shared path; retrieval from any project can then search it, excluding
//! the asking project's own contributions.
//!
//! Entries are low-volume, so semantic search is a linear cosine scan over
//! embeddings persisted next to each row, fused with FTS keyword hits.
//! No deletion; the only updates are usage bumps.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::embeddings::{Embedder, cosine_similarity};
use crate::storage::{Result, StoreError};

/// Weight of the semantic signal in hybrid fusion
const SEMANTIC_WEIGHT: f64 = 0.7;

/// Weight of the keyword signal in hybrid fusion
const KEYWORD_WEIGHT: f64 = 0.3;

// ============================================================================
// TYPES
// ============================================================================

/// A promoted troubleshooting entry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedTroubleshootingEntry {
    pub entry_id: String,
    pub source_project_hash: String,
    pub source_entry_id: String,
    pub title: String,
    pub symptoms: Vec<String>,
    pub root_cause: String,
    pub solution: String,
    pub topics: Vec<String>,
    #[serde(default)]
    pub technologies: Vec<String>,
    pub confidence: f64,
    pub usage_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
    pub promoted_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Candidate for promotion into the shared store
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromotionInput {
    pub source_entry_id: String,
    pub title: String,
    #[serde(default)]
    pub symptoms: Vec<String>,
    pub root_cause: String,
    pub solution: String,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub technologies: Vec<String>,
    pub confidence: f64,
}

/// Outcome of a promotion attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromotionResult {
    pub promoted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry_id: Option<String>,
    pub reason: String,
}

/// A shared-store search hit
#[derive(Debug, Clone)]
pub struct SharedSearchResult {
    pub entry: SharedTroubleshootingEntry,
    pub score: f64,
}

/// Shared-store counters
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedStats {
    pub entries: i64,
    pub total_usage: i64,
    pub avg_confidence: f64,
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS shared_entries (
    entry_id TEXT PRIMARY KEY,
    source_project_hash TEXT NOT NULL,
    source_entry_id TEXT NOT NULL,
    title TEXT NOT NULL,
    symptoms TEXT NOT NULL DEFAULT '[]',
    root_cause TEXT NOT NULL,
    solution TEXT NOT NULL,
    topics TEXT NOT NULL DEFAULT '[]',
    technologies TEXT NOT NULL DEFAULT '[]',
    confidence REAL NOT NULL,
    usage_count INTEGER NOT NULL DEFAULT 0,
    last_used_at TEXT,
    promoted_at TEXT NOT NULL,
    created_at TEXT NOT NULL,
    embedding BLOB
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_shared_source
    ON shared_entries(source_project_hash, source_entry_id);

CREATE VIRTUAL TABLE IF NOT EXISTS shared_fts USING fts5(
    entry_id, title, symptoms, solution, tokenize='porter ascii'
);

CREATE TRIGGER IF NOT EXISTS shared_ai AFTER INSERT ON shared_entries BEGIN
    INSERT INTO shared_fts(entry_id, title, symptoms, solution)
    VALUES (NEW.entry_id, NEW.title, NEW.symptoms, NEW.solution);
END;
"#;

// ============================================================================
// SHARED STORE
// ============================================================================

/// The cross-project knowledge store
pub struct SharedStore {
    db: rusqlite::Connection,
    embedder: Arc<dyn Embedder>,
    min_confidence_for_promotion: f64,
}

/// Thread-safe handle over the shared store; the single connection lives
/// behind one lock because promotions and usage bumps are rare
pub struct SharedStoreHandle(std::sync::Mutex<SharedStore>);

impl SharedStore {
    /// Open (creating if necessary) the shared store under `dir`
    pub fn open(
        dir: &Path,
        embedder: Arc<dyn Embedder>,
        min_confidence_for_promotion: f64,
    ) -> Result<SharedStoreHandle> {
        std::fs::create_dir_all(dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700));
        }
        let path = dir.join("shared.db");
        let db = rusqlite::Connection::open(&path)
            .map_err(|e| StoreError::Unavailable(format!("{}: {}", path.display(), e)))?;
        db.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )?;
        db.execute_batch(SCHEMA)?;
        Ok(SharedStoreHandle(std::sync::Mutex::new(Self {
            db,
            embedder,
            min_confidence_for_promotion,
        })))
    }

    /// Promote an entry. Requires the entry's confidence to clear the
    /// promotion threshold; re-promoting the same source entry returns the
    /// existing id without writing.
    pub fn promote(
        &mut self,
        input: PromotionInput,
        source_project_hash: &str,
    ) -> Result<PromotionResult> {
        if input.confidence < self.min_confidence_for_promotion {
            return Ok(PromotionResult {
                promoted: false,
                entry_id: None,
                reason: format!(
                    "Confidence {:.2} below promotion threshold {:.2}",
                    input.confidence, self.min_confidence_for_promotion
                ),
            });
        }

        let existing: Option<String> = self
            .db
            .query_row(
                "SELECT entry_id FROM shared_entries
                 WHERE source_project_hash = ?1 AND source_entry_id = ?2",
                params![source_project_hash, input.source_entry_id],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(entry_id) = existing {
            return Ok(PromotionResult {
                promoted: false,
                entry_id: Some(entry_id),
                reason: "Source entry already promoted".to_string(),
            });
        }

        let entry_id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let embed_text = format!(
            "{}\n{}\n{}\n{}",
            input.title,
            input.symptoms.join("\n"),
            input.root_cause,
            input.solution
        );
        let embedding = match self.embedder.embed(&embed_text) {
            Ok(vector) => Some(vector_to_bytes(&vector)),
            Err(e) => {
                tracing::warn!("Shared entry embedding failed, keyword-only: {}", e);
                None
            }
        };

        self.db.execute(
            "INSERT INTO shared_entries (
                entry_id, source_project_hash, source_entry_id, title, symptoms,
                root_cause, solution, topics, technologies, confidence,
                usage_count, promoted_at, created_at, embedding
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 0, ?11, ?11, ?12)",
            params![
                entry_id,
                source_project_hash,
                input.source_entry_id,
                input.title,
                serde_json::to_string(&input.symptoms).unwrap_or_else(|_| "[]".to_string()),
                input.root_cause,
                input.solution,
                serde_json::to_string(&input.topics).unwrap_or_else(|_| "[]".to_string()),
                serde_json::to_string(&input.technologies).unwrap_or_else(|_| "[]".to_string()),
                input.confidence,
                now.to_rfc3339(),
                embedding,
            ],
        )?;

        Ok(PromotionResult {
            promoted: true,
            entry_id: Some(entry_id),
            reason: "Promoted".to_string(),
        })
    }

    /// Get an entry by id
    pub fn get(&self, entry_id: &str) -> Result<Option<SharedTroubleshootingEntry>> {
        let entry = self
            .db
            .query_row(
                "SELECT * FROM shared_entries WHERE entry_id = ?1",
                params![entry_id],
                row_to_entry,
            )
            .optional()?;
        Ok(entry)
    }

    /// Hybrid semantic + keyword search. `min_confidence` filters on entry
    /// confidence; `exclude_project_hash` removes the asking project's own
    /// contributions.
    pub fn search(
        &self,
        query: &str,
        top_k: usize,
        min_confidence: f64,
        exclude_project_hash: Option<&str>,
    ) -> Result<Vec<SharedSearchResult>> {
        let query_vector = self.embedder.embed(query).ok();

        let mut stmt = self.db.prepare("SELECT * FROM shared_entries")?;
        let mut entries: Vec<(SharedTroubleshootingEntry, Option<Vec<f32>>)> = stmt
            .query_map([], |row| {
                let entry = row_to_entry(row)?;
                let blob: Option<Vec<u8>> = row.get("embedding")?;
                Ok((entry, blob.as_deref().map(bytes_to_vector)))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        entries.retain(|(entry, _)| {
            entry.confidence >= min_confidence
                && exclude_project_hash != Some(entry.source_project_hash.as_str())
        });
        if entries.is_empty() {
            return Ok(vec![]);
        }

        // Semantic component: linear cosine scan
        let mut semantic: std::collections::HashMap<String, f64> = std::collections::HashMap::new();
        if let Some(qv) = &query_vector {
            for (entry, embedding) in &entries {
                if let Some(ev) = embedding {
                    let sim = f64::from(cosine_similarity(qv, ev)).max(0.0);
                    semantic.insert(entry.entry_id.clone(), sim);
                }
            }
        }

        // Keyword component: FTS rank position, best first
        let mut keyword: std::collections::HashMap<String, f64> = std::collections::HashMap::new();
        let fts_query: String = query
            .split_whitespace()
            .map(|t| t.chars().filter(|c| c.is_alphanumeric()).collect::<String>())
            .filter(|t| !t.is_empty())
            .map(|t| format!("\"{}\"*", t))
            .collect::<Vec<_>>()
            .join(" ");
        if !fts_query.is_empty() {
            let mut stmt = self.db.prepare(
                "SELECT entry_id FROM shared_fts WHERE shared_fts MATCH ?1 ORDER BY rank LIMIT ?2",
            )?;
            let ids: Vec<String> = stmt
                .query_map(params![fts_query, (top_k * 2) as i64], |row| row.get(0))
                .map(|rows| rows.filter_map(|r| r.ok()).collect())
                .unwrap_or_default();
            let n = ids.len() as f64;
            for (i, id) in ids.into_iter().enumerate() {
                keyword.insert(id, (n - i as f64) / n);
            }
        }

        let mut results: Vec<SharedSearchResult> = entries
            .into_iter()
            .map(|(entry, _)| {
                let sem = semantic.get(&entry.entry_id).copied().unwrap_or(0.0);
                let kw = keyword.get(&entry.entry_id).copied().unwrap_or(0.0);
                SharedSearchResult {
                    score: SEMANTIC_WEIGHT * sem + KEYWORD_WEIGHT * kw,
                    entry,
                }
            })
            .filter(|r| r.score > 0.0)
            .collect();
        results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        results.truncate(top_k);
        Ok(results)
    }

    /// Bump an entry's usage counters
    pub fn record_usage(&mut self, entry_id: &str) -> Result<()> {
        let changed = self.db.execute(
            "UPDATE shared_entries
             SET usage_count = usage_count + 1, last_used_at = ?2
             WHERE entry_id = ?1",
            params![entry_id, Utc::now().to_rfc3339()],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(entry_id.to_string()));
        }
        Ok(())
    }

    /// Store-wide counters
    pub fn stats(&self) -> Result<SharedStats> {
        let (entries, total_usage, avg_confidence) = self.db.query_row(
            "SELECT COUNT(*), COALESCE(SUM(usage_count), 0), COALESCE(AVG(confidence), 0.0)
             FROM shared_entries",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        Ok(SharedStats {
            entries,
            total_usage,
            avg_confidence,
        })
    }
}

impl SharedStoreHandle {
    /// Run `f` under the store lock
    pub fn with<T>(&self, f: impl FnOnce(&mut SharedStore) -> Result<T>) -> Result<T> {
        let mut guard = self
            .0
            .lock()
            .map_err(|_| StoreError::Unavailable("Shared store lock poisoned".into()))?;
        f(&mut guard)
    }
}

fn row_to_entry(row: &rusqlite::Row) -> rusqlite::Result<SharedTroubleshootingEntry> {
    let symptoms: String = row.get("symptoms")?;
    let topics: String = row.get("topics")?;
    let technologies: String = row.get("technologies")?;
    let promoted_at: String = row.get("promoted_at")?;
    let created_at: String = row.get("created_at")?;
    let last_used_at: Option<String> = row.get("last_used_at")?;
    Ok(SharedTroubleshootingEntry {
        entry_id: row.get("entry_id")?,
        source_project_hash: row.get("source_project_hash")?,
        source_entry_id: row.get("source_entry_id")?,
        title: row.get("title")?,
        symptoms: serde_json::from_str(&symptoms).unwrap_or_default(),
        root_cause: row.get("root_cause")?,
        solution: row.get("solution")?,
        topics: serde_json::from_str(&topics).unwrap_or_default(),
        technologies: serde_json::from_str(&technologies).unwrap_or_default(),
        confidence: row.get("confidence")?,
        usage_count: row.get("usage_count")?,
        last_used_at: last_used_at.and_then(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|dt| dt.with_timezone(&Utc))
                .ok()
        }),
        promoted_at: parse_required(&promoted_at)?,
        created_at: parse_required(&created_at)?,
    })
}

fn parse_required(s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
            )
        })
}

fn vector_to_bytes(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn bytes_to_vector(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

// ============================================================================
// TESTS
// ============================================================================
