//! Vector Store
//!
//! HNSW index over event embeddings using USearch, with a metadata record
//! per vector so search hits can be rendered without touching the event
//! store. Cosine distance; scores are `1 - distance/2`, in [0, 1].
//!
//! Single-writer: only the outbox worker mutates the store. Record ids are
//! derived from `(item_kind, item_id, embedding_version)`, so a retried
//! upsert deterministically replaces the previous record.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use usearch::{Index, IndexOptions, MetricKind, ScalarKind};

use crate::events::EventType;

/// Index file name inside the vector directory
const INDEX_FILE: &str = "index.usearch";

/// Sidecar file holding records and key mappings
const RECORDS_FILE: &str = "records.json";

/// HNSW connectivity parameter
const DEFAULT_CONNECTIVITY: usize = 16;

/// HNSW expansion factor for index building
const DEFAULT_EXPANSION_ADD: usize = 128;

/// HNSW expansion factor for search
const DEFAULT_EXPANSION_SEARCH: usize = 64;

/// Oversampling factor applied before post-filtering (session, min_score)
const FILTER_OVERSAMPLE: usize = 2;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Vector store error type
#[non_exhaustive]
#[derive(Debug, Clone, thiserror::Error)]
pub enum VectorSearchError {
    /// The HNSW index could not be built, grown, or mutated
    #[error("Vector index error: {0}")]
    Index(String),
    /// A query against the index failed
    #[error("Vector query error: {0}")]
    Query(String),
    /// The index or its sidecar could not be read or written
    #[error("Vector store I/O error: {0}")]
    Persistence(String),
    /// A vector's length does not match the store's dimensionality
    #[error("Vector has {got} dimensions, store expects {expected}")]
    DimensionMismatch { expected: usize, got: usize },
}

// ============================================================================
// RECORDS
// ============================================================================

/// A vector record: the embedding plus enough metadata to score and render
/// a hit. The `vector` field is emptied once the embedding has been handed
/// to the index; only the metadata is retained and persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VectorRecord {
    /// Derived id: `"{kind}:{item_id}:v{version}"`
    pub id: String,
    pub event_id: String,
    pub session_id: String,
    pub event_type: EventType,
    /// Leading slice of the content, for rendering
    pub content_preview: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vector: Vec<f32>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Derive the deterministic record id for an indexed item
pub fn record_id(kind: &str, item_id: &str, embedding_version: u32) -> String {
    format!("{}:{}:v{}", kind, item_id, embedding_version)
}

/// A search hit
#[derive(Debug, Clone)]
pub struct VectorSearchResult {
    pub record: VectorRecord,
    /// `1 - cosine_distance/2`, in [0, 1]
    pub score: f32,
}

/// Sidecar payload persisted next to the usearch index
#[derive(Serialize, Deserialize)]
struct Sidecar {
    records: HashMap<String, VectorRecord>,
    key_to_id: HashMap<String, u64>,
    next_id: u64,
}

// ============================================================================
// VECTOR STORE
// ============================================================================

/// HNSW vector store with metadata records
pub struct VectorStore {
    dir: PathBuf,
    dimensions: usize,
    /// Created on first insert so empty installs never churn files
    index: Option<Index>,
    records: HashMap<String, VectorRecord>,
    event_to_record: HashMap<String, String>,
    key_to_id: HashMap<String, u64>,
    id_to_key: HashMap<u64, String>,
    next_id: u64,
}

impl VectorStore {
    /// Open the store in `dir`, loading a persisted index when present.
    /// A missing or corrupt index falls back to empty; the outbox
    /// repopulates it.
    pub fn open(dir: &Path, dimensions: usize) -> Result<Self, VectorSearchError> {
        let mut store = Self {
            dir: dir.to_path_buf(),
            dimensions,
            index: None,
            records: HashMap::new(),
            event_to_record: HashMap::new(),
            key_to_id: HashMap::new(),
            id_to_key: HashMap::new(),
            next_id: 0,
        };
        if let Err(e) = store.load() {
            tracing::warn!("Vector index load failed, starting empty: {}", e);
            store.index = None;
            store.records.clear();
            store.event_to_record.clear();
            store.key_to_id.clear();
            store.id_to_key.clear();
            store.next_id = 0;
        }
        Ok(store)
    }

    fn make_index(&self) -> Result<Index, VectorSearchError> {
        let options = IndexOptions {
            dimensions: self.dimensions,
            metric: MetricKind::Cos,
            quantization: ScalarKind::F32,
            connectivity: DEFAULT_CONNECTIVITY,
            expansion_add: DEFAULT_EXPANSION_ADD,
            expansion_search: DEFAULT_EXPANSION_SEARCH,
            multi: false,
        };
        Index::new(&options).map_err(|e| VectorSearchError::Index(e.to_string()))
    }

    fn ensure_index(&mut self) -> Result<&Index, VectorSearchError> {
        if self.index.is_none() {
            self.index = Some(self.make_index()?);
        }
        Ok(self.index.as_ref().expect("index set above"))
    }

    /// Number of indexed vectors
    pub fn count(&self) -> usize {
        self.records.len()
    }

    /// Whether a vector exists for this event
    pub fn exists(&self, event_id: &str) -> bool {
        self.event_to_record.contains_key(event_id)
    }

    /// Declared dimensionality
    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Insert or replace one record. Replacement is keyed by the derived
    /// record id, so retried jobs overwrite rather than duplicate.
    pub fn upsert(&mut self, mut record: VectorRecord) -> Result<(), VectorSearchError> {
        if record.vector.len() != self.dimensions {
            return Err(VectorSearchError::DimensionMismatch {
                expected: self.dimensions,
                got: record.vector.len(),
            });
        }
        let vector = std::mem::take(&mut record.vector);
        self.ensure_index()?;
        let index = self.index.as_ref().expect("index ensured above");

        let key = match self.key_to_id.get(&record.id) {
            Some(&existing) => {
                index
                    .remove(existing)
                    .map_err(|e| VectorSearchError::Index(e.to_string()))?;
                existing
            }
            None => {
                let key = self.next_id;
                self.next_id += 1;
                key
            }
        };

        // usearch requires reserved capacity before add
        if index.size() >= index.capacity() {
            let new_capacity = std::cmp::max(index.capacity() * 2, 16);
            index
                .reserve(new_capacity)
                .map_err(|e| VectorSearchError::Index(e.to_string()))?;
        }
        index
            .add(key, &vector)
            .map_err(|e| VectorSearchError::Index(e.to_string()))?;

        self.key_to_id.insert(record.id.clone(), key);
        self.id_to_key.insert(key, record.id.clone());
        self.event_to_record
            .insert(record.event_id.clone(), record.id.clone());
        self.records.insert(record.id.clone(), record);
        Ok(())
    }

    /// Insert or replace a batch, then persist
    pub fn upsert_batch(&mut self, records: Vec<VectorRecord>) -> Result<(), VectorSearchError> {
        for record in records {
            self.upsert(record)?;
        }
        self.save()
    }

    /// Remove the vector for an event
    pub fn delete(&mut self, event_id: &str) -> Result<bool, VectorSearchError> {
        let Some(record_id) = self.event_to_record.remove(event_id) else {
            return Ok(false);
        };
        self.records.remove(&record_id);
        if let Some(key) = self.key_to_id.remove(&record_id) {
            self.id_to_key.remove(&key);
            if let Some(index) = &self.index {
                index
                    .remove(key)
                    .map_err(|e| VectorSearchError::Index(e.to_string()))?;
            }
        }
        Ok(true)
    }

    /// Top-K cosine search. `min_score` filters hits below the threshold;
    /// `session_id` restricts hits to one session (oversampled before the
    /// filter so the caller still gets up to `limit` results).
    pub fn search(
        &self,
        query: &[f32],
        limit: usize,
        min_score: f32,
        session_id: Option<&str>,
    ) -> Result<Vec<VectorSearchResult>, VectorSearchError> {
        if query.len() != self.dimensions {
            return Err(VectorSearchError::DimensionMismatch {
                expected: self.dimensions,
                got: query.len(),
            });
        }
        let Some(index) = &self.index else {
            return Ok(vec![]);
        };
        if self.records.is_empty() {
            return Ok(vec![]);
        }

        let fetch = if session_id.is_some() {
            limit * FILTER_OVERSAMPLE
        } else {
            limit
        };
        let matches = index
            .search(query, fetch)
            .map_err(|e| VectorSearchError::Query(e.to_string()))?;

        let mut results = Vec::with_capacity(matches.keys.len());
        for (key, distance) in matches.keys.iter().zip(matches.distances.iter()) {
            let Some(record_id) = self.id_to_key.get(key) else {
                continue;
            };
            let Some(record) = self.records.get(record_id) else {
                continue;
            };
            let score = 1.0 - distance / 2.0;
            if score < min_score {
                continue;
            }
            if let Some(session) = session_id {
                if record.session_id != session {
                    continue;
                }
            }
            results.push(VectorSearchResult {
                record: record.clone(),
                score,
            });
            if results.len() >= limit {
                break;
            }
        }
        Ok(results)
    }

    /// Persist the index and its sidecar. Writes go through a temp file +
    /// rename so readers never observe a half-written sidecar.
    pub fn save(&self) -> Result<(), VectorSearchError> {
        let Some(index) = &self.index else {
            return Ok(());
        };
        std::fs::create_dir_all(&self.dir)
            .map_err(|e| VectorSearchError::Persistence(e.to_string()))?;

        let index_path = self.dir.join(INDEX_FILE);
        let path_str = index_path
            .to_str()
            .ok_or_else(|| VectorSearchError::Persistence("Invalid path".to_string()))?;
        index
            .save(path_str)
            .map_err(|e| VectorSearchError::Persistence(e.to_string()))?;

        let sidecar = Sidecar {
            records: self.records.clone(),
            key_to_id: self.key_to_id.clone(),
            next_id: self.next_id,
        };
        let payload = serde_json::to_string(&sidecar)
            .map_err(|e| VectorSearchError::Persistence(e.to_string()))?;
        let tmp = self.dir.join(format!("{}.tmp", RECORDS_FILE));
        std::fs::write(&tmp, payload)
            .map_err(|e| VectorSearchError::Persistence(e.to_string()))?;
        std::fs::rename(&tmp, self.dir.join(RECORDS_FILE))
            .map_err(|e| VectorSearchError::Persistence(e.to_string()))?;
        Ok(())
    }

    fn load(&mut self) -> Result<(), VectorSearchError> {
        let index_path = self.dir.join(INDEX_FILE);
        let records_path = self.dir.join(RECORDS_FILE);
        if !index_path.exists() || !records_path.exists() {
            return Ok(());
        }

        let raw = std::fs::read_to_string(&records_path)
            .map_err(|e| VectorSearchError::Persistence(e.to_string()))?;
        let sidecar: Sidecar = serde_json::from_str(&raw)
            .map_err(|e| VectorSearchError::Persistence(e.to_string()))?;

        let index = self.make_index()?;
        let path_str = index_path
            .to_str()
            .ok_or_else(|| VectorSearchError::Persistence("Invalid path".to_string()))?;
        index
            .load(path_str)
            .map_err(|e| VectorSearchError::Persistence(e.to_string()))?;

        self.id_to_key = sidecar
            .key_to_id
            .iter()
            .map(|(k, &v)| (v, k.clone()))
            .collect();
        self.event_to_record = sidecar
            .records
            .values()
            .map(|r| (r.event_id.clone(), r.id.clone()))
            .collect();
        self.records = sidecar.records;
        self.key_to_id = sidecar.key_to_id;
        self.next_id = sidecar.next_id;
        self.index = Some(index);
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const DIMS: usize = 8;

    fn record(event_id: &str, session: &str, vector: Vec<f32>) -> VectorRecord {
        VectorRecord {
            id: record_id("event", event_id, 1),
            event_id: event_id.to_string(),
            session_id: session.to_string(),
            event_type: EventType::UserPrompt,
            content_preview: format!("content of {}", event_id),
            vector,
            timestamp: Utc::now(),
            metadata: serde_json::Value::Null,
        }
    }

    fn basis(axis: usize) -> Vec<f32> {
        let mut v = vec![0.0; DIMS];
        v[axis] = 1.0;
        v
    }

    #[test]
    fn test_record_id_derivation() {
        assert_eq!(record_id("event", "abc", 1), "event:abc:v1");
    }

    #[test]
    fn test_upsert_and_search() {
        let dir = TempDir::new().unwrap();
        let mut store = VectorStore::open(dir.path(), DIMS).unwrap();

        store.upsert(record("e1", "s1", basis(0))).unwrap();
        store.upsert(record("e2", "s1", basis(1))).unwrap();
        assert_eq!(store.count(), 2);
        assert!(store.exists("e1"));
        assert!(!store.exists("e9"));

        let hits = store.search(&basis(0), 2, 0.0, None).unwrap();
        assert_eq!(hits[0].record.event_id, "e1");
        assert!((hits[0].score - 1.0).abs() < 0.01);
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let mut store = VectorStore::open(dir.path(), DIMS).unwrap();

        store.upsert(record("e1", "s1", basis(0))).unwrap();
        store.upsert(record("e1", "s1", basis(1))).unwrap();
        assert_eq!(store.count(), 1);

        let hits = store.search(&basis(1), 1, 0.0, None).unwrap();
        assert_eq!(hits[0].record.event_id, "e1");
        assert!((hits[0].score - 1.0).abs() < 0.01);
    }

    #[test]
    fn test_score_range_for_opposite_vectors() {
        let dir = TempDir::new().unwrap();
        let mut store = VectorStore::open(dir.path(), DIMS).unwrap();

        let mut opposite = basis(0);
        opposite[0] = -1.0;
        store.upsert(record("e1", "s1", opposite)).unwrap();

        // Opposite vector: cosine distance 2 → score 0
        let hits = store.search(&basis(0), 1, 0.0, None).unwrap();
        assert!(hits[0].score.abs() < 0.01);
    }

    #[test]
    fn test_min_score_filters() {
        let dir = TempDir::new().unwrap();
        let mut store = VectorStore::open(dir.path(), DIMS).unwrap();
        store.upsert(record("e1", "s1", basis(0))).unwrap();
        store.upsert(record("e2", "s1", basis(1))).unwrap();

        // Orthogonal vector scores 0.5; threshold 0.9 keeps only the match
        let hits = store.search(&basis(0), 10, 0.9, None).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record.event_id, "e1");
    }

    #[test]
    fn test_session_filter() {
        let dir = TempDir::new().unwrap();
        let mut store = VectorStore::open(dir.path(), DIMS).unwrap();
        store.upsert(record("e1", "s1", basis(0))).unwrap();
        store.upsert(record("e2", "s2", basis(0))).unwrap();

        let hits = store.search(&basis(0), 10, 0.0, Some("s2")).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record.event_id, "e2");
    }

    #[test]
    fn test_delete() {
        let dir = TempDir::new().unwrap();
        let mut store = VectorStore::open(dir.path(), DIMS).unwrap();
        store.upsert(record("e1", "s1", basis(0))).unwrap();

        assert!(store.delete("e1").unwrap());
        assert!(!store.delete("e1").unwrap());
        assert_eq!(store.count(), 0);
        assert!(store.search(&basis(0), 10, 0.0, None).unwrap().is_empty());
    }

    #[test]
    fn test_dimension_mismatch() {
        let dir = TempDir::new().unwrap();
        let mut store = VectorStore::open(dir.path(), DIMS).unwrap();
        let result = store.upsert(record("e1", "s1", vec![1.0, 2.0]));
        assert!(matches!(
            result,
            Err(VectorSearchError::DimensionMismatch {
                expected: DIMS,
                got: 2
            })
        ));
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        {
            let mut store = VectorStore::open(dir.path(), DIMS).unwrap();
            store
                .upsert_batch(vec![record("e1", "s1", basis(0)), record("e2", "s1", basis(1))])
                .unwrap();
        }
        let store = VectorStore::open(dir.path(), DIMS).unwrap();
        assert_eq!(store.count(), 2);
        assert!(store.exists("e1"));
        let hits = store.search(&basis(1), 1, 0.0, None).unwrap();
        assert_eq!(hits[0].record.event_id, "e2");
    }

    #[test]
    fn test_corrupt_sidecar_falls_back_to_empty() {
        let dir = TempDir::new().unwrap();
        {
            let mut store = VectorStore::open(dir.path(), DIMS).unwrap();
            store.upsert_batch(vec![record("e1", "s1", basis(0))]).unwrap();
        }
        std::fs::write(dir.path().join(RECORDS_FILE), "{not json").unwrap();
        let store = VectorStore::open(dir.path(), DIMS).unwrap();
        assert_eq!(store.count(), 0);
    }

    #[test]
    fn test_empty_store_search() {
        let dir = TempDir::new().unwrap();
        let store = VectorStore::open(dir.path(), DIMS).unwrap();
        assert!(store.search(&basis(0), 10, 0.0, None).unwrap().is_empty());
    }
}
