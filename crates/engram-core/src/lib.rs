//! # Engram Core
//!
//! Embedded conversational memory engine for AI coding assistants:
//!
//! - **Append-only EventStore**: SQLite WAL log with idempotent,
//!   content-addressed ingestion and FTS5 keyword search
//! - **Outbox pipeline**: durable work queue decoupling fast appends from
//!   embedding and vector indexing, single-writer over the vector store
//! - **Hybrid retrieval**: HNSW vector search fused with keyword rank,
//!   recency, and event-type signals into a calibrated confidence verdict
//! - **Graduation**: five-level promotion (L0..L4) driven by observed
//!   usefulness, with insight extraction as a side product
//! - **Endless mode**: sliding working set, topic-grouped consolidation
//!   into long-term memories, and continuity scoring between contexts
//! - **Project isolation**: per-project stores routed by path hash, plus
//!   an optional cross-project shared store
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use engram_core::prelude::*;
//!
//! let service = MemoryService::open(dir, MemoryConfig::default(), None, None)?;
//! service.append_event(EventType::UserPrompt, "session-1", "How do I...?", json!(null))?;
//! service.drain_outbox();
//!
//! let opts = service.retrieve_options();
//! let result = service.retrieve("rate limiting", &opts);
//! println!("{}", result.context);
//! ```
//!
//! ## Feature Flags
//!
//! - `embeddings` (default): local embedding generation with fastembed
//! - `vector-search` (default): HNSW vector search with USearch
//! - `bundled-sqlite` (default): compile SQLite into the binary

// ============================================================================
// MODULES
// ============================================================================

pub mod canonical;
pub mod config;
pub mod embeddings;
pub mod endless;
pub mod events;
pub mod graduation;
pub mod matcher;
pub mod privacy;
pub mod shared;
pub mod storage;

#[cfg(feature = "vector-search")]
pub mod search;

#[cfg(feature = "vector-search")]
pub mod outbox;

#[cfg(feature = "vector-search")]
pub mod retriever;

#[cfg(feature = "vector-search")]
pub mod router;

#[cfg(feature = "vector-search")]
pub mod service;

// ============================================================================
// PUBLIC API RE-EXPORTS
// ============================================================================

// Domain types
pub use events::{
    AppendInput, AppendResult, ConsolidatedMemory, ContinuityRecord, EngineMode, Event, EventType,
    Insight, InsightKind, MemoryLevel, OutboxJob, OutboxStatus, Session, SessionUpdate,
    TransitionType, WorkingSetItem,
};

// Canonical keys
pub use canonical::{KeyContext, canonical_key, dedupe_key};

// Configuration
pub use config::{ConfigError, EmbeddingProvider, MemoryConfig, PrivateTagFormat};

// Storage layer
pub use storage::{AccessStats, EventStore, Result, StoreError, StoreStats};

// Embeddings
pub use embeddings::{
    EMBEDDING_DIMENSIONS, Embedder, EmbeddingError, HashingEmbedder, cosine_similarity,
};

#[cfg(feature = "embeddings")]
pub use embeddings::LocalEmbedder;

// Matching
pub use matcher::{MatchCandidate, MatchConfidence, MatchResult, Matcher, ScoredCandidate};

// Privacy
pub use privacy::{FilterMetadata, FilterOutcome, PrivacyFilter};

// Graduation
pub use graduation::{
    CriteriaTable, GraduationCriteria, GraduationPipeline, GraduationReport, extract_insights,
};

// Endless mode
pub use endless::{
    ConsolidationReport, Consolidator, ContextSnapshot, ContinuityScorer, WorkingSet,
    WorkingSetView, extract_topics,
};

// Shared store
pub use shared::{
    PromotionInput, PromotionResult, SharedSearchResult, SharedStats, SharedStore,
    SharedStoreHandle, SharedTroubleshootingEntry,
};

// Vector search (when feature enabled)
#[cfg(feature = "vector-search")]
pub use search::{VectorRecord, VectorSearchError, VectorSearchResult, VectorStore};

#[cfg(feature = "vector-search")]
pub use outbox::{BatchStats, EMBEDDING_VERSION, OutboxWorker};

#[cfg(feature = "vector-search")]
pub use retriever::{
    RetrieveOptions, RetrieveResult, RetrievedMemory, Retriever, SessionContext, estimate_tokens,
};

#[cfg(feature = "vector-search")]
pub use router::{ProjectRouter, SessionRegistry, project_hash, project_storage_path};

#[cfg(feature = "vector-search")]
pub use service::MemoryService;

// ============================================================================
// VERSION INFO
// ============================================================================

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default embedding model
pub const DEFAULT_EMBEDDING_MODEL: &str = "BAAI/bge-small-en-v1.5";

// ============================================================================
// PRELUDE
// ============================================================================

/// Convenient imports for common usage
pub mod prelude {
    pub use crate::{
        AppendInput, AppendResult, EngineMode, Event, EventStore, EventType, MatchConfidence,
        Matcher, MemoryConfig, MemoryLevel, PrivacyFilter, Result, StoreError,
    };

    #[cfg(feature = "vector-search")]
    pub use crate::{
        MemoryService, OutboxWorker, ProjectRouter, RetrieveOptions, Retriever, VectorStore,
    };

    pub use crate::{ContextSnapshot, GraduationPipeline, SharedStore, WorkingSet};
}
