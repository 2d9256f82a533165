//! Memory Service
//!
//! Wires one project's subsystems together: privacy filter → event store →
//! outbox on the write path, embedder → vector store → matcher on the read
//! path, plus the graduation pipeline and the endless-mode machinery.
//! One service instance is the single writer for its database file.

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::Utc;

use crate::config::{EmbeddingProvider, MemoryConfig};
use crate::embeddings::Embedder;
use crate::endless::{Consolidator, ContextSnapshot, ContinuityScorer, WorkingSet, WorkingSetView};
use crate::events::{
    AppendInput, AppendResult, EngineMode, EventType, MemoryLevel, SessionUpdate, TransitionType,
};
use crate::graduation::{CriteriaTable, GraduationPipeline};
use crate::matcher::Matcher;
use crate::outbox::{BatchStats, OutboxWorker};
use crate::privacy::PrivacyFilter;
use crate::retriever::{RetrieveOptions, RetrieveResult, Retriever};
use crate::search::VectorStore;
use crate::shared::{PromotionInput, PromotionResult, SharedStoreHandle};
use crate::storage::{EventStore, Result, StoreError, StoreStats};

/// Endless-config key the engine mode is persisted under
const MODE_KEY: &str = "mode";

/// Database file name inside a project directory
const DB_FILE: &str = "events.db";

/// Vector index directory inside a project directory
const VECTORS_DIR: &str = "vectors";

/// Working-set relevance assigned to user prompts
const PROMPT_RELEVANCE: f64 = 1.0;

/// Working-set relevance assigned to everything else
const DEFAULT_RELEVANCE: f64 = 0.8;

/// One project's memory engine
pub struct MemoryService {
    config: MemoryConfig,
    store: Arc<EventStore>,
    privacy: PrivacyFilter,
    retriever: Retriever,
    graduation: Arc<GraduationPipeline>,
    outbox: Arc<OutboxWorker>,
    consolidator: Arc<Consolidator>,
    working_set: WorkingSet,
    continuity: ContinuityScorer,
    shared: Option<Arc<SharedStoreHandle>>,
    project_hash: Option<String>,
}

impl MemoryService {
    /// Open the full service for a project directory with the configured
    /// embedder
    pub fn open(
        dir: &Path,
        config: MemoryConfig,
        project_hash: Option<String>,
        shared: Option<Arc<SharedStoreHandle>>,
    ) -> Result<Arc<Self>> {
        let embedder = make_embedder(&config);
        Self::open_with_embedder(dir, config, project_hash, shared, embedder)
    }

    /// Open with an explicit embedder implementation
    pub fn open_with_embedder(
        dir: &Path,
        config: MemoryConfig,
        project_hash: Option<String>,
        shared: Option<Arc<SharedStoreHandle>>,
        embedder: Arc<dyn Embedder>,
    ) -> Result<Arc<Self>> {
        let store = Arc::new(EventStore::open(
            &dir.join(DB_FILE),
            config.worker.max_retries,
        )?);
        let vectors = Arc::new(Mutex::new(
            VectorStore::open(&dir.join(VECTORS_DIR), embedder.dimensions())
                .map_err(|e| StoreError::Unavailable(e.to_string()))?,
        ));

        let graduation = GraduationPipeline::new(
            Arc::clone(&store),
            CriteriaTable::default(),
            config.graduation.clone(),
            config.features.insight_extraction,
        );
        let outbox = OutboxWorker::new(
            Arc::clone(&store),
            Arc::clone(&embedder),
            Arc::clone(&vectors),
            config.worker.clone(),
        );
        let consolidator = Consolidator::new(
            Arc::clone(&store),
            config.endless.consolidation.clone(),
            config.endless.working_set.clone(),
        );
        let working_set = WorkingSet::new(Arc::clone(&store), config.endless.working_set.clone());
        let continuity = ContinuityScorer::new(Arc::clone(&store), config.endless.continuity.clone());
        let retriever = Retriever::new(
            Arc::clone(&store),
            vectors,
            embedder,
            Matcher::new(config.matching.clone()),
            Arc::clone(&graduation),
            shared.clone(),
            project_hash.clone(),
        );

        let privacy = PrivacyFilter::new(config.privacy.clone());
        let service = Arc::new(Self {
            config,
            store,
            privacy,
            retriever,
            graduation,
            outbox,
            consolidator,
            working_set,
            continuity,
            shared,
            project_hash,
        });

        // Adopt a persisted mode from a previous run; absent one, persist
        // the configured default
        match service.store.get_endless_config(MODE_KEY)? {
            Some(raw) => {
                let mode = EngineMode::parse_name(&raw);
                if mode != service.config.mode {
                    tracing::debug!("Using persisted mode {} over configured", mode.as_str());
                }
            }
            None => {
                service
                    .store
                    .set_endless_config(MODE_KEY, service.config.mode.as_str())?;
            }
        }

        Ok(service)
    }

    /// The underlying event store
    pub fn store(&self) -> &Arc<EventStore> {
        &self.store
    }

    /// The graduation pipeline
    pub fn graduation(&self) -> &Arc<GraduationPipeline> {
        &self.graduation
    }

    /// The shared store, when configured
    pub fn shared(&self) -> Option<&Arc<SharedStoreHandle>> {
        self.shared.as_ref()
    }

    /// This project's hash, when the service is project-scoped
    pub fn project_hash(&self) -> Option<&str> {
        self.project_hash.as_deref()
    }

    /// Effective configuration
    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    // ========================================================================
    // WRITE PATH
    // ========================================================================

    /// Ingest one event: privacy filter, idempotent append, outbox
    /// enqueue, and (in endless mode) a working-set add
    pub fn append_event(
        &self,
        event_type: EventType,
        session_id: &str,
        content: &str,
        metadata: serde_json::Value,
    ) -> Result<AppendResult> {
        let filtered = self.privacy.apply(content);

        let mut metadata = match metadata {
            serde_json::Value::Object(map) => map,
            serde_json::Value::Null => serde_json::Map::new(),
            other => {
                let mut map = serde_json::Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        if let Ok(filter_meta) = serde_json::to_value(&filtered.metadata) {
            metadata.insert("privacy".to_string(), filter_meta);
        }

        let content = filtered.content;
        let mut input = AppendInput::new(event_type, session_id, content.clone());
        input.metadata = serde_json::Value::Object(metadata);
        input.project = self.project_hash.clone();

        let result = self.store.append(input)?;
        if !result.is_duplicate {
            self.store.enqueue_for_embedding(&result.event_id, &content)?;

            if self.mode()? == EngineMode::Endless {
                let relevance = if event_type == EventType::UserPrompt {
                    PROMPT_RELEVANCE
                } else {
                    DEFAULT_RELEVANCE
                };
                if let Err(e) = self.working_set.add(&result.event_id, relevance) {
                    tracing::warn!("Working-set add failed: {}", e);
                }
            }
        }
        Ok(result)
    }

    /// Bump use counters for memories actually injected into a prompt
    pub fn increment_access_count(&self, ids: &[String]) -> Result<()> {
        self.store.increment_access_count(ids)
    }

    /// Close a session, optionally attaching a summary. The summary is
    /// also appended as a `session_summary` event so it gets indexed.
    pub fn end_session(&self, session_id: &str, summary: Option<&str>) -> Result<()> {
        self.store.upsert_session(
            session_id,
            SessionUpdate {
                ended_at: Some(Utc::now()),
                summary: summary.map(|s| s.to_string()),
                ..Default::default()
            },
        )?;
        if let Some(summary) = summary {
            if self.config.features.session_summary {
                self.append_event(
                    EventType::SessionSummary,
                    session_id,
                    summary,
                    serde_json::Value::Null,
                )?;
            }
        }
        Ok(())
    }

    // ========================================================================
    // READ PATH
    // ========================================================================

    /// Retrieve relevant memories for a query
    pub fn retrieve(&self, query: &str, opts: &RetrieveOptions) -> RetrieveResult {
        self.retriever.retrieve(query, opts)
    }

    /// Retrieval options seeded from this service's configuration
    pub fn retrieve_options(&self) -> RetrieveOptions {
        let mut opts = RetrieveOptions::from_config(&self.config.retrieval);
        opts.include_shared = self.shared.is_some() && self.config.features.shared_store.search_shared;
        opts
    }

    /// Current level of an event
    pub fn get_event_level(&self, event_id: &str) -> Result<MemoryLevel> {
        self.graduation.get_event_level(event_id)
    }

    /// Store-wide counters
    pub fn stats(&self) -> Result<StoreStats> {
        self.store.stats()
    }

    // ========================================================================
    // WORKERS
    // ========================================================================

    /// Start the background workers appropriate for the current mode
    pub fn start_workers(self: &Arc<Self>) -> Result<()> {
        self.outbox.start();
        self.graduation.start();
        if self.mode()? == EngineMode::Endless {
            self.consolidator.start();
        }
        Ok(())
    }

    /// Stop all background workers
    pub fn stop_workers(&self) {
        self.outbox.stop();
        self.graduation.stop();
        self.consolidator.stop();
    }

    /// Drain the outbox synchronously
    pub fn drain_outbox(&self) -> BatchStats {
        self.outbox.process_all()
    }

    /// Force one graduation pass
    pub fn run_graduation(&self) -> Result<crate::graduation::GraduationReport> {
        self.graduation.run_once(true)
    }

    /// Force one consolidation pass
    pub fn run_consolidation(&self) -> Result<crate::endless::ConsolidationReport> {
        self.consolidator.run_once(true)
    }

    // ========================================================================
    // ENDLESS MODE
    // ========================================================================

    /// The persisted engine mode
    pub fn mode(&self) -> Result<EngineMode> {
        Ok(self
            .store
            .get_endless_config(MODE_KEY)?
            .map(|raw| EngineMode::parse_name(&raw))
            .unwrap_or(self.config.mode))
    }

    /// Switch modes. Entering endless mode starts the consolidation
    /// worker; leaving stops it but preserves all endless-mode data.
    pub fn set_mode(self: &Arc<Self>, mode: EngineMode) -> Result<()> {
        self.store.set_endless_config(MODE_KEY, mode.as_str())?;
        match mode {
            EngineMode::Endless => self.consolidator.start(),
            EngineMode::Session => self.consolidator.stop(),
        }
        tracing::info!("Engine mode set to {}", mode.as_str());
        Ok(())
    }

    /// The hydrated working set
    pub fn working_set(&self) -> Result<WorkingSetView> {
        self.working_set.view()
    }

    /// Score a new context snapshot against the previous one
    pub fn score_continuity(&self, snapshot: &ContextSnapshot) -> Result<(f64, TransitionType)> {
        self.continuity.score(snapshot)
    }

    // ========================================================================
    // SHARED STORE
    // ========================================================================

    /// Promote a troubleshooting entry into the shared store. Gated on the
    /// shared store being configured; `auto` promotions additionally
    /// require the `auto_promote` feature flag.
    pub fn promote_shared(&self, input: PromotionInput, auto: bool) -> Result<PromotionResult> {
        let Some(shared) = &self.shared else {
            return Ok(PromotionResult {
                promoted: false,
                entry_id: None,
                reason: "Shared store not configured".to_string(),
            });
        };
        if auto && !self.config.features.shared_store.auto_promote {
            return Ok(PromotionResult {
                promoted: false,
                entry_id: None,
                reason: "Auto-promotion disabled".to_string(),
            });
        }
        let hash = self.project_hash.clone().unwrap_or_else(|| "global".to_string());
        shared.with(|s| s.promote(input, &hash))
    }
}

/// Pick the embedder implementation for the configured provider
fn make_embedder(config: &MemoryConfig) -> Arc<dyn Embedder> {
    if config.embedding.provider == EmbeddingProvider::Openai {
        tracing::warn!("OpenAI embedding provider is not bundled; using local embeddings");
    }
    #[cfg(feature = "embeddings")]
    {
        Arc::new(crate::embeddings::LocalEmbedder::new())
    }
    #[cfg(not(feature = "embeddings"))]
    {
        Arc::new(crate::embeddings::HashingEmbedder::default())
    }
}

// ============================================================================
// TESTS
// ============================================================================
