//! Retriever
//!
//! The read path: embed the query, gather vector and keyword candidates,
//! fuse them through the matcher, hydrate the winners from the event
//! store, and assemble a token-bounded context string for injection.
//!
//! Access accounting contract: retrieval records accesses for the
//! graduation pipeline, but never bumps `access_count`. The host calls
//! `increment_access_count` with the returned event ids once memories are
//! actually used in a prompt.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::Utc;
use lru::LruCache;

use crate::config::RetrievalConfig;
use crate::embeddings::Embedder;
use crate::events::Event;
use crate::graduation::GraduationPipeline;
use crate::matcher::{MatchCandidate, MatchConfidence, Matcher};
use crate::search::VectorStore;
use crate::shared::{SharedSearchResult, SharedStoreHandle};
use crate::storage::EventStore;

/// Query-embedding cache capacity
const QUERY_CACHE_SIZE: usize = 100;

/// Oversampling factor before fusion
const CANDIDATE_MULTIPLIER: usize = 2;

/// Neighbor content is clipped to this many bytes in context blocks
const NEIGHBOR_PREVIEW: usize = 150;

// ============================================================================
// TYPES
// ============================================================================

/// Options for one retrieval
#[derive(Debug, Clone)]
pub struct RetrieveOptions {
    pub top_k: usize,
    pub min_score: f64,
    /// Restrict candidates to this session
    pub session_id: Option<String>,
    /// Session to attribute graduation accesses to; falls back to
    /// `session_id` when unset
    pub accessing_session: Option<String>,
    pub max_tokens: usize,
    /// Fetch the neighboring events of each hit
    pub include_session_context: bool,
    /// Also query the shared store
    pub include_shared: bool,
    /// Hard deadline; once passed the retriever returns the empty context
    pub deadline: Option<Instant>,
}

impl RetrieveOptions {
    pub fn from_config(config: &RetrievalConfig) -> Self {
        Self {
            top_k: config.top_k,
            min_score: config.min_score,
            session_id: None,
            accessing_session: None,
            max_tokens: config.max_tokens,
            include_session_context: false,
            include_shared: false,
            deadline: None,
        }
    }
}

/// Neighboring events of a hit within its session
#[derive(Debug, Clone, Default)]
pub struct SessionContext {
    pub before: Option<String>,
    pub after: Option<String>,
}

/// One retrieved memory
#[derive(Debug, Clone)]
pub struct RetrievedMemory {
    pub event: Event,
    /// Fused score
    pub score: f64,
    pub vector_score: f64,
    pub session_context: Option<SessionContext>,
}

/// The retrieval result. `event_ids` is what the host feeds back into
/// `increment_access_count` when the context is actually used.
#[derive(Debug, Clone)]
pub struct RetrieveResult {
    pub memories: Vec<RetrievedMemory>,
    pub confidence: MatchConfidence,
    pub gap: Option<f64>,
    pub context: String,
    pub event_ids: Vec<String>,
    pub shared: Vec<SharedSearchResult>,
}

impl RetrieveResult {
    pub fn empty() -> Self {
        Self {
            memories: vec![],
            confidence: MatchConfidence::None,
            gap: None,
            context: String::new(),
            event_ids: vec![],
            shared: vec![],
        }
    }
}

/// Estimated token count of a context string (`⌈len/4⌉`)
pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(4)
}

// ============================================================================
// RETRIEVER
// ============================================================================

/// The hybrid retriever
pub struct Retriever {
    store: Arc<EventStore>,
    vectors: Arc<Mutex<VectorStore>>,
    embedder: Arc<dyn Embedder>,
    matcher: Matcher,
    graduation: Arc<GraduationPipeline>,
    shared: Option<Arc<SharedStoreHandle>>,
    /// This project's hash, excluded from shared-store hits
    project_hash: Option<String>,
    query_cache: Mutex<LruCache<String, Vec<f32>>>,
}

impl Retriever {
    pub fn new(
        store: Arc<EventStore>,
        vectors: Arc<Mutex<VectorStore>>,
        embedder: Arc<dyn Embedder>,
        matcher: Matcher,
        graduation: Arc<GraduationPipeline>,
        shared: Option<Arc<SharedStoreHandle>>,
        project_hash: Option<String>,
    ) -> Self {
        Self {
            store,
            vectors,
            embedder,
            matcher,
            graduation,
            shared,
            project_hash,
            query_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(QUERY_CACHE_SIZE).expect("cache size is non-zero"),
            )),
        }
    }

    /// Retrieve relevant memories for a query. Errors never escape: any
    /// failure (or a blown deadline) yields the empty result.
    pub fn retrieve(&self, query: &str, opts: &RetrieveOptions) -> RetrieveResult {
        if query.trim().is_empty() || opts.top_k == 0 {
            return RetrieveResult::empty();
        }

        let Some(query_vector) = self.embed_query(query) else {
            return RetrieveResult::empty();
        };
        if deadline_blown(opts) {
            tracing::debug!("Retrieval deadline hit after embedding");
            return RetrieveResult::empty();
        }

        let fetch = opts.top_k * CANDIDATE_MULTIPLIER;
        let vector_hits = {
            let vectors = match self.vectors.lock() {
                Ok(guard) => guard,
                Err(_) => return RetrieveResult::empty(),
            };
            match vectors.search(
                &query_vector,
                fetch,
                opts.min_score as f32,
                opts.session_id.as_deref(),
            ) {
                Ok(hits) => hits,
                Err(e) => {
                    tracing::warn!("Vector search failed: {}", e);
                    return RetrieveResult::empty();
                }
            }
        };
        if deadline_blown(opts) {
            tracing::debug!("Retrieval deadline hit after vector search");
            return RetrieveResult::empty();
        }

        let keyword_hits = self.store.keyword_search(query, fetch).unwrap_or_else(|e| {
            tracing::debug!("Keyword search failed: {}", e);
            vec![]
        });

        // Union the two candidate sets; keyword rank becomes a normalized
        // positional score
        let mut candidates: Vec<MatchCandidate> = Vec::with_capacity(vector_hits.len());
        let mut seen: std::collections::HashMap<String, usize> = std::collections::HashMap::new();
        for hit in &vector_hits {
            seen.insert(hit.record.event_id.clone(), candidates.len());
            candidates.push(MatchCandidate {
                event_id: hit.record.event_id.clone(),
                vector_score: f64::from(hit.score),
                fts_score: None,
                timestamp: hit.record.timestamp,
                event_type: hit.record.event_type,
            });
        }
        let n = keyword_hits.len() as f64;
        for (i, (event, _rank)) in keyword_hits.into_iter().enumerate() {
            let fts_score = (n - i as f64) / n;
            match seen.get(&event.id) {
                Some(&idx) => candidates[idx].fts_score = Some(fts_score),
                None => {
                    if let Some(session) = &opts.session_id {
                        if &event.session_id != session {
                            continue;
                        }
                    }
                    candidates.push(MatchCandidate {
                        event_id: event.id.clone(),
                        vector_score: 0.0,
                        fts_score: Some(fts_score),
                        timestamp: event.timestamp,
                        event_type: event.event_type,
                    });
                }
            }
        }

        let match_result = self.matcher.evaluate(candidates, Utc::now());

        // Hydrate the winners, preserving rank order
        let top: Vec<_> = match_result.ranked.iter().take(opts.top_k).collect();
        let ids: Vec<String> = top.iter().map(|c| c.event_id.clone()).collect();
        let fetched = self.store.get_events(&ids).unwrap_or_default();
        let by_id: std::collections::HashMap<&str, &Event> =
            fetched.iter().map(|e| (e.id.as_str(), e)).collect();

        let accessing_session = opts
            .accessing_session
            .as_deref()
            .or(opts.session_id.as_deref())
            .unwrap_or("unknown");
        let mut memories = Vec::with_capacity(top.len());
        for candidate in top {
            let Some(&event) = by_id.get(candidate.event_id.as_str()) else {
                continue;
            };
            if let Err(e) =
                self.graduation
                    .record_access(&event.id, accessing_session, candidate.score)
            {
                tracing::debug!("Access recording failed for {}: {}", event.id, e);
            }
            let session_context = if opts.include_session_context {
                self.store.get_neighbors(event).ok().map(|(before, after)| SessionContext {
                    before: before.map(|e| clip(&e.content, NEIGHBOR_PREVIEW).to_string()),
                    after: after.map(|e| clip(&e.content, NEIGHBOR_PREVIEW).to_string()),
                })
            } else {
                None
            };
            memories.push(RetrievedMemory {
                event: event.clone(),
                score: candidate.score,
                vector_score: candidate.vector_score,
                session_context,
            });
        }

        let shared = if opts.include_shared {
            self.search_shared(query, opts)
        } else {
            vec![]
        };

        let context = if match_result.confidence == MatchConfidence::None {
            String::new()
        } else {
            build_context(&memories, &shared, opts.max_tokens)
        };

        RetrieveResult {
            event_ids: memories.iter().map(|m| m.event.id.clone()).collect(),
            memories,
            confidence: match_result.confidence,
            gap: match_result.gap,
            context,
            shared,
        }
    }

    fn embed_query(&self, query: &str) -> Option<Vec<f32>> {
        if let Ok(mut cache) = self.query_cache.lock() {
            if let Some(vector) = cache.get(query) {
                return Some(vector.clone());
            }
        }
        match self.embedder.embed(query) {
            Ok(vector) => {
                if let Ok(mut cache) = self.query_cache.lock() {
                    cache.put(query.to_string(), vector.clone());
                }
                Some(vector)
            }
            Err(e) => {
                tracing::warn!("Query embedding failed: {}", e);
                None
            }
        }
    }

    fn search_shared(&self, query: &str, opts: &RetrieveOptions) -> Vec<SharedSearchResult> {
        let Some(shared) = &self.shared else {
            return vec![];
        };
        let results = shared.with(|s| {
            s.search(
                query,
                opts.top_k,
                opts.min_score,
                self.project_hash.as_deref(),
            )
        });
        match results {
            Ok(results) => {
                for result in &results {
                    let entry_id = result.entry.entry_id.clone();
                    if let Err(e) = shared.with(|s| s.record_usage(&entry_id)) {
                        tracing::debug!("Shared usage bump failed: {}", e);
                    }
                }
                results
            }
            Err(e) => {
                tracing::warn!("Shared store search failed: {}", e);
                vec![]
            }
        }
    }
}

// ============================================================================
// CONTEXT ASSEMBLY
// ============================================================================

/// Assemble the bounded context string. Blocks are appended in rank order
/// until the next block would push the estimate past `max_tokens`.
fn build_context(
    memories: &[RetrievedMemory],
    shared: &[SharedSearchResult],
    max_tokens: usize,
) -> String {
    let mut context = String::new();

    for memory in memories {
        let mut block = format!(
            "**{}** ({}, score: {:.2})\n{}",
            memory.event.event_type,
            memory.event.timestamp.format("%Y-%m-%d"),
            memory.score,
            memory.event.content,
        );
        if let Some(ctx) = &memory.session_context {
            let neighbors: Vec<&str> = [ctx.before.as_deref(), ctx.after.as_deref()]
                .into_iter()
                .flatten()
                .collect();
            if !neighbors.is_empty() {
                block.push_str("\n\n_Context:_ ");
                block.push_str(&neighbors.join(" | "));
            }
        }

        let candidate = if context.is_empty() {
            format!("## Relevant Memories\n\n{}", block)
        } else {
            format!("{}\n\n---\n\n{}", context, block)
        };
        if estimate_tokens(&candidate) > max_tokens {
            break;
        }
        context = candidate;
    }

    for result in shared {
        let block = format!(
            "**{}** (confidence: {:.2})\n{}",
            result.entry.title, result.entry.confidence, result.entry.solution,
        );
        let candidate = if shared_section_started(&context) {
            format!("{}\n\n---\n\n{}", context, block)
        } else if context.is_empty() {
            format!("## Cross-Project Knowledge\n\n{}", block)
        } else {
            format!("{}\n\n## Cross-Project Knowledge\n\n{}", context, block)
        };
        if estimate_tokens(&candidate) > max_tokens {
            break;
        }
        context = candidate;
    }

    context
}

fn shared_section_started(context: &str) -> bool {
    context.contains("## Cross-Project Knowledge")
}

fn deadline_blown(opts: &RetrieveOptions) -> bool {
    opts.deadline.is_some_and(|d| Instant::now() >= d)
}

fn clip(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

// ============================================================================
// TESTS
// ============================================================================
