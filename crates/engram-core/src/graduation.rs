//! Graduation Pipeline
//!
//! Promotes events through the L0..L4 levels based on observed usefulness
//! rather than age: how often a memory was retrieved, at what confidence,
//! and from how many distinct sessions. Promotion is monotone; nothing is
//! ever demoted.
//!
//! Metrics are aggregated from the persisted access log, so promotion
//! state survives restarts; the in-memory map is only a cache.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::config::GraduationWorkerConfig;
use crate::events::{Event, EventType, Insight, InsightKind, MemoryLevel};
use crate::storage::{AccessStats, EventStore, Result, StoreError};

/// Keywords that mark a user prompt as a stated preference
const PREFERENCE_KEYWORDS: &[&str] = &["prefer", "like", "want", "always", "never", "favorite"];

/// Events a canonical key must recur across before it becomes a pattern
const PATTERN_MIN_COUNT: usize = 2;

// ============================================================================
// CRITERIA
// ============================================================================

/// Requirements for one level transition. An event qualifies only when
/// every criterion passes; age is measured from the last access.
#[derive(Debug, Clone, Copy)]
pub struct GraduationCriteria {
    pub min_access: i64,
    pub min_confidence: f64,
    pub min_cross_session: i64,
    pub max_age_days: i64,
}

/// Per-transition criteria
#[derive(Debug, Clone)]
pub struct CriteriaTable {
    pub l0_to_l1: GraduationCriteria,
    pub l1_to_l2: GraduationCriteria,
    pub l2_to_l3: GraduationCriteria,
    pub l3_to_l4: GraduationCriteria,
}

impl Default for CriteriaTable {
    fn default() -> Self {
        Self {
            l0_to_l1: GraduationCriteria {
                min_access: 1,
                min_confidence: 0.50,
                min_cross_session: 0,
                max_age_days: 30,
            },
            l1_to_l2: GraduationCriteria {
                min_access: 3,
                min_confidence: 0.70,
                min_cross_session: 1,
                max_age_days: 60,
            },
            l2_to_l3: GraduationCriteria {
                min_access: 5,
                min_confidence: 0.85,
                min_cross_session: 2,
                max_age_days: 90,
            },
            l3_to_l4: GraduationCriteria {
                min_access: 10,
                min_confidence: 0.92,
                min_cross_session: 3,
                max_age_days: 180,
            },
        }
    }
}

impl CriteriaTable {
    /// Criteria for promoting *from* the given level; `None` at L4
    pub fn for_level(&self, level: MemoryLevel) -> Option<&GraduationCriteria> {
        match level {
            MemoryLevel::L0 => Some(&self.l0_to_l1),
            MemoryLevel::L1 => Some(&self.l1_to_l2),
            MemoryLevel::L2 => Some(&self.l2_to_l3),
            MemoryLevel::L3 => Some(&self.l3_to_l4),
            MemoryLevel::L4 => None,
        }
    }
}

/// What one evaluation pass accomplished
#[derive(Debug, Clone, Copy, Default)]
pub struct GraduationReport {
    pub evaluated: usize,
    pub promoted: usize,
    pub insights: usize,
}

// ============================================================================
// PIPELINE
// ============================================================================

/// The graduation pipeline and its background worker
pub struct GraduationPipeline {
    store: Arc<EventStore>,
    criteria: CriteriaTable,
    config: GraduationWorkerConfig,
    insight_extraction: bool,
    /// Access aggregates, keyed by event id; rebuilt from the store on miss
    metrics: Mutex<HashMap<String, AccessStats>>,
    /// Cooldown bookkeeping so the worker does not re-judge hot events
    last_evaluated: Mutex<HashMap<String, DateTime<Utc>>>,
    running: AtomicBool,
    wake: Notify,
}

impl GraduationPipeline {
    pub fn new(
        store: Arc<EventStore>,
        criteria: CriteriaTable,
        config: GraduationWorkerConfig,
        insight_extraction: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            criteria,
            config,
            insight_extraction,
            metrics: Mutex::new(HashMap::new()),
            last_evaluated: Mutex::new(HashMap::new()),
            running: AtomicBool::new(false),
            wake: Notify::new(),
        })
    }

    /// Record a retrieval access. Called by the retriever for every
    /// returned memory; persists to the access log and invalidates the
    /// cached aggregate.
    pub fn record_access(&self, event_id: &str, session_id: &str, confidence: f64) -> Result<()> {
        self.store.record_access(event_id, session_id, confidence)?;
        if let Ok(mut metrics) = self.metrics.lock() {
            metrics.remove(event_id);
        }
        Ok(())
    }

    /// Aggregated metrics for one event, cached
    pub fn metrics_for(&self, event: &Event) -> Result<AccessStats> {
        if let Ok(metrics) = self.metrics.lock() {
            if let Some(stats) = metrics.get(&event.id) {
                return Ok(stats.clone());
            }
        }
        let stats = self.store.access_stats(&event.id, &event.session_id)?;
        if let Ok(mut metrics) = self.metrics.lock() {
            metrics.insert(event.id.clone(), stats.clone());
        }
        Ok(stats)
    }

    /// Judge one event against the criteria for its current level.
    /// Returns the level it should be promoted to, or `None`.
    pub fn evaluate_graduation(
        &self,
        event: &Event,
        level: MemoryLevel,
        now: DateTime<Utc>,
    ) -> Result<Option<MemoryLevel>> {
        let Some(criteria) = self.criteria.for_level(level) else {
            return Ok(None);
        };
        let stats = self.metrics_for(event)?;

        let Some(last_accessed) = stats.last_accessed else {
            return Ok(None);
        };
        let age_days = (now - last_accessed).num_days();

        let qualifies = stats.access_count >= criteria.min_access
            && stats.confidence >= criteria.min_confidence
            && stats.cross_session_refs >= criteria.min_cross_session
            && age_days <= criteria.max_age_days;

        if qualifies { Ok(level.next()) } else { Ok(None) }
    }

    /// One evaluation pass over L0..L3. `force` ignores the per-event
    /// cooldown (tests, CLI).
    pub fn run_once(&self, force: bool) -> Result<GraduationReport> {
        let now = Utc::now();
        let cooldown = chrono::Duration::milliseconds(self.config.cooldown_ms as i64);
        let mut report = GraduationReport::default();
        let mut graduated_pool: Vec<Event> = Vec::new();

        for level in [
            MemoryLevel::L0,
            MemoryLevel::L1,
            MemoryLevel::L2,
            MemoryLevel::L3,
        ] {
            let events = self.store.get_events_by_level(level, self.config.batch_size, 0)?;
            for event in events {
                if !force {
                    let recently = self
                        .last_evaluated
                        .lock()
                        .ok()
                        .and_then(|m| m.get(&event.id).copied())
                        .is_some_and(|t| now - t < cooldown);
                    if recently {
                        continue;
                    }
                }
                report.evaluated += 1;
                if let Ok(mut m) = self.last_evaluated.lock() {
                    m.insert(event.id.clone(), now);
                }

                match self.evaluate_graduation(&event, level, now)? {
                    Some(next) => {
                        self.store.update_memory_level(&event.id, next)?;
                        tracing::info!("Promoted {} {} -> {}", event.id, level, next);
                        report.promoted += 1;
                        graduated_pool.push(event);
                    }
                    None => {
                        if level >= MemoryLevel::L1 {
                            graduated_pool.push(event);
                        }
                    }
                }
            }
        }

        if self.insight_extraction && !graduated_pool.is_empty() {
            let insights = extract_insights(&graduated_pool);
            for insight in &insights {
                self.store.insert_insight(insight)?;
            }
            report.insights = insights.len();
        }

        Ok(report)
    }

    /// Whether the background loop is active
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start the cadence worker. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let pipeline = Arc::clone(self);
        tokio::spawn(async move {
            tracing::debug!("Graduation worker started");
            while pipeline.running.load(Ordering::SeqCst) {
                let sleep = tokio::time::sleep(Duration::from_millis(
                    pipeline.config.evaluation_interval_ms,
                ));
                tokio::select! {
                    _ = sleep => {}
                    _ = pipeline.wake.notified() => {}
                }
                if !pipeline.running.load(Ordering::SeqCst) {
                    break;
                }
                match pipeline.run_once(false) {
                    Ok(report) if report.promoted > 0 => {
                        tracing::info!(
                            "Graduation pass: {} evaluated, {} promoted",
                            report.evaluated,
                            report.promoted
                        );
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!("Graduation pass failed: {}", e),
                }
            }
            tracing::debug!("Graduation worker stopped");
        });
    }

    /// Request the loop to stop
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.wake.notify_one();
    }

    /// Current level of an event
    pub fn get_event_level(&self, event_id: &str) -> Result<MemoryLevel> {
        self.store
            .get_level(event_id)?
            .ok_or_else(|| StoreError::NotFound(event_id.to_string()))
    }
}

// ============================================================================
// INSIGHT EXTRACTION
// ============================================================================

/// Derive insights from a pool of graduated (L1+) events: canonical keys
/// recurring across events become pattern insights, and user prompts that
/// state a preference become preference insights.
pub fn extract_insights(events: &[Event]) -> Vec<Insight> {
    let now = Utc::now();
    let mut insights = Vec::new();

    let mut by_key: HashMap<&str, Vec<&Event>> = HashMap::new();
    for event in events {
        by_key.entry(event.canonical_key.as_str()).or_default().push(event);
    }
    for (key, group) in by_key {
        if group.len() < PATTERN_MIN_COUNT || key.is_empty() {
            continue;
        }
        insights.push(Insight {
            id: deterministic_id("pattern", key),
            kind: InsightKind::Pattern,
            insight: format!("Recurring pattern across {} events: {}", group.len(), key),
            source_events: group.iter().map(|e| e.id.clone()).collect(),
            confidence: (group.len() as f64 / 5.0).min(1.0),
            extracted_at: now,
        });
    }

    for event in events {
        if event.event_type != EventType::UserPrompt {
            continue;
        }
        let lower = event.content.to_lowercase();
        let stated = PREFERENCE_KEYWORDS
            .iter()
            .any(|kw| lower.split(|c: char| !c.is_alphanumeric()).any(|w| w == *kw));
        if stated {
            insights.push(Insight {
                id: deterministic_id("preference", &event.id),
                kind: InsightKind::Preference,
                insight: format!("User preference: {}", truncate(&event.content, 200)),
                source_events: vec![event.id.clone()],
                confidence: 0.7,
                extracted_at: now,
            });
        }
    }

    insights
}

/// Stable insight id so re-extraction replaces instead of duplicating
fn deterministic_id(kind: &str, key: &str) -> String {
    let digest = md5::compute(format!("{}:{}", kind, key).as_bytes());
    Uuid::from_bytes(digest.0).to_string()
}

fn truncate(s: &str, max: usize) -> &str {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::AppendInput;
    use tempfile::TempDir;

    fn setup() -> (Arc<GraduationPipeline>, Arc<EventStore>, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(EventStore::open(&dir.path().join("events.db"), 3).unwrap());
        let pipeline = GraduationPipeline::new(
            Arc::clone(&store),
            CriteriaTable::default(),
            GraduationWorkerConfig::default(),
            true,
        );
        (pipeline, store, dir)
    }

    fn append(store: &EventStore, session: &str, content: &str) -> Event {
        let result = store
            .append(AppendInput::new(EventType::UserPrompt, session, content))
            .unwrap();
        store.get_event(&result.event_id).unwrap().unwrap()
    }

    #[test]
    fn test_single_access_promotes_l0_to_l1() {
        let (pipeline, store, _dir) = setup();
        let event = append(&store, "t", "remember this");

        pipeline.record_access(&event.id, "t", 0.8).unwrap();
        let report = pipeline.run_once(true).unwrap();
        assert_eq!(report.promoted, 1);
        assert_eq!(pipeline.get_event_level(&event.id).unwrap(), MemoryLevel::L1);
    }

    #[test]
    fn test_unaccessed_event_stays_l0() {
        let (pipeline, store, _dir) = setup();
        let event = append(&store, "t", "never retrieved");

        pipeline.run_once(true).unwrap();
        assert_eq!(pipeline.get_event_level(&event.id).unwrap(), MemoryLevel::L0);
    }

    #[test]
    fn test_low_confidence_access_does_not_promote() {
        let (pipeline, store, _dir) = setup();
        let event = append(&store, "t", "weak match");

        pipeline.record_access(&event.id, "t", 0.3).unwrap();
        pipeline.run_once(true).unwrap();
        assert_eq!(pipeline.get_event_level(&event.id).unwrap(), MemoryLevel::L0);
    }

    #[test]
    fn test_l1_to_l2_needs_cross_session() {
        let (pipeline, store, _dir) = setup();
        let event = append(&store, "origin", "shared knowledge");

        // Promote to L1 first
        pipeline.record_access(&event.id, "origin", 0.9).unwrap();
        pipeline.run_once(true).unwrap();
        assert_eq!(pipeline.get_event_level(&event.id).unwrap(), MemoryLevel::L1);

        // Two more same-session accesses meet min_access but not
        // cross-session
        pipeline.record_access(&event.id, "origin", 0.9).unwrap();
        pipeline.record_access(&event.id, "origin", 0.9).unwrap();
        pipeline.run_once(true).unwrap();
        assert_eq!(pipeline.get_event_level(&event.id).unwrap(), MemoryLevel::L1);

        // One access from a different session unlocks L2
        pipeline.record_access(&event.id, "other", 0.9).unwrap();
        pipeline.run_once(true).unwrap();
        assert_eq!(pipeline.get_event_level(&event.id).unwrap(), MemoryLevel::L2);
    }

    #[test]
    fn test_levels_never_decrease() {
        let (pipeline, store, _dir) = setup();
        let event = append(&store, "t", "promoted once");
        pipeline.record_access(&event.id, "t", 0.9).unwrap();
        pipeline.run_once(true).unwrap();
        assert_eq!(pipeline.get_event_level(&event.id).unwrap(), MemoryLevel::L1);

        // Repeated passes with no further accesses leave the level alone
        for _ in 0..3 {
            pipeline.run_once(true).unwrap();
            assert!(pipeline.get_event_level(&event.id).unwrap() >= MemoryLevel::L1);
        }
    }

    #[test]
    fn test_cooldown_skips_recent_evaluations() {
        let (pipeline, store, _dir) = setup();
        append(&store, "t", "cooldown test");

        let first = pipeline.run_once(false).unwrap();
        assert_eq!(first.evaluated, 1);
        let second = pipeline.run_once(false).unwrap();
        assert_eq!(second.evaluated, 0);
        // Force ignores the cooldown
        let forced = pipeline.run_once(true).unwrap();
        assert_eq!(forced.evaluated, 1);
    }

    #[test]
    fn test_extract_pattern_insight() {
        let (_pipeline, store, _dir) = setup();
        let a = append(&store, "s1", "How to fix DNS timeout");
        let b = append(&store, "s2", "how to FIX dns timeout!!");
        assert_eq!(a.canonical_key, b.canonical_key);

        let insights = extract_insights(&[a, b]);
        let pattern = insights
            .iter()
            .find(|i| i.kind == InsightKind::Pattern)
            .unwrap();
        assert_eq!(pattern.source_events.len(), 2);
        assert!((pattern.confidence - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_extract_preference_insight() {
        let (_pipeline, store, _dir) = setup();
        let event = append(&store, "s1", "I always want tabs over spaces");
        let insights = extract_insights(&[event]);
        let pref = insights
            .iter()
            .find(|i| i.kind == InsightKind::Preference)
            .unwrap();
        assert!((pref.confidence - 0.7).abs() < 1e-9);

        // "likely" must not trip the "like" keyword
        let event = append(&store, "s1", "this is likely broken somewhere");
        assert!(extract_insights(&[event]).is_empty());
    }

    #[test]
    fn test_insights_persisted_by_run() {
        let (pipeline, store, _dir) = setup();
        let a = append(&store, "s1", "repeat topic here");
        let b = append(&store, "s2", "Repeat topic here");
        for event in [&a, &b] {
            pipeline.record_access(&event.id, "elsewhere", 0.9).unwrap();
        }
        let report = pipeline.run_once(true).unwrap();
        assert_eq!(report.promoted, 2);
        assert!(report.insights >= 1);
        assert!(!store.list_insights(10).unwrap().is_empty());
    }
}
