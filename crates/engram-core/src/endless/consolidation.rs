//! Consolidation
//!
//! Periodically folds topic-cohesive groups of working-set items into
//! long-term `ConsolidatedMemory` rows and prunes the folded items from
//! the set. Runs on a cadence; a pass triggers when the set is large
//! enough, when it has gone idle, or when forced.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::config::{ConsolidationConfig, WorkingSetConfig};
use crate::events::{ConsolidatedMemory, Event, WorkingSetItem};
use crate::storage::{EventStore, Result};

/// Key points extracted per source event for the rule-based summary
const KEY_POINT_LENGTH: usize = 120;

/// What one consolidation pass accomplished
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsolidationReport {
    /// Whether the trigger conditions were met at all
    pub triggered: bool,
    pub groups: usize,
    pub consolidated: usize,
    pub items_pruned: usize,
}

/// The consolidation worker
pub struct Consolidator {
    store: Arc<EventStore>,
    config: ConsolidationConfig,
    working_config: WorkingSetConfig,
    running: AtomicBool,
    wake: Notify,
}

impl Consolidator {
    pub fn new(
        store: Arc<EventStore>,
        config: ConsolidationConfig,
        working_config: WorkingSetConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            config,
            working_config,
            running: AtomicBool::new(false),
            wake: Notify::new(),
        })
    }

    /// One consolidation pass. `force` bypasses the trigger conditions.
    pub fn run_once(&self, force: bool) -> Result<ConsolidationReport> {
        let now = Utc::now();
        let items = self
            .store
            .working_set_items(now, self.working_config.max_events)?;

        let idle = self
            .store
            .working_set_latest_activity()?
            .map(|t| (now - t).num_milliseconds() as u64 >= self.config.trigger_idle_ms)
            .unwrap_or(false);
        let triggered =
            force || items.len() >= self.config.trigger_event_count || idle;
        if !triggered || items.is_empty() {
            return Ok(ConsolidationReport {
                triggered,
                ..Default::default()
            });
        }

        let mut report = ConsolidationReport {
            triggered: true,
            ..Default::default()
        };

        // Group items by topic, largest group first; an item joins at most
        // one group
        let mut topics: Vec<(String, Vec<&WorkingSetItem>)> = Vec::new();
        for item in &items {
            for topic in &item.topics {
                match topics.iter_mut().find(|(t, _)| t == topic) {
                    Some((_, members)) => members.push(item),
                    None => topics.push((topic.clone(), vec![item])),
                }
            }
        }
        topics.sort_by(|a, b| b.1.len().cmp(&a.1.len()));

        let mut consumed: HashSet<&str> = HashSet::new();
        let mut pruned_ids: Vec<String> = Vec::new();
        for (topic, members) in topics {
            let members: Vec<&WorkingSetItem> = members
                .into_iter()
                .filter(|m| !consumed.contains(m.id.as_str()))
                .collect();
            if members.len() < self.config.min_group_size {
                continue;
            }
            report.groups += 1;

            let event_ids: Vec<String> = members.iter().map(|m| m.event_id.clone()).collect();
            let events = self.store.get_events(&event_ids)?;
            if events.is_empty() {
                continue;
            }

            let memory = self.consolidate_group(&topic, &members, &events);
            self.store.insert_consolidated(&memory)?;
            report.consolidated += 1;
            tracing::info!(
                "Consolidated {} events into memory {} (topic: {})",
                memory.source_events.len(),
                memory.memory_id,
                topic
            );

            for member in members {
                consumed.insert(member.id.as_str());
                pruned_ids.push(member.id.clone());
            }
        }

        if !pruned_ids.is_empty() {
            self.store.working_set_remove(&pruned_ids)?;
            report.items_pruned = pruned_ids.len();
        }

        Ok(report)
    }

    /// Build one consolidated memory from a topic group
    fn consolidate_group(
        &self,
        topic: &str,
        members: &[&WorkingSetItem],
        events: &[Event],
    ) -> ConsolidatedMemory {
        if self.config.use_llm_summarization {
            // No summarization model ships with the engine; the rule-based
            // path is the fallback
            tracing::warn!("LLM summarization enabled but no model configured");
        }

        let mut topics: Vec<String> = vec![topic.to_string()];
        for member in members {
            for t in &member.topics {
                if !topics.contains(t) {
                    topics.push(t.clone());
                }
            }
        }
        topics.truncate(8);

        let key_points: Vec<String> = events
            .iter()
            .map(|e| key_point(&e.content))
            .collect();
        let summary = format!("[{}] {}", topic, key_points.join("; "));

        let count_factor = (members.len() as f64 / 10.0).min(1.0);
        let confidence = 0.5 * count_factor + 0.5 * time_proximity(members);

        ConsolidatedMemory {
            memory_id: Uuid::new_v4().to_string(),
            summary,
            topics,
            source_events: events.iter().map(|e| e.id.clone()).collect(),
            confidence,
            created_at: Utc::now(),
            accessed_at: None,
            access_count: 0,
        }
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
        let consolidator = Arc::clone(self);
        tokio::spawn(async move {
            tracing::debug!("Consolidation worker started");
            while consolidator.running.load(Ordering::SeqCst) {
                let sleep = tokio::time::sleep(Duration::from_millis(
                    consolidator.config.trigger_interval_ms,
                ));
                tokio::select! {
                    _ = sleep => {}
                    _ = consolidator.wake.notified() => {}
                }
                if !consolidator.running.load(Ordering::SeqCst) {
                    break;
                }
                match consolidator.run_once(false) {
                    Ok(report) if report.consolidated > 0 => {
                        tracing::info!(
                            "Consolidation pass: {} memories from {} items",
                            report.consolidated,
                            report.items_pruned
                        );
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!("Consolidation pass failed: {}", e),
                }
            }
            tracing::debug!("Consolidation worker stopped");
        });
    }

    /// Request the loop to stop
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.wake.notify_one();
    }
}

/// How tightly a group's additions cluster in time, in [0, 1]: items added
/// within moments of each other score 1, items spread across the whole
/// working-set window approach 0
fn time_proximity(members: &[&WorkingSetItem]) -> f64 {
    if members.len() < 2 {
        return 1.0;
    }
    let min = members.iter().map(|m| m.added_at).min();
    let max = members.iter().map(|m| m.added_at).max();
    let (Some(min), Some(max)) = (min, max) else {
        return 1.0;
    };
    let window = members
        .iter()
        .map(|m| (m.expires_at - m.added_at).num_milliseconds())
        .max()
        .unwrap_or(1)
        .max(1) as f64;
    let span = (max - min).num_milliseconds() as f64;
    (1.0 - span / window).clamp(0.0, 1.0)
}

/// First sentence (or leading slice) of an event's content
fn key_point(content: &str) -> String {
    let trimmed = content.trim();
    let sentence_end = trimmed
        .char_indices()
        .find(|(_, c)| matches!(c, '.' | '!' | '?' | '\n'))
        .map(|(i, _)| i);
    let point = match sentence_end {
        Some(end) if end > 0 => &trimmed[..end],
        _ => trimmed,
    };
    let mut end = point.len().min(KEY_POINT_LENGTH);
    while end > 0 && !point.is_char_boundary(end) {
        end -= 1;
    }
    point[..end].to_string()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endless::WorkingSet;
    use crate::events::{AppendInput, EventType};
    use tempfile::TempDir;

    fn setup() -> (Arc<Consolidator>, WorkingSet, Arc<EventStore>, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(EventStore::open(&dir.path().join("events.db"), 3).unwrap());
        let ws = WorkingSet::new(Arc::clone(&store), WorkingSetConfig::default());
        let consolidator = Consolidator::new(
            Arc::clone(&store),
            ConsolidationConfig::default(),
            WorkingSetConfig::default(),
        );
        (consolidator, ws, store, dir)
    }

    fn seed(store: &EventStore, ws: &WorkingSet, content: &str) -> String {
        let id = store
            .append(AppendInput::new(EventType::UserPrompt, "s1", content))
            .unwrap()
            .event_id;
        ws.add(&id, 1.0).unwrap();
        id
    }

    #[test]
    fn test_topic_group_consolidates_and_prunes() {
        let (consolidator, ws, store, _dir) = setup();
        for i in 0..4 {
            seed(&store, &ws, &format!("duckdb tuning experiment number{}", i));
        }
        seed(&store, &ws, "unrelated yak shaving");

        let report = consolidator.run_once(true).unwrap();
        assert!(report.triggered);
        assert_eq!(report.consolidated, 1);
        assert_eq!(report.items_pruned, 4);

        let memories = store.list_consolidated(10).unwrap();
        assert_eq!(memories.len(), 1);
        assert!(memories[0].topics.contains(&"duckdb".to_string()));
        assert_eq!(memories[0].source_events.len(), 4);
        assert!(memories[0].confidence > 0.0 && memories[0].confidence <= 1.0);

        // Consolidated items are gone; the unrelated one remains
        let remaining = ws.items().unwrap();
        assert_eq!(remaining.len(), 1);
    }

    #[test]
    fn test_small_groups_left_alone() {
        let (consolidator, ws, store, _dir) = setup();
        seed(&store, &ws, "duckdb first note");
        seed(&store, &ws, "duckdb second note");

        let report = consolidator.run_once(true).unwrap();
        assert_eq!(report.consolidated, 0);
        assert_eq!(ws.items().unwrap().len(), 2);
    }

    #[test]
    fn test_not_triggered_without_force() {
        let (consolidator, ws, store, _dir) = setup();
        for i in 0..4 {
            seed(&store, &ws, &format!("duckdb note {}", i));
        }
        // Four fresh items: below trigger_event_count, not idle, no force
        let report = consolidator.run_once(false).unwrap();
        assert!(!report.triggered);
        assert_eq!(ws.items().unwrap().len(), 4);
    }

    #[test]
    fn test_item_joins_at_most_one_group() {
        let (consolidator, ws, store, _dir) = setup();
        // All five share "duckdb"; three also share "parquet"
        for i in 0..3 {
            seed(&store, &ws, &format!("duckdb parquet loading case {}", i));
        }
        seed(&store, &ws, "duckdb memory settings");
        seed(&store, &ws, "duckdb extension install");

        let report = consolidator.run_once(true).unwrap();
        // duckdb (5 members) wins first; parquet's members are consumed
        assert_eq!(report.consolidated, 1);
        assert_eq!(report.items_pruned, 5);
    }

    #[test]
    fn test_time_proximity_bounds() {
        let now = Utc::now();
        let item = |added, expires| WorkingSetItem {
            id: Uuid::new_v4().to_string(),
            event_id: "e".to_string(),
            added_at: added,
            relevance_score: 1.0,
            topics: vec![],
            expires_at: expires,
        };
        let tight_a = item(now, now + chrono::Duration::hours(24));
        let tight_b = item(now, now + chrono::Duration::hours(24));
        let tight = time_proximity(&[&tight_a, &tight_b]);
        assert!(tight > 0.99);

        let spread_a = item(now - chrono::Duration::hours(24), now);
        let spread_b = item(now, now + chrono::Duration::hours(24));
        let spread = time_proximity(&[&spread_a, &spread_b]);
        assert!(spread < 0.01);
    }

    #[test]
    fn test_key_point_takes_first_sentence() {
        assert_eq!(key_point("First part. Second part."), "First part");
        assert_eq!(key_point("no punctuation here"), "no punctuation here");
    }
}
