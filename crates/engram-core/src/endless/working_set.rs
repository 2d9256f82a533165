//! Working Set
//!
//! The sliding window of recent events in endless mode. Items expire after
//! the configured time window and the set is capped by discarding the
//! least relevant, oldest items first. Pruning happens on read, so the
//! write path stays a single insert.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::config::WorkingSetConfig;
use crate::events::{Event, WorkingSetItem};
use crate::storage::{EventStore, Result, StoreError};

use super::extract_topics;

/// The hydrated view of the working set
#[derive(Debug, Clone)]
pub struct WorkingSetView {
    /// Items paired with their events; an item whose event was pruned
    /// hydrates to `None`
    pub items: Vec<(WorkingSetItem, Option<Event>)>,
    /// When the set last changed
    pub latest_activity: Option<DateTime<Utc>>,
    /// Score of the most recent continuity evaluation
    pub continuity_score: Option<f64>,
}

/// Working-set manager
pub struct WorkingSet {
    store: Arc<EventStore>,
    config: WorkingSetConfig,
}

impl WorkingSet {
    pub fn new(store: Arc<EventStore>, config: WorkingSetConfig) -> Self {
        Self { store, config }
    }

    /// Add an event to the working set with the relevance the host
    /// assigned. Topics are extracted from the event content at add time.
    pub fn add(&self, event_id: &str, relevance: f64) -> Result<WorkingSetItem> {
        let event = self
            .store
            .get_event(event_id)?
            .ok_or_else(|| StoreError::NotFound(event_id.to_string()))?;
        let now = Utc::now();
        let item = WorkingSetItem {
            id: Uuid::new_v4().to_string(),
            event_id: event.id.clone(),
            added_at: now,
            relevance_score: relevance.clamp(0.0, 1.0),
            topics: extract_topics(&event.content),
            expires_at: now + Duration::hours(self.config.time_window_hours),
        };
        self.store.working_set_add(&item)?;
        Ok(item)
    }

    /// The current items, pruned of expired entries and capped
    pub fn items(&self) -> Result<Vec<WorkingSetItem>> {
        self.store.working_set_items(Utc::now(), self.config.max_events)
    }

    /// The hydrated view: events, latest activity, last continuity score
    pub fn view(&self) -> Result<WorkingSetView> {
        let items = self.items()?;
        let ids: Vec<String> = items.iter().map(|i| i.event_id.clone()).collect();
        let events = self.store.get_events(&ids)?;
        let by_id: std::collections::HashMap<&str, Event> =
            events.iter().map(|e| (e.id.as_str(), e.clone())).collect();

        let latest_activity = items.iter().map(|i| i.added_at).max();
        let continuity_score = self.store.latest_continuity()?.map(|r| r.score);

        Ok(WorkingSetView {
            items: items
                .into_iter()
                .map(|item| {
                    let event = by_id.get(item.event_id.as_str()).cloned();
                    (item, event)
                })
                .collect(),
            latest_activity,
            continuity_score,
        })
    }

    /// Remove items by id (after consolidation)
    pub fn remove(&self, ids: &[String]) -> Result<()> {
        self.store.working_set_remove(ids)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{AppendInput, EventType};
    use tempfile::TempDir;

    fn setup() -> (WorkingSet, Arc<EventStore>, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(EventStore::open(&dir.path().join("events.db"), 3).unwrap());
        let ws = WorkingSet::new(Arc::clone(&store), WorkingSetConfig::default());
        (ws, store, dir)
    }

    fn append(store: &EventStore, content: &str) -> String {
        store
            .append(AppendInput::new(EventType::UserPrompt, "s1", content))
            .unwrap()
            .event_id
    }

    #[test]
    fn test_add_extracts_topics_and_sets_expiry() {
        let (ws, store, _dir) = setup();
        let id = append(&store, "tuning duckdb aggregate queries");

        let item = ws.add(&id, 0.9).unwrap();
        assert!(item.topics.contains(&"duckdb".to_string()));
        assert!(item.expires_at > item.added_at);
        assert!((item.relevance_score - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_add_missing_event_errors() {
        let (ws, _store, _dir) = setup();
        assert!(matches!(ws.add("ghost", 1.0), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_view_hydrates_events() {
        let (ws, store, _dir) = setup();
        let a = append(&store, "first thing");
        let b = append(&store, "second thing");
        ws.add(&a, 1.0).unwrap();
        ws.add(&b, 0.5).unwrap();

        let view = ws.view().unwrap();
        assert_eq!(view.items.len(), 2);
        assert!(view.items.iter().all(|(_, e)| e.is_some()));
        assert!(view.latest_activity.is_some());
        assert!(view.continuity_score.is_none());
    }

    #[test]
    fn test_cap_discards_lowest_relevance() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(EventStore::open(&dir.path().join("events.db"), 3).unwrap());
        let ws = WorkingSet::new(
            Arc::clone(&store),
            WorkingSetConfig {
                max_events: 2,
                time_window_hours: 24,
            },
        );

        let mut ids = Vec::new();
        for i in 0..3 {
            let id = append(&store, &format!("event number {}", i));
            ws.add(&id, i as f64 / 10.0).unwrap();
            ids.push(id);
        }

        let items = ws.items().unwrap();
        assert_eq!(items.len(), 2);
        let kept: Vec<&str> = items.iter().map(|i| i.event_id.as_str()).collect();
        assert!(!kept.contains(&ids[0].as_str()));
    }
}
