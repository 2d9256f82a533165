//! Continuity Scoring
//!
//! Measures how strongly a new context follows from the previous one by
//! comparing topics, files, entities, and elapsed time. Every scoring
//! appends a continuity-log row; the prior snapshot is persisted in the
//! endless config so scoring survives process restarts.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ContinuityConfig;
use crate::events::TransitionType;
use crate::storage::{EventStore, Result};

/// Endless-config key the previous snapshot is stored under
const SNAPSHOT_KEY: &str = "last_context_snapshot";

/// A point-in-time description of what the conversation is about
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextSnapshot {
    pub id: String,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub entities: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

/// Set overlap: `|a ∩ b| / max(|a|, |b|)`, or 0 when either side is empty
pub fn overlap(a: &[String], b: &[String]) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let a_set: std::collections::HashSet<&str> = a.iter().map(|s| s.as_str()).collect();
    let shared = b.iter().filter(|s| a_set.contains(s.as_str())).count();
    shared as f64 / a.len().max(b.len()) as f64
}

/// Score two successive snapshots:
/// `0.3·topics + 0.2·files + 0.3·exp(−Δt/decay) + 0.2·entities`
pub fn score_snapshots(
    prior: &ContextSnapshot,
    current: &ContextSnapshot,
    decay_hours: f64,
) -> f64 {
    let topic_overlap = overlap(&prior.topics, &current.topics);
    let file_overlap = overlap(&prior.files, &current.files);
    let entity_overlap = overlap(&prior.entities, &current.entities);

    let delta_hours =
        ((current.timestamp - prior.timestamp).num_milliseconds().max(0) as f64) / 3_600_000.0;
    let time_decay = (-delta_hours / decay_hours.max(f64::EPSILON)).exp();

    let score =
        0.3 * topic_overlap + 0.2 * file_overlap + 0.3 * time_decay + 0.2 * entity_overlap;
    score.clamp(0.0, 1.0)
}

/// Continuity scorer bound to a store
pub struct ContinuityScorer {
    store: Arc<EventStore>,
    config: ContinuityConfig,
}

impl ContinuityScorer {
    pub fn new(store: Arc<EventStore>, config: ContinuityConfig) -> Self {
        Self { store, config }
    }

    /// Classify a score against the configured thresholds
    pub fn classify(&self, score: f64) -> TransitionType {
        if score >= self.config.seamless_threshold {
            TransitionType::Seamless
        } else if score >= self.config.topic_shift_threshold {
            TransitionType::TopicShift
        } else {
            TransitionType::Break
        }
    }

    /// Score the new snapshot against the stored prior one, log the
    /// transition, and persist the new snapshot as the prior for next
    /// time. The first snapshot ever seen has nothing to follow from and
    /// logs a `break` at score 0.
    pub fn score(&self, current: &ContextSnapshot) -> Result<(f64, TransitionType)> {
        let prior: Option<ContextSnapshot> = self
            .store
            .get_endless_config(SNAPSHOT_KEY)?
            .and_then(|raw| serde_json::from_str(&raw).ok());

        let (score, transition, from_id) = match &prior {
            Some(prior) => {
                let score = score_snapshots(prior, current, self.config.decay_hours);
                (score, self.classify(score), Some(prior.id.clone()))
            }
            None => (0.0, TransitionType::Break, None),
        };

        self.store.insert_continuity(
            from_id.as_deref(),
            Some(&current.id),
            score,
            transition,
        )?;
        if let Ok(raw) = serde_json::to_string(current) {
            self.store.set_endless_config(SNAPSHOT_KEY, &raw)?;
        }

        Ok((score, transition))
    }
}

// ============================================================================
// TESTS
// ============================================================================
