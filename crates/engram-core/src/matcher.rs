//! Matcher
//!
//! Fuses vector similarity, keyword rank, recency, and event-type signals
//! into one combined score per candidate, then turns the sorted score list
//! into a confidence verdict that drives whether memories are injected
//! automatically or merely suggested.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::MatchingConfig;
use crate::events::EventType;

/// Days after which the recency component bottoms out
const RECENCY_HORIZON_DAYS: f64 = 30.0;

/// How many runner-up candidates a `suggested` verdict carries
const MAX_ALTERNATIVES: usize = 3;

// ============================================================================
// TYPES
// ============================================================================

/// Verdict over a sorted candidate list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchConfidence {
    /// Clear winner; safe to inject automatically
    High,
    /// Plausible matches worth suggesting
    Suggested,
    /// Nothing above the suggestion threshold
    None,
}

impl MatchConfidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchConfidence::High => "high",
            MatchConfidence::Suggested => "suggested",
            MatchConfidence::None => "none",
        }
    }
}

impl std::fmt::Display for MatchConfidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A raw candidate entering fusion
#[derive(Debug, Clone)]
pub struct MatchCandidate {
    pub event_id: String,
    /// Cosine score from the vector store, [0, 1]
    pub vector_score: f64,
    /// Normalized keyword score; `None` when the candidate had no FTS hit
    pub fts_score: Option<f64>,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
}

/// A candidate after fusion
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoredCandidate {
    pub event_id: String,
    /// Fused score, clamped to [0, 1]
    pub score: f64,
    pub vector_score: f64,
}

/// The matcher's output: ranked candidates plus the verdict
#[derive(Debug, Clone)]
pub struct MatchResult {
    pub confidence: MatchConfidence,
    /// Winner margin over the runner-up, present for `high` verdicts with
    /// more than one candidate
    pub gap: Option<f64>,
    /// Up to three runners-up, populated for `suggested` verdicts
    pub alternatives: Vec<ScoredCandidate>,
    /// All candidates, best first
    pub ranked: Vec<ScoredCandidate>,
}

impl MatchResult {
    /// The top candidate, if any cleared the suggestion threshold
    pub fn best(&self) -> Option<&ScoredCandidate> {
        match self.confidence {
            MatchConfidence::None => None,
            _ => self.ranked.first(),
        }
    }

    fn empty() -> Self {
        Self {
            confidence: MatchConfidence::None,
            gap: None,
            alternatives: vec![],
            ranked: vec![],
        }
    }
}

// ============================================================================
// MATCHER
// ============================================================================

/// Weighted score fusion + confidence verdict
#[derive(Debug, Clone)]
pub struct Matcher {
    config: MatchingConfig,
}

impl Default for Matcher {
    fn default() -> Self {
        Self::new(MatchingConfig::default())
    }
}

impl Matcher {
    pub fn new(config: MatchingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MatchingConfig {
        &self.config
    }

    /// Fuse one candidate's signals into a combined score
    pub fn fuse(&self, candidate: &MatchCandidate, now: DateTime<Utc>) -> f64 {
        let w = &self.config.weights;

        let age_days = (now - candidate.timestamp).num_seconds() as f64 / 86_400.0;
        let recency = (1.0 - age_days / RECENCY_HORIZON_DAYS).max(0.0);

        let status = if candidate.event_type == EventType::AgentResponse {
            1.0
        } else {
            0.8
        };

        let score = w.semantic * candidate.vector_score
            + w.fts * candidate.fts_score.unwrap_or(0.0)
            + w.recency * recency
            + w.status * status;

        score.clamp(0.0, 1.0)
    }

    /// Fuse, rank, and judge a candidate set
    pub fn evaluate(&self, candidates: Vec<MatchCandidate>, now: DateTime<Utc>) -> MatchResult {
        if candidates.is_empty() {
            return MatchResult::empty();
        }

        let mut ranked: Vec<ScoredCandidate> = candidates
            .iter()
            .map(|c| ScoredCandidate {
                event_id: c.event_id.clone(),
                score: self.fuse(c, now),
                vector_score: c.vector_score,
            })
            .collect();
        ranked.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

        let scores: Vec<f64> = ranked.iter().map(|c| c.score).collect();
        let (confidence, gap) = self.verdict(&scores);

        let alternatives = match confidence {
            MatchConfidence::Suggested => ranked
                .iter()
                .skip(1)
                .take(MAX_ALTERNATIVES)
                .cloned()
                .collect(),
            _ => vec![],
        };

        MatchResult {
            confidence,
            gap,
            alternatives,
            ranked,
        }
    }

    /// Verdict over an already-sorted (descending) score list
    pub fn verdict(&self, scores: &[f64]) -> (MatchConfidence, Option<f64>) {
        let Some(&top) = scores.first() else {
            return (MatchConfidence::None, None);
        };
        if top < self.config.suggestion_threshold {
            return (MatchConfidence::None, None);
        }

        let second = scores.get(1).copied();
        let gap = second.map(|s| top - s);

        if top >= self.config.min_combined_score {
            match gap {
                None => return (MatchConfidence::High, None),
                Some(g) if g >= self.config.min_gap => {
                    return (MatchConfidence::High, Some(g));
                }
                _ => {}
            }
        }

        (MatchConfidence::Suggested, gap)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: &str, vector_score: f64, event_type: EventType) -> MatchCandidate {
        MatchCandidate {
            event_id: id.to_string(),
            vector_score,
            fts_score: None,
            timestamp: Utc::now(),
            event_type,
        }
    }

    #[test]
    fn test_verdict_none_below_threshold() {
        let matcher = Matcher::default();
        assert_eq!(matcher.verdict(&[]).0, MatchConfidence::None);
        assert_eq!(matcher.verdict(&[0.74]).0, MatchConfidence::None);
        assert_eq!(matcher.verdict(&[0.5, 0.4]).0, MatchConfidence::None);
    }

    #[test]
    fn test_verdict_high_single_candidate() {
        let matcher = Matcher::default();
        let (confidence, gap) = matcher.verdict(&[0.95]);
        assert_eq!(confidence, MatchConfidence::High);
        assert_eq!(gap, None);
    }

    #[test]
    fn test_verdict_high_with_gap() {
        let matcher = Matcher::default();
        let (confidence, gap) = matcher.verdict(&[0.93, 0.80]);
        assert_eq!(confidence, MatchConfidence::High);
        assert!((gap.unwrap() - 0.13).abs() < 1e-9);
    }

    #[test]
    fn test_verdict_suggested_when_gap_too_small() {
        let matcher = Matcher::default();
        // Top clears 0.92 but the runner-up is within 0.03
        let (confidence, _) = matcher.verdict(&[0.93, 0.905, 0.80]);
        assert_eq!(confidence, MatchConfidence::Suggested);
    }

    #[test]
    fn test_verdict_suggested_mid_range() {
        let matcher = Matcher::default();
        let (confidence, _) = matcher.verdict(&[0.85]);
        assert_eq!(confidence, MatchConfidence::Suggested);
    }

    #[test]
    fn test_evaluate_attaches_alternatives() {
        let matcher = Matcher::default();
        // Identical fresh candidates fuse to identical scores; a crowded
        // top produces a suggested verdict with runners-up attached
        let candidates = (0..5)
            .map(|i| {
                let mut c = candidate(&format!("e{}", i), 0.95, EventType::AgentResponse);
                c.fts_score = Some(1.0);
                c
            })
            .collect();
        let result = matcher.evaluate(candidates, Utc::now());
        assert_eq!(result.confidence, MatchConfidence::Suggested);
        assert_eq!(result.alternatives.len(), 3);
        assert_eq!(result.ranked.len(), 5);
    }

    #[test]
    fn test_fuse_weights_and_clamp() {
        let matcher = Matcher::default();
        let now = Utc::now();

        // Fresh agent_response with perfect scores: 0.4 + 0.25 + 0.2 + 0.15
        let mut c = candidate("e1", 1.0, EventType::AgentResponse);
        c.fts_score = Some(1.0);
        let score = matcher.fuse(&c, now);
        assert!((score - 1.0).abs() < 1e-9);

        // Missing FTS contributes zero
        let c = candidate("e2", 1.0, EventType::AgentResponse);
        let score = matcher.fuse(&c, now);
        assert!((score - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_fuse_status_component() {
        let matcher = Matcher::default();
        let now = Utc::now();
        let agent = matcher.fuse(&candidate("a", 0.9, EventType::AgentResponse), now);
        let user = matcher.fuse(&candidate("u", 0.9, EventType::UserPrompt), now);
        // agent_response gets the full status weight, others 0.8 of it
        assert!((agent - user - 0.15 * 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_fuse_recency_decay() {
        let matcher = Matcher::default();
        let now = Utc::now();

        let fresh = matcher.fuse(&candidate("f", 0.9, EventType::UserPrompt), now);

        let mut old = candidate("o", 0.9, EventType::UserPrompt);
        old.timestamp = now - chrono::Duration::days(60);
        let old_score = matcher.fuse(&old, now);

        // 60-day-old events have exhausted the recency component
        assert!((fresh - old_score - 0.20).abs() < 1e-6);

        let mut mid = candidate("m", 0.9, EventType::UserPrompt);
        mid.timestamp = now - chrono::Duration::days(15);
        let mid_score = matcher.fuse(&mid, now);
        assert!(mid_score < fresh && mid_score > old_score);
    }

    #[test]
    fn test_best_is_none_for_no_confidence() {
        let matcher = Matcher::default();
        let result = matcher.evaluate(vec![candidate("e1", 0.1, EventType::UserPrompt)], Utc::now());
        assert_eq!(result.confidence, MatchConfidence::None);
        assert!(result.best().is_none());
        assert_eq!(result.ranked.len(), 1);
    }
}
