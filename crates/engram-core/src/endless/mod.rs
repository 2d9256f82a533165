//! Endless Mode
//!
//! The working-set / consolidation subsystem: a sliding window of recent
//! events, periodic topic-grouped summarization into long-term memories,
//! and continuity scoring between successive contexts.

mod consolidation;
mod continuity;
mod working_set;

pub use consolidation::{ConsolidationReport, Consolidator};
pub use continuity::{ContextSnapshot, ContinuityScorer, overlap, score_snapshots};
pub use working_set::{WorkingSet, WorkingSetView};

use std::collections::HashMap;

/// Maximum topics extracted per text
const MAX_TOPICS: usize = 5;

/// Minimum token length considered a topic
const MIN_TOPIC_LENGTH: usize = 3;

/// Words too common to be topics
const STOPWORDS: &[&str] = &[
    "the", "and", "for", "are", "but", "not", "you", "all", "can", "had", "her", "was", "one",
    "our", "out", "day", "get", "has", "him", "his", "how", "now", "new", "old", "see", "two",
    "way", "who", "with", "that", "this", "from", "they", "have", "will", "what", "when", "your",
    "which", "their", "about", "there", "would", "could", "should", "into", "then", "them",
    "these", "those", "some", "more", "very", "just", "also", "than", "only", "over", "such",
    "being", "does", "doing", "using", "used", "need", "want", "like", "make", "made", "work",
    "works", "here", "where", "after", "before", "because", "while", "each", "other",
];

/// Extract up to [`MAX_TOPICS`] topics from text by token frequency,
/// skipping stopwords and short tokens. Deterministic: frequency ties
/// break on first appearance.
pub fn extract_topics(text: &str) -> Vec<String> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    let mut order: Vec<String> = Vec::new();

    for token in text.split(|c: char| !c.is_alphanumeric()) {
        if token.len() < MIN_TOPIC_LENGTH {
            continue;
        }
        let token = token.to_lowercase();
        if STOPWORDS.contains(&token.as_str()) || token.chars().all(|c| c.is_numeric()) {
            continue;
        }
        match counts.get_mut(&token) {
            Some(count) => *count += 1,
            None => {
                counts.insert(token.clone(), 1);
                order.push(token);
            }
        }
    }

    let mut ranked: Vec<(usize, usize, String)> = order
        .into_iter()
        .enumerate()
        .map(|(first_seen, token)| (counts[&token], first_seen, token))
        .collect();
    ranked.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
    ranked
        .into_iter()
        .take(MAX_TOPICS)
        .map(|(_, _, token)| token)
        .collect()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_topics_frequency_ordering() {
        let topics = extract_topics("duckdb queries are fast; duckdb loves parquet");
        assert_eq!(topics[0], "duckdb");
        assert!(topics.contains(&"parquet".to_string()));
    }

    #[test]
    fn test_extract_topics_skips_stopwords_and_short_tokens() {
        let topics = extract_topics("the and for a an it is");
        assert!(topics.is_empty());

        let topics = extract_topics("db it ok migrations");
        assert_eq!(topics, vec!["migrations".to_string()]);
    }

    #[test]
    fn test_extract_topics_deterministic() {
        let text = "postgres index tuning for postgres workloads";
        assert_eq!(extract_topics(text), extract_topics(text));
    }

    #[test]
    fn test_extract_topics_caps_count() {
        let text = "alpha beta gamma delta epsilon zeta eta theta";
        assert_eq!(extract_topics(text).len(), MAX_TOPICS);
    }
}
