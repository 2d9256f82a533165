//! Event model - The fundamental units of conversational memory
//!
//! Each event is an immutable record of something that happened in a
//! session: a user prompt, an assistant response, a tool observation, or
//! a session summary. Events carry derived canonical/dedupe keys, a
//! promotion level, and access counters which are the only mutable state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// EVENT TYPES
// ============================================================================

/// Types of conversation events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A prompt submitted by the user
    #[default]
    UserPrompt,
    /// An assistant turn (extracted from the transcript)
    AgentResponse,
    /// A summary attached when a session ends
    SessionSummary,
    /// Captured output of a tool invocation
    ToolObservation,
}

impl EventType {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::UserPrompt => "user_prompt",
            EventType::AgentResponse => "agent_response",
            EventType::SessionSummary => "session_summary",
            EventType::ToolObservation => "tool_observation",
        }
    }

    /// Parse from string name
    pub fn parse_name(s: &str) -> Self {
        match s {
            "agent_response" => EventType::AgentResponse,
            "session_summary" => EventType::SessionSummary,
            "tool_observation" => EventType::ToolObservation,
            _ => EventType::UserPrompt,
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// MEMORY LEVELS
// ============================================================================

/// Promotion tier of an event. L0 is raw capture, L4 is active long-term
/// knowledge. Levels only ever increase.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub enum MemoryLevel {
    /// Raw captured event
    #[default]
    L0,
    /// Referenced at least once
    L1,
    /// Recurring within a project
    L2,
    /// Proven across sessions
    L3,
    /// Active long-term knowledge
    L4,
}

impl MemoryLevel {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryLevel::L0 => "L0",
            MemoryLevel::L1 => "L1",
            MemoryLevel::L2 => "L2",
            MemoryLevel::L3 => "L3",
            MemoryLevel::L4 => "L4",
        }
    }

    /// Parse from string name
    pub fn parse_name(s: &str) -> Self {
        match s {
            "L1" => MemoryLevel::L1,
            "L2" => MemoryLevel::L2,
            "L3" => MemoryLevel::L3,
            "L4" => MemoryLevel::L4,
            _ => MemoryLevel::L0,
        }
    }

    /// The next level up, or `None` at L4
    pub fn next(&self) -> Option<MemoryLevel> {
        match self {
            MemoryLevel::L0 => Some(MemoryLevel::L1),
            MemoryLevel::L1 => Some(MemoryLevel::L2),
            MemoryLevel::L2 => Some(MemoryLevel::L3),
            MemoryLevel::L3 => Some(MemoryLevel::L4),
            MemoryLevel::L4 => None,
        }
    }
}

impl std::fmt::Display for MemoryLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// EVENT
// ============================================================================

/// An immutable conversation event, the L0 unit of memory
///
/// `access_count` and `last_accessed_at` are the only mutable fields and
/// only move forward; the promotion level lives in its own table and is
/// mutated only by the graduation pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Unique identifier (UUID v4, assigned on append)
    pub id: String,
    /// Kind of event
    pub event_type: EventType,
    /// Session this event belongs to
    pub session_id: String,
    /// Wall-clock time at append
    pub timestamp: DateTime<Utc>,
    /// Content after the privacy filter ran
    pub content: String,
    /// Derived canonical key (see [`crate::canonical::canonical_key`])
    pub canonical_key: String,
    /// Derived dedupe key: `"{session_id}:{sha256(content)}"`
    pub dedupe_key: String,
    /// Free-form metadata object
    pub metadata: serde_json::Value,
    /// Times this memory was actually used in a prompt
    pub access_count: i64,
    /// When it was last used
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_accessed_at: Option<DateTime<Utc>>,
}

/// Input for appending a new event
///
/// Uses `deny_unknown_fields` to reject malformed hook payloads early.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AppendInput {
    /// Kind of event
    pub event_type: EventType,
    /// Session the event belongs to
    pub session_id: String,
    /// Content to persist (already privacy-filtered by the caller)
    pub content: String,
    /// Timestamp override; defaults to now
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    /// Free-form metadata object
    #[serde(default)]
    pub metadata: serde_json::Value,
    /// Project identifier folded into the canonical key
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
}

impl AppendInput {
    /// Build an input with just the required fields
    pub fn new(event_type: EventType, session_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            event_type,
            session_id: session_id.into(),
            content: content.into(),
            timestamp: None,
            metadata: serde_json::Value::Null,
            project: None,
        }
    }
}

/// Result of an append: either a fresh event or the id of the existing
/// duplicate. Duplicates are not errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppendResult {
    /// Id of the stored (or pre-existing) event
    pub event_id: String,
    /// True when the dedupe key already existed
    pub is_duplicate: bool,
}

// ============================================================================
// SESSIONS
// ============================================================================

/// A conversation session. Upsert-only; opened on the first event carrying
/// a new session id, closed by an explicit end call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Session identifier (host-assigned)
    pub id: String,
    /// When the session opened
    pub started_at: DateTime<Utc>,
    /// When the session ended, if it has
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    /// Project working directory, if known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_path: Option<String>,
    /// Summary attached on session end
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Tags attached on session end
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Partial session update; only supplied fields are written
#[derive(Debug, Clone, Default)]
pub struct SessionUpdate {
    pub ended_at: Option<DateTime<Utc>>,
    pub project_path: Option<String>,
    pub summary: Option<String>,
    pub tags: Option<Vec<String>>,
}

// ============================================================================
// OUTBOX
// ============================================================================

/// Lifecycle state of an outbox job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    /// Waiting to be claimed
    #[default]
    Pending,
    /// Claimed by the worker
    Processing,
    /// Completed (rows in this state are deleted, not retained)
    Done,
    /// Exhausted retries; retained for diagnosis
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Processing => "processing",
            OutboxStatus::Done => "done",
            OutboxStatus::Failed => "failed",
        }
    }

    pub fn parse_name(s: &str) -> Self {
        match s {
            "processing" => OutboxStatus::Processing,
            "done" => OutboxStatus::Done,
            "failed" => OutboxStatus::Failed,
            _ => OutboxStatus::Pending,
        }
    }
}

/// A durable embedding job. Enqueued atomically alongside the event it
/// indexes, claimed FIFO by the worker, deleted on completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxJob {
    /// Row id
    pub id: i64,
    /// Event to embed
    pub event_id: String,
    /// Snapshot of the content to embed
    pub content: String,
    /// Current lifecycle state
    pub status: OutboxStatus,
    /// Number of retries so far; never decreases
    pub retry_count: i64,
    /// When the job was enqueued
    pub created_at: DateTime<Utc>,
    /// When the job finished or failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
    /// Last failure reason
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

// ============================================================================
// INSIGHTS
// ============================================================================

/// Kinds of extracted insights
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsightKind {
    /// A canonical key recurring across events
    Pattern,
    /// A stated user preference
    Preference,
}

impl InsightKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InsightKind::Pattern => "pattern",
            InsightKind::Preference => "preference",
        }
    }

    pub fn parse_name(s: &str) -> Self {
        match s {
            "preference" => InsightKind::Preference,
            _ => InsightKind::Pattern,
        }
    }
}

/// An insight derived from graduated events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Insight {
    pub id: String,
    pub kind: InsightKind,
    /// Human-readable statement of the insight
    pub insight: String,
    /// Events the insight was derived from
    pub source_events: Vec<String>,
    /// Confidence in [0, 1]
    pub confidence: f64,
    pub extracted_at: DateTime<Utc>,
}

// ============================================================================
// ENDLESS MODE TYPES
// ============================================================================

/// Engine mode. Endless mode keeps a sliding working set that is
/// periodically consolidated into long-term memories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EngineMode {
    /// Plain per-session capture
    #[default]
    Session,
    /// Sliding working set + consolidation
    Endless,
}

impl EngineMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineMode::Session => "session",
            EngineMode::Endless => "endless",
        }
    }

    pub fn parse_name(s: &str) -> Self {
        match s {
            "endless" => EngineMode::Endless,
            _ => EngineMode::Session,
        }
    }
}

/// An item in the endless-mode working set
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkingSetItem {
    pub id: String,
    pub event_id: String,
    pub added_at: DateTime<Utc>,
    /// Relevance assigned by the host at add time
    pub relevance_score: f64,
    /// Topics extracted from the event content
    #[serde(default)]
    pub topics: Vec<String>,
    /// Items past this instant are pruned on read
    pub expires_at: DateTime<Utc>,
}

/// A long-term memory produced by consolidating a topic-cohesive group of
/// working-set items
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsolidatedMemory {
    pub memory_id: String,
    pub summary: String,
    pub topics: Vec<String>,
    pub source_events: Vec<String>,
    /// Confidence in [0, 1]
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accessed_at: Option<DateTime<Utc>>,
    pub access_count: i64,
}

/// How one context follows from the previous one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionType {
    /// Same thread of work
    Seamless,
    /// Related but shifted topic
    TopicShift,
    /// Unrelated context
    Break,
}

impl TransitionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransitionType::Seamless => "seamless",
            TransitionType::TopicShift => "topic_shift",
            TransitionType::Break => "break",
        }
    }

    pub fn parse_name(s: &str) -> Self {
        match s {
            "seamless" => TransitionType::Seamless,
            "topic_shift" => TransitionType::TopicShift,
            _ => TransitionType::Break,
        }
    }
}

/// Append-only record of a continuity scoring
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContinuityRecord {
    pub id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_context_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_context_id: Option<String>,
    pub score: f64,
    pub transition_type: TransitionType,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_roundtrip() {
        for event_type in [
            EventType::UserPrompt,
            EventType::AgentResponse,
            EventType::SessionSummary,
            EventType::ToolObservation,
        ] {
            assert_eq!(EventType::parse_name(event_type.as_str()), event_type);
        }
    }

    #[test]
    fn test_memory_level_ordering() {
        assert!(MemoryLevel::L0 < MemoryLevel::L1);
        assert!(MemoryLevel::L3 < MemoryLevel::L4);
        assert_eq!(MemoryLevel::L2.next(), Some(MemoryLevel::L3));
        assert_eq!(MemoryLevel::L4.next(), None);
    }

    #[test]
    fn test_memory_level_roundtrip() {
        for level in [
            MemoryLevel::L0,
            MemoryLevel::L1,
            MemoryLevel::L2,
            MemoryLevel::L3,
            MemoryLevel::L4,
        ] {
            assert_eq!(MemoryLevel::parse_name(level.as_str()), level);
        }
    }

    #[test]
    fn test_outbox_status_roundtrip() {
        for status in [
            OutboxStatus::Pending,
            OutboxStatus::Processing,
            OutboxStatus::Done,
            OutboxStatus::Failed,
        ] {
            assert_eq!(OutboxStatus::parse_name(status.as_str()), status);
        }
    }

    #[test]
    fn test_append_input_deny_unknown_fields() {
        let json = r#"{"eventType": "user_prompt", "sessionId": "s1", "content": "hi"}"#;
        let result: Result<AppendInput, _> = serde_json::from_str(json);
        assert!(result.is_ok());

        let json_with_unknown =
            r#"{"eventType": "user_prompt", "sessionId": "s1", "content": "hi", "extra": 1}"#;
        let result: Result<AppendInput, _> = serde_json::from_str(json_with_unknown);
        assert!(result.is_err());
    }

    #[test]
    fn test_transition_type_roundtrip() {
        for t in [
            TransitionType::Seamless,
            TransitionType::TopicShift,
            TransitionType::Break,
        ] {
            assert_eq!(TransitionType::parse_name(t.as_str()), t);
        }
    }
}
