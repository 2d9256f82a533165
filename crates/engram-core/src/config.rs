//! Engine Configuration
//!
//! All tunables recognized by the engine, loadable from `config.json`
//! under the base storage directory. Every field has a default so a
//! missing or partial file behaves sensibly.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::events::EngineMode;

/// Default base directory name under the home directory
pub const DEFAULT_BASE_DIR: &str = ".claude-code/memory";

/// Embedding provider selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingProvider {
    /// Local ONNX inference via fastembed
    #[default]
    Local,
    /// OpenAI embedding API (recognized but not shipped; falls back to local)
    Openai,
}

/// Storage options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageConfig {
    /// Base directory; `None` resolves to `~/.claude-code/memory`
    pub path: Option<PathBuf>,
    /// Advisory size cap, surfaced in stats and never enforced
    pub max_size_mb: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: None,
            max_size_mb: 1024,
        }
    }
}

/// Embedding options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingProvider,
    /// Local model name
    pub model: String,
    /// Model used when the provider is `openai`
    pub openai_model: String,
    /// Batch size for the outbox worker
    pub batch_size: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProvider::Local,
            model: "BAAI/bge-small-en-v1.5".to_string(),
            openai_model: "text-embedding-3-small".to_string(),
            batch_size: 32,
        }
    }
}

/// Retrieval options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetrievalConfig {
    pub top_k: usize,
    pub min_score: f64,
    pub max_tokens: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            min_score: 0.3,
            max_tokens: 2000,
        }
    }
}

/// Score-fusion weights
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MatchWeights {
    pub semantic: f64,
    pub fts: f64,
    pub recency: f64,
    pub status: f64,
}

impl Default for MatchWeights {
    fn default() -> Self {
        Self {
            semantic: 0.40,
            fts: 0.25,
            recency: 0.20,
            status: 0.15,
        }
    }
}

/// Matching thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MatchingConfig {
    pub min_combined_score: f64,
    pub min_gap: f64,
    pub suggestion_threshold: f64,
    pub weights: MatchWeights,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            min_combined_score: 0.92,
            min_gap: 0.03,
            suggestion_threshold: 0.75,
            weights: MatchWeights::default(),
        }
    }
}

/// Tag formats the privacy filter recognizes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrivateTagFormat {
    /// `<private>…</private>`
    Xml,
    /// `[private]…[/private]`
    Bracket,
    /// `<!-- private -->…<!-- /private -->`
    Comment,
}

/// Private-tag redaction options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PrivateTagConfig {
    pub enabled: bool,
    /// Replacement marker; empty string removes tagged spans entirely
    pub marker: String,
    pub preserve_line_count: bool,
    pub supported_formats: Vec<PrivateTagFormat>,
}

impl Default for PrivateTagConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            marker: "[PRIVATE]".to_string(),
            preserve_line_count: false,
            supported_formats: vec![
                PrivateTagFormat::Xml,
                PrivateTagFormat::Bracket,
                PrivateTagFormat::Comment,
            ],
        }
    }
}

/// Privacy-filter options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PrivacyConfig {
    /// Secret-bearing key tokens masked as `key=value` pairs
    pub exclude_patterns: Vec<String>,
    pub anonymize: bool,
    pub private_tags: PrivateTagConfig,
}

impl Default for PrivacyConfig {
    fn default() -> Self {
        Self {
            exclude_patterns: vec![
                "password".to_string(),
                "secret".to_string(),
                "api_key".to_string(),
                "apikey".to_string(),
                "token".to_string(),
                "bearer".to_string(),
                "credential".to_string(),
            ],
            anonymize: false,
            private_tags: PrivateTagConfig::default(),
        }
    }
}

/// Tool-observation capture options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ToolObservationConfig {
    pub enabled: bool,
    pub excluded_tools: Vec<String>,
    pub max_output_length: usize,
    pub max_output_lines: usize,
    pub store_only_on_success: bool,
}

impl Default for ToolObservationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            excluded_tools: vec!["TodoWrite".to_string(), "AskUserQuestion".to_string()],
            max_output_length: 2000,
            max_output_lines: 40,
            store_only_on_success: false,
        }
    }
}

/// Shared cross-project store options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SharedStoreConfig {
    pub enabled: bool,
    pub auto_promote: bool,
    pub search_shared: bool,
    pub min_confidence_for_promotion: f64,
    /// Override for the shared subdirectory; `None` resolves to `base/shared`
    pub shared_storage_path: Option<PathBuf>,
}

impl Default for SharedStoreConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            auto_promote: false,
            search_shared: true,
            min_confidence_for_promotion: 0.8,
            shared_storage_path: None,
        }
    }
}

/// Feature toggles
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FeatureConfig {
    pub auto_save: bool,
    pub session_summary: bool,
    pub insight_extraction: bool,
    pub cross_project_learning: bool,
    pub single_writer_mode: bool,
    pub shared_store: SharedStoreConfig,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            auto_save: true,
            session_summary: true,
            insight_extraction: true,
            cross_project_learning: false,
            single_writer_mode: true,
            shared_store: SharedStoreConfig::default(),
        }
    }
}

/// Working-set tunables for endless mode
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkingSetConfig {
    pub max_events: usize,
    pub time_window_hours: i64,
}

impl Default for WorkingSetConfig {
    fn default() -> Self {
        Self {
            max_events: 100,
            time_window_hours: 24,
        }
    }
}

/// Consolidation tunables for endless mode
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConsolidationConfig {
    pub trigger_interval_ms: u64,
    pub trigger_event_count: usize,
    pub trigger_idle_ms: u64,
    /// Minimum items a topic group needs before it is consolidated
    pub min_group_size: usize,
    pub use_llm_summarization: bool,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            trigger_interval_ms: 60 * 60 * 1000,
            trigger_event_count: 50,
            trigger_idle_ms: 30 * 60 * 1000,
            min_group_size: 3,
            use_llm_summarization: false,
        }
    }
}

/// Continuity-scoring tunables for endless mode
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContinuityConfig {
    pub decay_hours: f64,
    pub seamless_threshold: f64,
    pub topic_shift_threshold: f64,
}

impl Default for ContinuityConfig {
    fn default() -> Self {
        Self {
            decay_hours: 4.0,
            seamless_threshold: 0.7,
            topic_shift_threshold: 0.4,
        }
    }
}

/// Endless-mode sub-config
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct EndlessConfig {
    pub working_set: WorkingSetConfig,
    pub consolidation: ConsolidationConfig,
    pub continuity: ContinuityConfig,
}

/// Outbox worker tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkerConfig {
    pub poll_interval_ms: u64,
    pub batch_size: usize,
    pub max_retries: i64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            batch_size: 16,
            max_retries: 3,
        }
    }
}

/// Graduation worker tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GraduationWorkerConfig {
    pub evaluation_interval_ms: u64,
    pub batch_size: usize,
    pub cooldown_ms: u64,
}

impl Default for GraduationWorkerConfig {
    fn default() -> Self {
        Self {
            evaluation_interval_ms: 5 * 60 * 1000,
            batch_size: 50,
            cooldown_ms: 60 * 60 * 1000,
        }
    }
}

/// Root configuration object
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct MemoryConfig {
    pub storage: StorageConfig,
    pub embedding: EmbeddingConfig,
    pub retrieval: RetrievalConfig,
    pub matching: MatchingConfig,
    pub privacy: PrivacyConfig,
    pub tool_observation: ToolObservationConfig,
    pub features: FeatureConfig,
    pub mode: EngineMode,
    pub endless: EndlessConfig,
    pub worker: WorkerConfig,
    pub graduation: GraduationWorkerConfig,
}

impl MemoryConfig {
    /// Load from `config.json` in `base_dir`, falling back to defaults when
    /// the file is missing. A present-but-invalid file is an error so typos
    /// do not silently disable configured behavior.
    pub fn load(base_dir: &Path) -> Result<Self, ConfigError> {
        let path = base_dir.join("config.json");
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(&path)
            .map_err(|e| ConfigError::Io(path.display().to_string(), e))?;
        serde_json::from_str(&raw).map_err(|e| ConfigError::Parse(path.display().to_string(), e))
    }

    /// Resolve the base directory, honoring the configured override
    pub fn resolve_base_dir(&self) -> PathBuf {
        if let Some(path) = &self.storage.path {
            return path.clone();
        }
        directories::BaseDirs::new()
            .map(|dirs| dirs.home_dir().join(DEFAULT_BASE_DIR))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_BASE_DIR))
    }
}

/// Configuration error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {0}: {1}")]
    Io(String, #[source] std::io::Error),
    #[error("Failed to parse config {0}: {1}")]
    Parse(String, #[source] serde_json::Error),
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MemoryConfig::default();
        assert_eq!(config.matching.min_combined_score, 0.92);
        assert_eq!(config.matching.min_gap, 0.03);
        assert_eq!(config.matching.suggestion_threshold, 0.75);
        assert_eq!(config.matching.weights.semantic, 0.40);
        assert_eq!(config.worker.max_retries, 3);
        assert_eq!(config.mode, EngineMode::Session);
        assert!(config.privacy.private_tags.enabled);
    }

    #[test]
    fn test_partial_config_merges_over_defaults() {
        let json = r#"{"retrieval": {"topK": 8}, "mode": "endless"}"#;
        let config: MemoryConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.retrieval.top_k, 8);
        assert_eq!(config.retrieval.max_tokens, 2000);
        assert_eq!(config.mode, EngineMode::Endless);
    }

    #[test]
    fn test_unknown_top_level_key_rejected() {
        let json = r#"{"retreival": {"topK": 8}}"#;
        let result: Result<MemoryConfig, _> = serde_json::from_str(json);
        assert!(result.is_err());
    }

    #[test]
    fn test_load_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = MemoryConfig::load(dir.path()).unwrap();
        assert_eq!(config.retrieval.top_k, 5);
    }

    #[test]
    fn test_load_invalid_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.json"), "{not json").unwrap();
        assert!(MemoryConfig::load(dir.path()).is_err());
    }
}
