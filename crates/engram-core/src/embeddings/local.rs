//! Local Semantic Embeddings
//!
//! Fastembed-backed implementation of the `Embedder` contract, running
//! bge-small-en-v1.5 (384 dimensions) through ONNX on the local machine.
//! One model instance serves the whole process; it loads on first use and
//! a failed load is remembered so later calls fail fast instead of
//! re-downloading.

use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};

use super::{EMBEDDING_DIMENSIONS, Embedder, EmbeddingError, Result, normalize};

/// Maximum text length for embedding (truncated if longer)
pub const MAX_TEXT_LENGTH: usize = 8192;

/// Batch size for model inference
const MODEL_BATCH_SIZE: usize = 32;

/// Process-wide model slot. Holds either the live model or the reason the
/// load failed.
static MODEL: OnceLock<std::result::Result<Mutex<TextEmbedding>, String>> = OnceLock::new();

/// Where model files live. `FASTEMBED_CACHE_PATH` wins; otherwise the
/// platform cache directory, with a working-directory dot-folder as the
/// last resort.
fn model_cache_dir() -> PathBuf {
    std::env::var_os("FASTEMBED_CACHE_PATH")
        .map(PathBuf::from)
        .or_else(|| {
            directories::ProjectDirs::from("dev", "engram", "core")
                .map(|dirs| dirs.cache_dir().join("fastembed"))
        })
        .unwrap_or_else(|| PathBuf::from(".engram-models"))
}

fn load_model() -> std::result::Result<Mutex<TextEmbedding>, String> {
    let cache = model_cache_dir();
    if let Err(e) = std::fs::create_dir_all(&cache) {
        tracing::warn!("Could not create model cache {:?}: {}", cache, e);
    }
    let options = InitOptions::new(EmbeddingModel::BGESmallENV15)
        .with_show_download_progress(false)
        .with_cache_dir(cache);
    match TextEmbedding::try_new(options) {
        Ok(model) => Ok(Mutex::new(model)),
        Err(e) => Err(format!(
            "bge-small-en-v1.5 failed to load ({}); check that the ONNX \
             runtime is present and the model files are reachable",
            e
        )),
    }
}

/// Run `f` against the shared model, loading it on the first call
fn with_model<T>(f: impl FnOnce(&mut TextEmbedding) -> Result<T>) -> Result<T> {
    match MODEL.get_or_init(load_model) {
        Ok(model) => {
            let mut guard = model
                .lock()
                .map_err(|_| EmbeddingError::Unavailable("Model lock poisoned".to_string()))?;
            f(&mut guard)
        }
        Err(reason) => Err(EmbeddingError::Unavailable(reason.clone())),
    }
}

/// Truncate text to the model's supported length on a char boundary
fn clip(text: &str) -> &str {
    if text.len() <= MAX_TEXT_LENGTH {
        return text;
    }
    let mut end = MAX_TEXT_LENGTH;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Embedder backed by the shared fastembed model
#[derive(Debug, Clone, Default)]
pub struct LocalEmbedder {
    _unused: (),
}

impl LocalEmbedder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check whether the model loaded (triggers lazy init)
    pub fn is_ready(&self) -> bool {
        match with_model(|_| Ok(())) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Embedding model not ready: {}", e);
                false
            }
        }
    }

    /// Model identifier for vector-record versioning
    pub fn model_name(&self) -> &'static str {
        "BAAI/bge-small-en-v1.5"
    }
}

impl Embedder for LocalEmbedder {
    fn dimensions(&self) -> usize {
        EMBEDDING_DIMENSIONS
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if text.trim().is_empty() {
            return Err(EmbeddingError::InvalidInput(
                "Text cannot be empty".to_string(),
            ));
        }
        with_model(|model| {
            let mut vectors = model
                .embed(vec![clip(text)], None)
                .map_err(|e| EmbeddingError::Unavailable(e.to_string()))?;
            let mut vector = vectors.pop().ok_or_else(|| {
                EmbeddingError::Unavailable("Model returned no vector".to_string())
            })?;
            normalize(&mut vector);
            Ok(vector)
        })
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }
        if let Some(empty) = texts.iter().position(|t| t.trim().is_empty()) {
            return Err(EmbeddingError::InvalidInput(format!(
                "Text at index {} is empty",
                empty
            )));
        }

        with_model(|model| {
            let mut all = Vec::with_capacity(texts.len());
            for chunk in texts.chunks(MODEL_BATCH_SIZE) {
                let clipped: Vec<&str> = chunk.iter().map(|t| clip(t)).collect();
                let vectors = model
                    .embed(clipped, None)
                    .map_err(|e| EmbeddingError::Unavailable(e.to_string()))?;
                for mut vector in vectors {
                    normalize(&mut vector);
                    all.push(vector);
                }
            }
            Ok(all)
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clip_respects_char_boundaries() {
        let long = "\u{00e9}".repeat(MAX_TEXT_LENGTH); // 2 bytes per char
        let clipped = clip(&long);
        assert!(clipped.len() <= MAX_TEXT_LENGTH);
        assert!(clipped.is_char_boundary(clipped.len()));
    }

    #[test]
    fn test_clip_short_text_untouched() {
        assert_eq!(clip("hello"), "hello");
    }

    #[test]
    fn test_cache_dir_env_override() {
        // Read-only check: the env var, when set, takes precedence
        if let Some(path) = std::env::var_os("FASTEMBED_CACHE_PATH") {
            assert_eq!(model_cache_dir(), PathBuf::from(path));
        } else {
            assert!(!model_cache_dir().as_os_str().is_empty());
        }
    }
}
