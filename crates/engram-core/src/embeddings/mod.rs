//! Embeddings
//!
//! The `Embedder` contract the engine is written against, vector math
//! helpers, and the embedder implementations: local ONNX inference via
//! fastembed (behind the `embeddings` feature) and a deterministic
//! hashing embedder for tests and model-free installs.

#[cfg(feature = "embeddings")]
mod local;

#[cfg(feature = "embeddings")]
pub use local::{LocalEmbedder, MAX_TEXT_LENGTH};

/// Default embedding dimensionality (bge-small-en-v1.5)
pub const EMBEDDING_DIMENSIONS: usize = 384;

/// Embedding error types. The outbox worker treats both variants as
/// retryable.
#[non_exhaustive]
#[derive(Debug, Clone, thiserror::Error)]
pub enum EmbeddingError {
    /// Model missing, failed to load, or inference failed
    #[error("Embedder unavailable: {0}")]
    Unavailable(String),
    /// Input the model cannot embed (empty text, etc.)
    #[error("Invalid embedder input: {0}")]
    InvalidInput(String),
}

/// Embedding result type
pub type Result<T> = std::result::Result<T, EmbeddingError>;

/// Text → fixed-dimension unit vector. Implementations must be
/// thread-safe; initialization may lazily load a model.
pub trait Embedder: Send + Sync {
    /// Declared output dimensionality
    fn dimensions(&self) -> usize;

    /// Embed a single text
    fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed a batch of texts, one vector per input in order
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        texts.iter().map(|t| self.embed(t)).collect()
    }
}

/// L2-normalize a vector in place
pub fn normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    }
}

/// Compute cosine similarity between two vectors
#[inline]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let mut dot_product = 0.0_f32;
    let mut norm_a = 0.0_f32;
    let mut norm_b = 0.0_f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot_product += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denominator = (norm_a * norm_b).sqrt();
    if denominator > 0.0 {
        dot_product / denominator
    } else {
        0.0
    }
}

// ============================================================================
// HASHING EMBEDDER
// ============================================================================

/// Deterministic bag-of-tokens embedder: each token is FNV-1a hashed into
/// a bucket and the resulting histogram is L2-normalized. No model files,
/// no I/O, identical output on every platform. Used by the test suite and
/// by installs without the `embeddings` feature; token overlap maps to
/// cosine similarity, which is enough for coarse retrieval.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimensions: usize,
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(EMBEDDING_DIMENSIONS)
    }
}

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }
}

impl Embedder for HashingEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if text.trim().is_empty() {
            return Err(EmbeddingError::InvalidInput(
                "Text cannot be empty".to_string(),
            ));
        }
        let mut vector = vec![0.0_f32; self.dimensions];
        for token in text.split(|c: char| !c.is_alphanumeric()) {
            if token.is_empty() {
                continue;
            }
            let bucket = fnv1a(&token.to_lowercase()) as usize % self.dimensions;
            vector[bucket] += 1.0;
        }
        normalize(&mut vector);
        Ok(vector)
    }
}

/// FNV-1a, 64-bit
fn fnv1a(s: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in s.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity_identical() {
        let a = vec![1.0, 2.0, 3.0];
        let sim = cosine_similarity(&a, &a);
        assert!((sim - 1.0).abs() < 0.0001);
    }

    #[test]
    fn test_cosine_similarity_orthogonal() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &b).abs() < 0.0001);
    }

    #[test]
    fn test_normalize() {
        let mut v = vec![3.0, 4.0];
        normalize(&mut v);
        assert!((v[0] - 0.6).abs() < 0.0001);
        assert!((v[1] - 0.8).abs() < 0.0001);
    }

    #[test]
    fn test_hashing_embedder_deterministic_unit_vectors() {
        let embedder = HashingEmbedder::default();
        let a = embedder.embed("rate limiting in express").unwrap();
        let b = embedder.embed("rate limiting in express").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), EMBEDDING_DIMENSIONS);

        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 0.001);
    }

    #[test]
    fn test_hashing_embedder_overlap_beats_disjoint() {
        let embedder = HashingEmbedder::default();
        let query = embedder.embed("rate limiting").unwrap();
        let related = embedder.embed("implement rate limiting in Express").unwrap();
        let unrelated = embedder.embed("add passport authentication").unwrap();

        assert!(cosine_similarity(&query, &related) > cosine_similarity(&query, &unrelated));
    }

    #[test]
    fn test_hashing_embedder_rejects_empty() {
        let embedder = HashingEmbedder::default();
        assert!(matches!(
            embedder.embed("   "),
            Err(EmbeddingError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_embed_batch_default_impl() {
        let embedder = HashingEmbedder::default();
        let vectors = embedder.embed_batch(&["one two", "three four"]).unwrap();
        assert_eq!(vectors.len(), 2);
        assert_ne!(vectors[0], vectors[1]);
    }
}
