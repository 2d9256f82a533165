//! Canonical Keys
//!
//! Deterministic text normalization used for grouping semantically
//! equivalent items, and content-addressed dedupe keys for idempotent
//! ingestion. Pure functions, no I/O.

use sha2::{Digest, Sha256};
use unicode_normalization::UnicodeNormalization;

/// Maximum byte length of a canonical key before truncation kicks in
pub const MAX_KEY_BYTES: usize = 200;

/// Byte length the key is truncated to before the hash suffix is appended
const TRUNCATED_KEY_BYTES: usize = 191;

/// Optional context for canonical key derivation
#[derive(Debug, Clone, Default)]
pub struct KeyContext {
    /// Project identifier prefixed onto the key (`"{project}::"`)
    pub project: Option<String>,
}

/// Derive the canonical key for a piece of text.
///
/// Normalization steps, in order: NFKC, lowercase, strip characters that
/// are not Unicode letters, numbers, or whitespace, collapse whitespace
/// runs to single spaces and trim. With a project context the result is
/// prefixed with `"{project}::"`. Keys longer than 200 bytes are truncated
/// to 191 bytes plus `"_"` and the first 8 hex chars of the MD5 of the
/// full key, so over-long inputs still map to stable distinct keys.
pub fn canonical_key(text: &str, ctx: Option<&KeyContext>) -> String {
    let normalized: String = text.nfkc().collect::<String>().to_lowercase();

    let stripped: String = normalized
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c.is_whitespace() {
                c
            } else {
                ' '
            }
        })
        .collect();

    let collapsed = stripped.split_whitespace().collect::<Vec<_>>().join(" ");

    let key = match ctx.and_then(|c| c.project.as_deref()) {
        Some(project) => format!("{}::{}", project, collapsed),
        None => collapsed,
    };

    if key.len() <= MAX_KEY_BYTES {
        return key;
    }

    let digest = md5::compute(key.as_bytes());
    let suffix = hex::encode(digest.0);
    let mut truncated = truncate_on_char_boundary(&key, TRUNCATED_KEY_BYTES).to_string();
    truncated.push('_');
    truncated.push_str(&suffix[..8]);
    truncated
}

/// Derive the dedupe key for event content within a session:
/// `"{session_id}:{sha256_hex(content)}"`.
///
/// The session id partitions the key space so identical content in two
/// sessions produces two distinct events.
pub fn dedupe_key(content: &str, session_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{}:{}", session_id, hex::encode(hasher.finalize()))
}

/// Truncate to at most `max_bytes`, backing up to a UTF-8 char boundary
fn truncate_on_char_boundary(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
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

    #[test]
    fn test_canonical_key_deterministic() {
        let text = "How do I configure Rate-Limiting?!";
        assert_eq!(canonical_key(text, None), canonical_key(text, None));
        assert_eq!(
            canonical_key(text, None),
            "how do i configure rate limiting"
        );
    }

    #[test]
    fn test_canonical_key_collapses_whitespace() {
        assert_eq!(canonical_key("  a\t\tb \n c  ", None), "a b c");
    }

    #[test]
    fn test_canonical_key_nfkc_equivalence() {
        // Full-width latin letters NFKC-normalize to ASCII
        let fullwidth = "ＡＢＣ";
        assert_eq!(canonical_key(fullwidth, None), "abc");

        // NFD decomposition (e + combining acute) matches the composed form
        let composed = "caf\u{e9}";
        let decomposed = "cafe\u{301}";
        assert_eq!(
            canonical_key(composed, None),
            canonical_key(decomposed, None)
        );
    }

    #[test]
    fn test_canonical_key_project_prefix() {
        let ctx = KeyContext {
            project: Some("acme".to_string()),
        };
        assert_eq!(canonical_key("Hello World", Some(&ctx)), "acme::hello world");
    }

    #[test]
    fn test_canonical_key_truncation() {
        let long = "word ".repeat(100);
        let key = canonical_key(&long, None);
        assert!(key.len() <= MAX_KEY_BYTES);
        // 191 bytes + "_" + 8 hex chars
        assert_eq!(key.len(), TRUNCATED_KEY_BYTES + 1 + 8);
        assert!(key.as_bytes()[TRUNCATED_KEY_BYTES] == b'_');

        // Still deterministic, and distinct inputs stay distinct
        assert_eq!(key, canonical_key(&long, None));
        let other = "talk ".repeat(100);
        assert_ne!(key, canonical_key(&other, None));
    }

    #[test]
    fn test_canonical_key_truncation_respects_char_boundaries() {
        let long = "\u{00e9}".repeat(150); // 2 bytes per char, 300 bytes total
        let key = canonical_key(&long, None);
        assert!(key.len() <= MAX_KEY_BYTES);
        assert!(key.is_char_boundary(key.len() - 9));
    }

    #[test]
    fn test_dedupe_key_partitions_by_session() {
        let k1 = dedupe_key("same content", "s1");
        let k2 = dedupe_key("same content", "s2");
        assert_ne!(k1, k2);
        assert!(k1.starts_with("s1:"));
        assert!(k2.starts_with("s2:"));
        assert_eq!(k1, dedupe_key("same content", "s1"));
    }

    #[test]
    fn test_dedupe_key_shape() {
        let key = dedupe_key("Hello", "abc");
        // "abc:" + 64 hex chars of sha256
        assert_eq!(key.len(), 4 + 64);
    }
}
