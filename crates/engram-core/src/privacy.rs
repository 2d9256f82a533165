//! Privacy Filter
//!
//! Runs on the write path before anything is persisted. Two mechanisms:
//!
//! 1. **Tagged redaction** - spans the user explicitly marked private
//!    (`<private>…</private>`, `[private]…[/private]`, or HTML-comment
//!    tags) are replaced by a marker. Unclosed tags are left untouched.
//! 2. **Pattern masking** - `key[:=]value` pairs whose key is a configured
//!    secret token (`password`, `api_key`, …) are replaced wholesale.
//!
//! Fenced code blocks are lifted out before either pass and restored
//! byte-identical afterwards, so tags and key/value pairs inside code are
//! treated as literal text.

use serde::{Deserialize, Serialize};

use crate::config::{PrivacyConfig, PrivateTagFormat};

/// Replacement for masked secret patterns
pub const REDACTED_MARKER: &str = "[REDACTED]";

/// Placeholder sentinel for extracted code fences. U+0001 cannot appear in
/// hook JSON string payloads that survived serde, so collisions with user
/// text are not a practical concern.
const FENCE_SENTINEL: char = '\u{1}';

/// What the filter observed, stored in the event metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterMetadata {
    pub has_private_tags: bool,
    pub private_tag_count: usize,
    pub pattern_match_count: usize,
    pub original_length: usize,
    pub filtered_length: usize,
}

/// Filtered text plus observation metadata
#[derive(Debug, Clone)]
pub struct FilterOutcome {
    pub content: String,
    pub metadata: FilterMetadata,
}

/// The privacy filter. Cheap to construct; holds only configuration.
#[derive(Debug, Clone)]
pub struct PrivacyFilter {
    config: PrivacyConfig,
}

impl Default for PrivacyFilter {
    fn default() -> Self {
        Self::new(PrivacyConfig::default())
    }
}

impl PrivacyFilter {
    pub fn new(config: PrivacyConfig) -> Self {
        Self { config }
    }

    /// Apply tagged redaction and pattern masking to `text`
    pub fn apply(&self, text: &str) -> FilterOutcome {
        let original_length = text.len();

        let (mut working, fences) = extract_code_fences(text);

        let mut tag_count = 0;
        if self.config.private_tags.enabled {
            let marker = self.config.private_tags.marker.as_str();
            for format in &self.config.private_tags.supported_formats {
                let (open, close) = format_delimiters(*format);
                let (redacted, count) = redact_tagged_spans(
                    &working,
                    open,
                    close,
                    marker,
                    self.config.private_tags.preserve_line_count,
                );
                working = redacted;
                tag_count += count;
            }
            if !marker.is_empty() {
                working = collapse_consecutive_markers(&working, marker);
            }
        }

        let mut pattern_count = 0;
        for token in &self.config.exclude_patterns {
            let (masked, count) = mask_secret_pattern(&working, token);
            working = masked;
            pattern_count += count;
        }

        let content = restore_code_fences(&working, &fences);

        FilterOutcome {
            metadata: FilterMetadata {
                has_private_tags: tag_count > 0,
                private_tag_count: tag_count,
                pattern_match_count: pattern_count,
                original_length,
                filtered_length: content.len(),
            },
            content,
        }
    }
}

/// Open/close delimiters for a tag format
fn format_delimiters(format: PrivateTagFormat) -> (&'static str, &'static str) {
    match format {
        PrivateTagFormat::Xml => ("<private>", "</private>"),
        PrivateTagFormat::Bracket => ("[private]", "[/private]"),
        PrivateTagFormat::Comment => ("<!-- private -->", "<!-- /private -->"),
    }
}

/// Lift fenced code blocks (``` delimited) out of the text, replacing each
/// with a sentinel placeholder. Returns the rewritten text and the
/// extracted blocks in order.
fn extract_code_fences(text: &str) -> (String, Vec<String>) {
    let mut fences = Vec::new();
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(open) = rest.find("```") {
        let after_open = &rest[open + 3..];
        match after_open.find("```") {
            Some(close) => {
                let fence = &rest[open..open + 3 + close + 3];
                out.push_str(&rest[..open]);
                out.push(FENCE_SENTINEL);
                out.push_str(&fences.len().to_string());
                out.push(FENCE_SENTINEL);
                fences.push(fence.to_string());
                rest = &rest[open + 3 + close + 3..];
            }
            None => {
                // Unterminated fence: leave everything from here literal
                break;
            }
        }
    }
    out.push_str(rest);
    (out, fences)
}

/// Put extracted fences back in place of their placeholders
fn restore_code_fences(text: &str, fences: &[String]) -> String {
    if fences.is_empty() {
        return text.to_string();
    }
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find(FENCE_SENTINEL) {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        match after.find(FENCE_SENTINEL) {
            Some(end) => {
                let index: usize = after[..end].parse().unwrap_or(usize::MAX);
                match fences.get(index) {
                    Some(fence) => out.push_str(fence),
                    None => out.push_str(&rest[start..start + 1 + end + 1]),
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                return out;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Replace balanced `open…close` spans with the marker. Nested opens are
/// absorbed by the outermost pair. An open with no balancing close is left
/// untouched, as is everything after it.
fn redact_tagged_spans(
    text: &str,
    open: &str,
    close: &str,
    marker: &str,
    preserve_line_count: bool,
) -> (String, usize) {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    let mut count = 0;

    while let Some(start) = rest.find(open) {
        let Some(span_end) = find_balanced_close(&rest[start..], open, close) else {
            break;
        };
        out.push_str(&rest[..start]);
        let inner = &rest[start + open.len()..start + span_end - close.len()];
        if inner.is_empty() {
            // Empty tags collapse to nothing
        } else {
            out.push_str(marker);
            if preserve_line_count {
                for _ in inner.matches('\n') {
                    out.push('\n');
                }
            }
            count += 1;
        }
        rest = &rest[start + span_end..];
    }
    out.push_str(rest);
    (out, count)
}

/// Byte offset just past the close tag that balances the open tag at the
/// start of `text`, or `None` if the span never closes
fn find_balanced_close(text: &str, open: &str, close: &str) -> Option<usize> {
    let mut depth = 0_usize;
    let mut pos = 0_usize;

    loop {
        let next_open = text[pos..].find(open).map(|i| pos + i);
        let next_close = text[pos..].find(close).map(|i| pos + i)?;

        match next_open {
            // `</private>` contains `<private>`-like substrings for no
            // format we support, but an open can still sit inside the
            // close's span when delimiters share a prefix; closest wins.
            Some(o) if o < next_close => {
                depth += 1;
                pos = o + open.len();
            }
            _ => {
                depth -= 1;
                pos = next_close + close.len();
                if depth == 0 {
                    return Some(pos);
                }
            }
        }
    }
}

/// Collapse runs of the marker (optionally whitespace-separated) into one
fn collapse_consecutive_markers(text: &str, marker: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find(marker) {
        let mut end = start + marker.len();
        loop {
            let tail = &rest[end..];
            let trimmed = tail.trim_start();
            if trimmed.starts_with(marker) {
                end += (tail.len() - trimmed.len()) + marker.len();
            } else {
                break;
            }
        }
        out.push_str(&rest[..start]);
        out.push_str(marker);
        rest = &rest[end..];
    }
    out.push_str(rest);
    out
}

/// Mask `token[:=]['"]?value` occurrences of a single secret token.
/// The span from the token (including one enclosing `[`/`]` pair when
/// present) through the value is replaced with `[REDACTED]`.
fn mask_secret_pattern(text: &str, token: &str) -> (String, usize) {
    if token.is_empty() {
        return (text.to_string(), 0);
    }
    // ASCII lowercasing preserves byte offsets into the original text
    let lower = text.to_ascii_lowercase();
    let token_lower = token.to_ascii_lowercase();

    let mut out = String::with_capacity(text.len());
    let mut cursor = 0_usize;
    let mut count = 0_usize;

    let mut search = 0_usize;
    while let Some(found) = lower[search..].find(&token_lower) {
        let token_start = search + found;
        let token_end = token_start + token_lower.len();
        search = token_end;

        if token_start < cursor {
            continue;
        }
        // Word boundary on the left so "mytoken" does not match "token"
        let prev = text[..token_start].chars().next_back();
        if prev.is_some_and(|c| c.is_alphanumeric() || c == '_') {
            continue;
        }

        let mut span_start = token_start;
        let bytes = text.as_bytes();
        let mut pos = token_end;

        // Optional closing bracket from a `[token]` spelling
        if bytes.get(pos) == Some(&b']') && text[..token_start].ends_with('[') {
            span_start -= 1;
            pos += 1;
        }
        // Optional spaces around the separator
        while bytes.get(pos) == Some(&b' ') {
            pos += 1;
        }
        let Some(sep) = bytes.get(pos) else { continue };
        if *sep != b':' && *sep != b'=' {
            continue;
        }
        pos += 1;
        while bytes.get(pos) == Some(&b' ') {
            pos += 1;
        }
        // Optional quote; a quoted value runs to the matching quote,
        // an unquoted one to the next whitespace
        let value_end = match bytes.get(pos) {
            Some(&q @ (b'"' | b'\'')) => text[pos + 1..]
                .find(q as char)
                .map(|i| pos + 1 + i + 1)
                .unwrap_or(text.len()),
            Some(_) => text[pos..]
                .find(char::is_whitespace)
                .map(|i| pos + i)
                .unwrap_or(text.len()),
            None => continue,
        };
        if value_end == pos {
            continue;
        }

        out.push_str(&text[cursor..span_start]);
        out.push_str(REDACTED_MARKER);
        cursor = value_end;
        search = value_end;
        count += 1;
    }
    out.push_str(&text[cursor..]);
    (out, count)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn filter() -> PrivacyFilter {
        PrivacyFilter::default()
    }

    #[test]
    fn test_xml_tag_redaction() {
        let out = filter().apply("before <private>sk-xxx</private> after");
        assert_eq!(out.content, "before [PRIVATE] after");
        assert!(out.metadata.has_private_tags);
        assert_eq!(out.metadata.private_tag_count, 1);
    }

    #[test]
    fn test_bracket_and_comment_tags() {
        let out = filter().apply("a [private]hidden[/private] b");
        assert_eq!(out.content, "a [PRIVATE] b");

        let out = filter().apply("a <!-- private -->hidden<!-- /private --> b");
        assert_eq!(out.content, "a [PRIVATE] b");
    }

    #[test]
    fn test_unclosed_tag_left_untouched() {
        let input = "start <private>never closed";
        let out = filter().apply(input);
        assert_eq!(out.content, input);
        assert!(!out.metadata.has_private_tags);
    }

    #[test]
    fn test_nested_tags_match_outer_pair() {
        let out = filter().apply("x <private>a <private>b</private> c</private> y");
        assert_eq!(out.content, "x [PRIVATE] y");
        assert_eq!(out.metadata.private_tag_count, 1);
    }

    #[test]
    fn test_empty_tag_collapses() {
        let out = filter().apply("a <private></private>b");
        assert_eq!(out.content, "a b");
        assert_eq!(out.metadata.private_tag_count, 0);
    }

    #[test]
    fn test_consecutive_markers_collapse() {
        let out = filter().apply("<private>a</private> <private>b</private>");
        assert_eq!(out.content, "[PRIVATE]");
        assert_eq!(out.metadata.private_tag_count, 2);
    }

    #[test]
    fn test_code_fence_is_byte_identical() {
        let input = "see ```\n<private>literal</private>\npassword=hunter2\n``` done <private>x</private>";
        let out = filter().apply(input);
        assert!(out
            .content
            .contains("```\n<private>literal</private>\npassword=hunter2\n```"));
        assert!(out.content.ends_with("done [PRIVATE]"));
        assert_eq!(out.metadata.private_tag_count, 1);
        assert_eq!(out.metadata.pattern_match_count, 0);
    }

    #[test]
    fn test_pattern_masking_variants() {
        let (masked, n) = mask_secret_pattern("password: hunter2 rest", "password");
        assert_eq!(masked, "[REDACTED] rest");
        assert_eq!(n, 1);

        let (masked, n) = mask_secret_pattern("api_key='abc123'", "api_key");
        assert_eq!(masked, "[REDACTED]");
        assert_eq!(n, 1);

        let (masked, n) = mask_secret_pattern("[password]=\"p1\"", "password");
        assert_eq!(masked, "[REDACTED]");
        assert_eq!(n, 1);

        // No separator means no mask
        let (masked, n) = mask_secret_pattern("the password was wrong", "password");
        assert_eq!(masked, "the password was wrong");
        assert_eq!(n, 0);

        // Word boundary: "mytoken=1" is not a "token" match
        let (masked, n) = mask_secret_pattern("mytoken=1", "token");
        assert_eq!(masked, "mytoken=1");
        assert_eq!(n, 0);
    }

    #[test]
    fn test_combined_scenario() {
        let out = filter().apply("before <private>sk-xxx</private> after\n[password]=\"p1\"");
        assert_eq!(out.content, "before [PRIVATE] after\n[REDACTED]");
        assert!(out.metadata.has_private_tags);
        assert_eq!(out.metadata.private_tag_count, 1);
        assert_eq!(out.metadata.pattern_match_count, 1);
        assert_eq!(
            out.metadata.original_length,
            "before <private>sk-xxx</private> after\n[password]=\"p1\"".len()
        );
        assert_eq!(out.metadata.filtered_length, out.content.len());
    }

    #[test]
    fn test_empty_marker_removes_spans() {
        let mut config = PrivacyConfig::default();
        config.private_tags.marker = String::new();
        let out = PrivacyFilter::new(config).apply("a <private>x</private> b");
        assert_eq!(out.content, "a  b");
    }

    #[test]
    fn test_preserve_line_count() {
        let mut config = PrivacyConfig::default();
        config.private_tags.preserve_line_count = true;
        let out = PrivacyFilter::new(config).apply("a <private>x\ny\nz</private> b");
        assert_eq!(out.content, "a [PRIVATE]\n\n b");
    }

    #[test]
    fn test_no_closed_private_span_survives() {
        let out = filter().apply("<private>one</private> mid <private>two</private>");
        assert!(!out.content.contains("<private>"));
        assert!(!out.content.contains("</private>"));
    }
}
