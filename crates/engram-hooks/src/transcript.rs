//! Transcript Reader
//!
//! The host records the conversation as JSONL; the Stop hook reads the
//! assistant's turn text from it rather than from the hook payload.
//! Only a trailing window of the file is scanned, so huge transcripts
//! stay cheap, and malformed lines are skipped.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

/// Trailing window scanned per read
pub const WINDOW_BYTES: u64 = 200 * 1024;

/// Read the assistant text blocks from the tail of a transcript file, in
/// order of appearance. Each returned string is one assistant line's text
/// blocks joined with newlines.
pub fn read_assistant_texts(path: &Path) -> std::io::Result<Vec<String>> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();

    let start = len.saturating_sub(WINDOW_BYTES);
    file.seek(SeekFrom::Start(start))?;
    let mut raw = String::new();
    file.read_to_string(&mut raw)?;

    let mut lines: Vec<&str> = raw.lines().collect();
    // A mid-file window start usually lands mid-line; drop the fragment
    if start > 0 && !lines.is_empty() {
        lines.remove(0);
    }

    let mut texts = Vec::new();
    for line in lines {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(value) = serde_json::from_str::<serde_json::Value>(line) else {
            continue;
        };
        if let Some(text) = assistant_text(&value) {
            if !text.is_empty() {
                texts.push(text);
            }
        }
    }
    Ok(texts)
}

/// Extract the joined text blocks from one transcript line, if it is an
/// assistant entry. Accepts both `{"type":"assistant","message":{...}}`
/// and a bare `{"role":"assistant","content":[...]}` shape.
fn assistant_text(value: &serde_json::Value) -> Option<String> {
    let obj = value.as_object()?;

    let message = match obj.get("message") {
        Some(message) => {
            if obj.get("type").and_then(|t| t.as_str()) != Some("assistant") {
                return None;
            }
            message
        }
        None => {
            if obj.get("role").and_then(|r| r.as_str()) != Some("assistant") {
                return None;
            }
            value
        }
    };

    let content = message.get("content")?.as_array()?;
    let blocks: Vec<&str> = content
        .iter()
        .filter(|block| block.get("type").and_then(|t| t.as_str()) == Some("text"))
        .filter_map(|block| block.get("text").and_then(|t| t.as_str()))
        .collect();
    if blocks.is_empty() {
        return None;
    }
    Some(blocks.join("\n"))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn assistant_line(text: &str) -> String {
        serde_json::json!({
            "type": "assistant",
            "message": {
                "role": "assistant",
                "content": [{"type": "text", "text": text}]
            }
        })
        .to_string()
    }

    fn user_line(text: &str) -> String {
        serde_json::json!({
            "type": "user",
            "message": {"role": "user", "content": [{"type": "text", "text": text}]}
        })
        .to_string()
    }

    #[test]
    fn test_reads_assistant_text_in_order() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "{}", user_line("question one")).unwrap();
        writeln!(file, "{}", assistant_line("answer one")).unwrap();
        writeln!(file, "{}", user_line("question two")).unwrap();
        writeln!(file, "{}", assistant_line("answer two")).unwrap();

        let texts = read_assistant_texts(file.path()).unwrap();
        assert_eq!(texts, vec!["answer one", "answer two"]);
    }

    #[test]
    fn test_skips_malformed_lines() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "this is not json").unwrap();
        writeln!(file, "{{\"type\": \"assistant\"").unwrap();
        writeln!(file, "{}", assistant_line("survives")).unwrap();

        let texts = read_assistant_texts(file.path()).unwrap();
        assert_eq!(texts, vec!["survives"]);
    }

    #[test]
    fn test_joins_multiple_text_blocks() {
        let mut file = NamedTempFile::new().unwrap();
        let line = serde_json::json!({
            "type": "assistant",
            "message": {"content": [
                {"type": "text", "text": "part one"},
                {"type": "tool_use", "name": "Bash", "input": {}},
                {"type": "text", "text": "part two"}
            ]}
        });
        writeln!(file, "{}", line).unwrap();

        let texts = read_assistant_texts(file.path()).unwrap();
        assert_eq!(texts, vec!["part one\npart two"]);
    }

    #[test]
    fn test_window_drops_leading_fragment() {
        let mut file = NamedTempFile::new().unwrap();
        // Enough padding lines to push the file past the window
        let filler = user_line(&"x".repeat(2048));
        let lines = (WINDOW_BYTES / filler.len() as u64) + 4;
        for _ in 0..lines {
            writeln!(file, "{}", filler).unwrap();
        }
        writeln!(file, "{}", assistant_line("the final answer")).unwrap();

        let texts = read_assistant_texts(file.path()).unwrap();
        assert_eq!(texts.last().map(|s| s.as_str()), Some("the final answer"));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        assert!(read_assistant_texts(Path::new("/no/such/transcript.jsonl")).is_err());
    }

    #[test]
    fn test_bare_role_shape() {
        let mut file = NamedTempFile::new().unwrap();
        let line = serde_json::json!({
            "role": "assistant",
            "content": [{"type": "text", "text": "bare shape"}]
        });
        writeln!(file, "{}", line).unwrap();
        let texts = read_assistant_texts(file.path()).unwrap();
        assert_eq!(texts, vec!["bare shape"]);
    }
}
