//! Hook Protocol
//!
//! Wire types and dispatch for the host's hook invocations. One JSON
//! object arrives on stdin, one JSON object leaves on stdout, and the
//! process always exits 0: a memory failure must never break the host.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use engram_core::{ContextSnapshot, EventType, ProjectRouter, extract_topics};

use crate::transcript;

/// Soft retrieval deadline inside the host's hook budget
const RETRIEVE_DEADLINE_MS: u64 = 2500;

/// The hook kinds the engine recognizes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    SessionStart,
    UserPromptSubmit,
    Stop,
    SessionEnd,
    PostToolUse,
}

/// Tool output payload of a PostToolUse hook. The host spells most fields
/// snake_case but `isImage` camel; aliases accept both.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ToolResponse {
    #[serde(default)]
    pub stdout: Option<String>,
    #[serde(default)]
    pub stderr: Option<String>,
    #[serde(default)]
    pub content: Option<serde_json::Value>,
    #[serde(default)]
    pub interrupted: Option<bool>,
    #[serde(default, alias = "isImage")]
    pub is_image: Option<bool>,
}

/// The union of all hook payloads; unknown fields are ignored so newer
/// hosts do not break older engines
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HookInput {
    #[serde(default)]
    pub hook_event_name: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub transcript_path: Option<String>,
    #[serde(default)]
    pub permission_mode: Option<String>,
    #[serde(default)]
    pub stop_hook_active: Option<bool>,
    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub tool_input: Option<serde_json::Value>,
    #[serde(default)]
    pub tool_use_id: Option<String>,
    #[serde(default)]
    pub tool_response: Option<ToolResponse>,
    #[serde(default)]
    pub summary: Option<String>,
}

impl HookInput {
    /// Resolve the hook kind, preferring the explicit event name and
    /// falling back to shape inference for hosts that omit it
    pub fn kind(&self) -> Option<HookKind> {
        if let Some(name) = &self.hook_event_name {
            return match name.as_str() {
                "SessionStart" => Some(HookKind::SessionStart),
                "UserPromptSubmit" => Some(HookKind::UserPromptSubmit),
                "Stop" => Some(HookKind::Stop),
                "SessionEnd" => Some(HookKind::SessionEnd),
                "PostToolUse" => Some(HookKind::PostToolUse),
                _ => None,
            };
        }
        if self.tool_name.is_some() {
            return Some(HookKind::PostToolUse);
        }
        if self.prompt.is_some() {
            return Some(HookKind::UserPromptSubmit);
        }
        if self.transcript_path.is_some() {
            return Some(HookKind::Stop);
        }
        if self.cwd.is_some() {
            return Some(HookKind::SessionStart);
        }
        if self.session_id.is_some() {
            return Some(HookKind::SessionEnd);
        }
        None
    }
}

/// The single output shape: an optional context string
#[derive(Debug, Clone, Default, Serialize)]
pub struct HookOutput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

impl HookOutput {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_context(context: String) -> Self {
        Self {
            context: Some(context),
        }
    }
}

// ============================================================================
// DISPATCH
// ============================================================================

/// Handle one hook invocation. Every error path degrades to the empty
/// output; the host never sees a failure.
pub fn handle(router: &ProjectRouter, input: HookInput) -> HookOutput {
    let Some(kind) = input.kind() else {
        tracing::debug!("Unrecognized hook payload");
        return HookOutput::empty();
    };
    let Some(session_id) = input.session_id.clone() else {
        tracing::debug!("Hook without session_id");
        return HookOutput::empty();
    };

    let result = match kind {
        HookKind::SessionStart => on_session_start(router, &session_id, &input),
        HookKind::UserPromptSubmit => on_user_prompt(router, &session_id, &input),
        HookKind::Stop => on_stop(router, &session_id, &input),
        HookKind::SessionEnd => on_session_end(router, &session_id, &input),
        HookKind::PostToolUse => on_post_tool_use(router, &session_id, &input),
    };
    result.unwrap_or_else(|e| {
        tracing::warn!("Hook handling failed: {}", e);
        HookOutput::empty()
    })
}

type HookResult = Result<HookOutput, engram_core::StoreError>;

fn on_session_start(router: &ProjectRouter, session_id: &str, input: &HookInput) -> HookResult {
    if let Some(cwd) = &input.cwd {
        router.register_session(session_id, Path::new(cwd))?;
    }
    let service = router.get_service_for_session(session_id)?;

    // Surface the most recent session summary, if one exists
    let summary = service
        .store()
        .get_recent(50)?
        .into_iter()
        .find(|e| e.event_type == EventType::SessionSummary);
    Ok(match summary {
        Some(event) => HookOutput::with_context(format!(
            "## Previous Session\n\n{}",
            event.content
        )),
        None => HookOutput::empty(),
    })
}

fn on_user_prompt(router: &ProjectRouter, session_id: &str, input: &HookInput) -> HookResult {
    let Some(prompt) = &input.prompt else {
        return Ok(HookOutput::empty());
    };
    let service = router.get_service_for_session(session_id)?;

    if service.config().features.auto_save {
        service.append_event(
            EventType::UserPrompt,
            session_id,
            prompt,
            serde_json::Value::Null,
        )?;
    }

    if service.mode()? == engram_core::EngineMode::Endless {
        let snapshot = ContextSnapshot {
            id: format!("{}:{}", session_id, chrono::Utc::now().timestamp_millis()),
            topics: extract_topics(prompt),
            files: vec![],
            entities: vec![],
            timestamp: chrono::Utc::now(),
        };
        if let Err(e) = service.score_continuity(&snapshot) {
            tracing::debug!("Continuity scoring failed: {}", e);
        }
    }

    // Memories from any session in this project are fair game; the
    // accessing session only attributes the access
    let mut opts = service.retrieve_options();
    opts.accessing_session = Some(session_id.to_string());
    opts.include_session_context = true;
    opts.deadline = Some(Instant::now() + Duration::from_millis(RETRIEVE_DEADLINE_MS));
    let result = service.retrieve(prompt, &opts);

    if result.context.is_empty() {
        return Ok(HookOutput::empty());
    }
    // The context is being injected: this is the moment the access
    // counters move
    service.increment_access_count(&result.event_ids)?;
    Ok(HookOutput::with_context(result.context))
}

fn on_stop(router: &ProjectRouter, session_id: &str, input: &HookInput) -> HookResult {
    let service = router.get_service_for_session(session_id)?;

    if let Some(path) = &input.transcript_path {
        match transcript::read_assistant_texts(&PathBuf::from(path)) {
            Ok(texts) => {
                if let Some(last) = texts.last() {
                    if service.config().features.auto_save && !last.trim().is_empty() {
                        service.append_event(
                            EventType::AgentResponse,
                            session_id,
                            last,
                            serde_json::Value::Null,
                        )?;
                    }
                }
            }
            Err(e) => tracing::debug!("Transcript read failed: {}", e),
        }
    }

    // Stop runs outside the prompt path; spend the slack indexing
    service.drain_outbox();
    Ok(HookOutput::empty())
}

fn on_session_end(router: &ProjectRouter, session_id: &str, input: &HookInput) -> HookResult {
    let service = router.get_service_for_session(session_id)?;
    service.end_session(session_id, input.summary.as_deref())?;
    service.drain_outbox();
    Ok(HookOutput::empty())
}

fn on_post_tool_use(router: &ProjectRouter, session_id: &str, input: &HookInput) -> HookResult {
    let Some(tool_name) = &input.tool_name else {
        return Ok(HookOutput::empty());
    };
    let service = router.get_service_for_session(session_id)?;
    let config = service.config().tool_observation.clone();

    if !config.enabled || config.excluded_tools.iter().any(|t| t == tool_name) {
        return Ok(HookOutput::empty());
    }

    let response = input.tool_response.clone().unwrap_or_default();
    if response.is_image.unwrap_or(false) {
        return Ok(HookOutput::empty());
    }
    let interrupted = response.interrupted.unwrap_or(false);
    let failed = interrupted
        || response
            .stderr
            .as_deref()
            .is_some_and(|s| !s.trim().is_empty());
    if config.store_only_on_success && failed {
        return Ok(HookOutput::empty());
    }

    let mut output = String::new();
    if let Some(stdout) = &response.stdout {
        output.push_str(stdout);
    }
    if let Some(content) = &response.content {
        if !output.is_empty() {
            output.push('\n');
        }
        match content.as_str() {
            Some(text) => output.push_str(text),
            None => output.push_str(&content.to_string()),
        }
    }
    if let Some(stderr) = &response.stderr {
        if !stderr.trim().is_empty() {
            if !output.is_empty() {
                output.push('\n');
            }
            output.push_str("stderr: ");
            output.push_str(stderr);
        }
    }
    let output = truncate_output(&output, config.max_output_length, config.max_output_lines);
    if output.trim().is_empty() {
        return Ok(HookOutput::empty());
    }

    let content = format!("[{}] {}", tool_name, output);
    let metadata = serde_json::json!({
        "tool_name": tool_name,
        "tool_use_id": input.tool_use_id,
        "interrupted": interrupted,
    });
    service.append_event(EventType::ToolObservation, session_id, &content, metadata)?;
    Ok(HookOutput::empty())
}

/// Clamp tool output to the configured line and byte budgets
fn truncate_output(output: &str, max_length: usize, max_lines: usize) -> String {
    let mut clipped: String = output
        .lines()
        .take(max_lines.max(1))
        .collect::<Vec<_>>()
        .join("\n");
    if clipped.len() > max_length {
        let mut end = max_length;
        while end > 0 && !clipped.is_char_boundary(end) {
            end -= 1;
        }
        clipped.truncate(end);
        clipped.push_str("…");
    }
    clipped
}

// ============================================================================
// TESTS
// ============================================================================
