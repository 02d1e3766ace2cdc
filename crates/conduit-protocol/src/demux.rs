//! Per-turn demultiplexer.
//!
//! [`TurnDemux`] consumes raw agent output lines and produces the outbound
//! [`EventKind`]s a viewer sees, while accumulating everything the scheduler
//! persists when the turn ends: response text, a capped reasoning summary,
//! completed tool steps, token usage and a proposed title.
//!
//! Tool blocks are correlated by their block index: the index is bound to a
//! tool id on `content_block_start` and released on `content_block_stop`.
//! Text and thinking blocks never bind an index, so a stop for them is a no-op.

use std::collections::HashMap;

use serde_json::Value;
use tracing::{debug, warn};

use conduit_core::{EventKind, StepRecord, TokenUsage, TurnMetadata};

use crate::types::{
    AgentLine, AssistantEcho, BlockDelta, BlockHeader, EchoBlock, ResultHeader, ResultLine,
    StreamPayload,
};

/// Default cap on the persisted reasoning summary, in characters.
pub const DEFAULT_THINKING_SUMMARY_CHARS: usize = 500;

/// Default cap on a step record's argument text, in characters.
pub const DEFAULT_STEP_INPUT_CHARS: usize = 1000;

/// Accumulation limits.
#[derive(Clone, Copy, Debug)]
pub struct DemuxLimits {
    /// Characters of reasoning kept for the summary.
    pub thinking_summary_chars: usize,
    /// Characters of tool arguments kept per step.
    pub step_input_chars: usize,
}

impl Default for DemuxLimits {
    fn default() -> Self {
        Self {
            thinking_summary_chars: DEFAULT_THINKING_SUMMARY_CHARS,
            step_input_chars: DEFAULT_STEP_INPUT_CHARS,
        }
    }
}

#[derive(Clone, Debug)]
struct OpenTool {
    id: String,
    name: String,
    input: String,
}

/// Accumulated state for one turn.
#[derive(Debug, Default)]
pub struct TurnDemux {
    limits: DemuxLimits,
    text: String,
    thinking: String,
    thinking_chars: usize,
    open_tools: HashMap<usize, OpenTool>,
    steps: Vec<StepRecord>,
    usage: TokenUsage,
    title: Option<String>,
    result_text: Option<String>,
    echo_text: String,
    finished: bool,
    skipped_lines: usize,
}

impl TurnDemux {
    /// Create a demultiplexer with default limits.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a demultiplexer with explicit limits.
    pub fn with_limits(limits: DemuxLimits) -> Self {
        Self {
            limits,
            ..Self::default()
        }
    }

    /// Feed one raw output line and return the events to route.
    ///
    /// Blank lines are ignored. Malformed lines are logged and skipped, except
    /// a `result` line, which still ends the turn with whatever decodes.
    pub fn process_line(&mut self, line: &str) -> Vec<EventKind> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return vec![];
        }
        match serde_json::from_str::<AgentLine>(trimmed) {
            Ok(decoded) => self.process(decoded),
            Err(error) => {
                if let Some(header) = ResultHeader::parse(trimmed) {
                    warn!(%error, "result line partly malformed, ending turn");
                    return self.process_result(header.into_result_line());
                }
                self.skipped_lines += 1;
                warn!(%error, line_len = trimmed.len(), "skipping malformed agent line");
                vec![]
            }
        }
    }

    /// Feed one decoded line.
    pub fn process(&mut self, line: AgentLine) -> Vec<EventKind> {
        match line {
            AgentLine::Error { error, message } => {
                let message = error_message(error.as_ref())
                    .or_else(|| error_message(message.as_ref()))
                    .unwrap_or_else(|| "unknown agent error".to_string());
                warn!(%message, "agent reported error");
                vec![EventKind::Error { message }]
            }
            AgentLine::StreamEvent { event } => self.process_payload(event),
            AgentLine::Result(result) => self.process_result(result),
            AgentLine::Assistant { message } => {
                if let Some(echo) = message {
                    self.absorb_echo(&echo);
                }
                vec![]
            }
            AgentLine::Other => vec![],
        }
    }

    fn process_payload(&mut self, payload: StreamPayload) -> Vec<EventKind> {
        for sample in payload.usage_samples() {
            self.usage.add(&TokenUsage::from(sample));
        }

        match payload {
            StreamPayload::ContentBlockStart {
                index,
                content_block: BlockHeader::ToolUse { id, name },
            } => {
                let _ = self.open_tools.insert(
                    index,
                    OpenTool {
                        id: id.clone(),
                        name: name.clone(),
                        input: String::new(),
                    },
                );
                vec![EventKind::ToolStart { id, name }]
            }
            StreamPayload::ContentBlockDelta { index, delta } => self.process_delta(index, delta),
            StreamPayload::ContentBlockStop { index } => match self.open_tools.remove(&index) {
                Some(tool) => {
                    let id = tool.id.clone();
                    self.steps.push(StepRecord {
                        id: tool.id,
                        name: tool.name,
                        input: truncate_chars(&tool.input, self.limits.step_input_chars),
                    });
                    vec![EventKind::ToolResult { id }]
                }
                None => vec![],
            },
            _ => vec![],
        }
    }

    fn process_delta(&mut self, index: usize, delta: BlockDelta) -> Vec<EventKind> {
        match delta {
            BlockDelta::TextDelta { text } => {
                self.text.push_str(&text);
                vec![EventKind::Chunk { content: text }]
            }
            BlockDelta::ThinkingDelta { thinking } => {
                self.append_thinking(&thinking);
                vec![EventKind::Thinking { content: thinking }]
            }
            BlockDelta::InputJsonDelta { partial_json } => match self.open_tools.get_mut(&index) {
                Some(tool) => {
                    tool.input.push_str(&partial_json);
                    vec![EventKind::ToolInput {
                        id: tool.id.clone(),
                        partial: partial_json,
                    }]
                }
                None => {
                    debug!(index, "input delta for unknown block, ignoring");
                    vec![]
                }
            },
            BlockDelta::Other => vec![],
        }
    }

    fn process_result(&mut self, result: ResultLine) -> Vec<EventKind> {
        self.finished = true;
        if let Some(usage) = result.usage.as_ref() {
            self.usage.add(&TokenUsage::from(usage));
        }
        if let Some(text) = result.text() {
            self.result_text = Some(text.to_string());
        }

        let mut events = Vec::new();
        if result.is_failure() && !result.is_execution_error() {
            let message = result
                .text()
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .or_else(|| result.subtype.clone())
                .unwrap_or_else(|| "agent turn failed".to_string());
            events.push(EventKind::Error { message });
        }
        if let Some(title) = result.title.filter(|t| !t.trim().is_empty()) {
            self.title = Some(title.clone());
            events.push(EventKind::SessionTitleUpdate { title });
        }
        events
    }

    fn absorb_echo(&mut self, echo: &AssistantEcho) {
        for block in &echo.content {
            if let EchoBlock::Text { text } = block {
                self.echo_text.push_str(text);
            }
        }
    }

    fn append_thinking(&mut self, fragment: &str) {
        let room = self
            .limits
            .thinking_summary_chars
            .saturating_sub(self.thinking_chars);
        if room == 0 {
            return;
        }
        let kept: String = fragment.chars().take(room).collect();
        self.thinking_chars += kept.chars().count();
        self.thinking.push_str(&kept);
    }

    // ── Accessors ───────────────────────────────────────────────────

    /// Text to persist as the assistant reply.
    ///
    /// Incremental text wins; otherwise the `result` text; otherwise the
    /// joined `assistant` echoes.
    pub fn final_text(&self) -> String {
        if !self.text.is_empty() {
            return self.text.clone();
        }
        if let Some(text) = self.result_text.as_ref().filter(|t| !t.is_empty()) {
            return text.clone();
        }
        self.echo_text.clone()
    }

    /// Text received incrementally so far.
    pub fn streamed_text(&self) -> &str {
        &self.text
    }

    /// Token usage accumulated so far.
    pub fn usage(&self) -> TokenUsage {
        self.usage
    }

    /// Title proposed by the agent, if any.
    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }

    /// Completed tool steps in completion order.
    pub fn steps(&self) -> &[StepRecord] {
        &self.steps
    }

    /// Capped reasoning summary.
    pub fn thinking_summary(&self) -> &str {
        &self.thinking
    }

    /// Whether a terminal `result` line has been seen.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Number of malformed lines skipped.
    pub fn skipped_lines(&self) -> usize {
        self.skipped_lines
    }

    /// Metadata to store with the assistant message.
    pub fn metadata(&self) -> TurnMetadata {
        TurnMetadata {
            steps: self.steps.clone(),
            thinking: (!self.thinking.is_empty()).then(|| self.thinking.clone()),
        }
    }
}

/// Pull a human-readable message out of an error payload.
fn error_message(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Object(map) => match map.get("message") {
            Some(Value::String(s)) => Some(s.clone()),
            _ => Some(Value::Object(map.clone()).to_string()),
        },
        Value::Null | Value::String(_) => None,
        other => Some(other.to_string()),
    }
}

/// Keep at most `max` characters, cutting on a char boundary.
pub fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((byte_idx, _)) => s[..byte_idx].to_string(),
        None => s.to_string(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
