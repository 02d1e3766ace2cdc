//! Agent CLI stream-json event structures.
//!
//! The CLI writes one JSON object per line. Top-level kinds are `error`,
//! `stream_event` (wrapping a raw Messages API streaming event), `result`
//! (terminal) and `assistant` (full message echo). Anything else, and any
//! unknown inner kind, decodes to an `Other` variant and is ignored.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use conduit_core::TokenUsage;

/// Result subtype reported when the agent hit an execution error mid-turn.
pub const SUBTYPE_ERROR_DURING_EXECUTION: &str = "error_during_execution";

/// Result subtype for a normal completion.
pub const SUBTYPE_SUCCESS: &str = "success";

// ─────────────────────────────────────────────────────────────────────────────
// Top-level lines
// ─────────────────────────────────────────────────────────────────────────────

/// One decoded output line.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentLine {
    /// Error reported by the CLI.
    Error {
        /// String or `{message: …}` object.
        #[serde(default)]
        error: Option<Value>,
        /// Alternate location of the message.
        #[serde(default)]
        message: Option<Value>,
    },
    /// Wrapped Messages API streaming event.
    StreamEvent {
        /// The inner event.
        event: StreamPayload,
    },
    /// Terminal summary of the turn.
    Result(ResultLine),
    /// Full assistant message echo.
    Assistant {
        /// The echoed message.
        #[serde(default)]
        message: Option<AssistantEcho>,
    },
    /// Any other kind (`system`, `user`, …).
    #[serde(other)]
    Other,
}

/// Body of a `result` line.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ResultLine {
    /// `success`, `error_during_execution`, `error_max_turns`, …
    #[serde(default)]
    pub subtype: Option<String>,
    /// Whether the CLI flagged the result as an error.
    #[serde(default)]
    pub is_error: bool,
    /// Full response text.
    #[serde(default)]
    pub result: Option<Value>,
    /// Proposed session title.
    #[serde(default, alias = "session_title")]
    pub title: Option<String>,
    /// Token usage for the turn.
    #[serde(default)]
    pub usage: Option<UsageFields>,
}

impl ResultLine {
    /// Response text when it is a string.
    pub fn text(&self) -> Option<&str> {
        self.result.as_ref().and_then(Value::as_str)
    }

    /// Whether this result reports a recoverable protocol-level failure.
    pub fn is_execution_error(&self) -> bool {
        self.subtype.as_deref() == Some(SUBTYPE_ERROR_DURING_EXECUTION)
    }

    /// Whether this result reports any failure.
    pub fn is_failure(&self) -> bool {
        self.is_error
            || self
                .subtype
                .as_deref()
                .is_some_and(|s| s != SUBTYPE_SUCCESS)
    }
}

/// `assistant` message echo.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct AssistantEcho {
    /// Content blocks.
    #[serde(default)]
    pub content: Vec<EchoBlock>,
    /// Usage on the echo. Never counted; kept for diagnostics.
    #[serde(default)]
    pub usage: Option<UsageFields>,
}

/// Content block inside an `assistant` echo.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EchoBlock {
    /// Text block.
    Text {
        /// Block text.
        text: String,
    },
    /// Any non-text block.
    #[serde(other)]
    Other,
}

// ─────────────────────────────────────────────────────────────────────────────
// Wrapped streaming events
// ─────────────────────────────────────────────────────────────────────────────

/// Inner event of a `stream_event` line.
///
/// Usage may appear directly (`usage`) or nested (`message.usage`) on any of
/// the three message-level events.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamPayload {
    /// First event of a model response.
    MessageStart {
        /// Message object.
        #[serde(default)]
        message: Option<PayloadMessage>,
        /// Top-level usage.
        #[serde(default)]
        usage: Option<UsageFields>,
    },
    /// Message-level update.
    MessageDelta {
        /// Message object.
        #[serde(default)]
        message: Option<PayloadMessage>,
        /// Top-level usage.
        #[serde(default)]
        usage: Option<UsageFields>,
    },
    /// Last event of a model response.
    MessageStop {
        /// Message object.
        #[serde(default)]
        message: Option<PayloadMessage>,
        /// Top-level usage.
        #[serde(default)]
        usage: Option<UsageFields>,
    },
    /// A content block opened.
    ContentBlockStart {
        /// Block position within the response.
        index: usize,
        /// Block header.
        content_block: BlockHeader,
    },
    /// Incremental content for an open block.
    ContentBlockDelta {
        /// Block position.
        index: usize,
        /// Delta payload.
        delta: BlockDelta,
    },
    /// A content block closed.
    ContentBlockStop {
        /// Block position.
        index: usize,
    },
    /// `ping` and anything unrecognized.
    #[serde(other)]
    Other,
}

impl StreamPayload {
    /// Usage samples carried by this event (top-level first, then nested).
    pub fn usage_samples(&self) -> impl Iterator<Item = &UsageFields> {
        let (message, usage) = match self {
            Self::MessageStart { message, usage }
            | Self::MessageDelta { message, usage }
            | Self::MessageStop { message, usage } => (message.as_ref(), usage.as_ref()),
            _ => (None, None),
        };
        usage
            .into_iter()
            .chain(message.and_then(|m| m.usage.as_ref()))
    }
}

/// Message object nested in message-level events.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct PayloadMessage {
    /// Usage counters.
    #[serde(default)]
    pub usage: Option<UsageFields>,
}

/// Header of a content block.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockHeader {
    /// A tool call.
    ToolUse {
        /// Tool call id.
        id: String,
        /// Tool name.
        name: String,
    },
    /// Text, thinking, and anything else.
    #[serde(other)]
    Other,
}

/// Delta payload of a content block.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockDelta {
    /// Response text fragment.
    TextDelta {
        /// Fragment.
        text: String,
    },
    /// Reasoning text fragment.
    ThinkingDelta {
        /// Fragment.
        thinking: String,
    },
    /// Tool argument JSON fragment.
    InputJsonDelta {
        /// Fragment.
        partial_json: String,
    },
    /// Signatures and anything else.
    #[serde(other)]
    Other,
}

/// Raw usage counters. Missing or `null` fields count as zero.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageFields {
    /// Input tokens.
    #[serde(default)]
    pub input_tokens: Option<u64>,
    /// Output tokens.
    #[serde(default)]
    pub output_tokens: Option<u64>,
    /// Cache write tokens.
    #[serde(default)]
    pub cache_creation_input_tokens: Option<u64>,
    /// Cache read tokens.
    #[serde(default)]
    pub cache_read_input_tokens: Option<u64>,
}

impl From<&UsageFields> for TokenUsage {
    fn from(u: &UsageFields) -> Self {
        TokenUsage {
            input_tokens: u.input_tokens.unwrap_or(0),
            output_tokens: u.output_tokens.unwrap_or(0),
            cache_creation_input_tokens: u.cache_creation_input_tokens.unwrap_or(0),
            cache_read_input_tokens: u.cache_read_input_tokens.unwrap_or(0),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Input
// ─────────────────────────────────────────────────────────────────────────────

/// The single input line written to a persistent worker per turn:
/// `{"type":"user","message":{"role":"user","content":"…"}}`.
#[derive(Clone, Debug, Serialize)]
pub struct UserInput<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    message: UserInputMessage<'a>,
}

#[derive(Clone, Debug, Serialize)]
struct UserInputMessage<'a> {
    role: &'static str,
    content: &'a str,
}

impl<'a> UserInput<'a> {
    /// Wrap a query.
    pub fn new(content: &'a str) -> Self {
        Self {
            kind: "user",
            message: UserInputMessage {
                role: "user",
                content,
            },
        }
    }

    /// Encode as one newline-terminated line.
    pub fn to_line(&self) -> serde_json::Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Terminal detection
// ─────────────────────────────────────────────────────────────────────────────

/// How a turn ended, as seen by a worker reading raw lines.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Terminal {
    /// The turn completed (possibly with a non-recoverable error result).
    Completed,
    /// The agent reported an execution error; a fresh session may succeed.
    ExecutionError(String),
}

/// The fields of a `result` line that decide how the turn ended.
///
/// Decoded apart from [`ResultLine`]: a result whose title or usage has an
/// unexpected shape still ends the turn.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ResultHeader {
    #[serde(rename = "type", default)]
    kind: Option<Value>,
    #[serde(default)]
    subtype: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
}

impl ResultHeader {
    /// Decode `line` when it is any JSON object of type `result`.
    pub fn parse(line: &str) -> Option<Self> {
        serde_json::from_str::<Self>(line)
            .ok()
            .filter(|header| header.kind.as_ref().and_then(Value::as_str) == Some("result"))
    }

    /// Result subtype when it is a string.
    pub fn subtype(&self) -> Option<&str> {
        self.subtype.as_ref().and_then(Value::as_str)
    }

    /// Response text when it is a string.
    pub fn text(&self) -> Option<&str> {
        self.result.as_ref().and_then(Value::as_str)
    }

    /// The result without the fields that failed to decode.
    pub fn into_result_line(self) -> ResultLine {
        ResultLine {
            subtype: self.subtype().map(str::to_string),
            result: self.result,
            ..ResultLine::default()
        }
    }
}

/// Inspect a raw line for the terminal `result` event.
///
/// Only `type`, `subtype` and `result` are decoded, so any other field may be
/// malformed. Returns `None` for every non-result line.
pub fn terminal_of(line: &str) -> Option<Terminal> {
    let header = ResultHeader::parse(line)?;
    if header.subtype() == Some(SUBTYPE_ERROR_DURING_EXECUTION) {
        let detail = header
            .text()
            .map_or_else(|| SUBTYPE_ERROR_DURING_EXECUTION.to_string(), str::to_string);
        return Some(Terminal::ExecutionError(detail));
    }
    Some(Terminal::Completed)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
