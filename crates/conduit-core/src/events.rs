//! Wire events exchanged with viewers.
//!
//! Two directions:
//!
//! - **[`HubEvent`]**: outbound. Produced while a turn runs (content deltas,
//!   tool lifecycle, completion) or when a session's lifecycle changes
//!   (title, queued message, streaming status).
//! - **[`ClientMessage`]**: inbound. What a connected viewer may ask for.
//!
//! Every outbound event serializes flat, with its kind under `"type"`:
//! `{"type":"chunk","session_id":7,"timestamp":"…","content":"Hel"}`.

use serde::{Deserialize, Serialize};

use crate::ids::SessionId;

// ─────────────────────────────────────────────────────────────────────────────
// Outbound
// ─────────────────────────────────────────────────────────────────────────────

/// Whether a session currently has a turn in flight.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamingStatus {
    /// No turn in flight.
    Idle,
    /// A turn is producing output.
    Streaming,
}

/// Payload of an outbound event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// Incremental response text.
    Chunk {
        /// Text fragment.
        content: String,
    },
    /// Incremental reasoning text.
    Thinking {
        /// Reasoning fragment.
        content: String,
    },
    /// A tool call block opened.
    ToolStart {
        /// Tool call id assigned by the agent.
        id: String,
        /// Tool name.
        name: String,
    },
    /// A fragment of a tool call's JSON arguments.
    ToolInput {
        /// Tool call id.
        id: String,
        /// Raw JSON fragment.
        partial: String,
    },
    /// A tool call block closed.
    ToolResult {
        /// Tool call id.
        id: String,
    },
    /// Something went wrong during the turn.
    Error {
        /// Human-readable description.
        message: String,
    },
    /// The turn finished (successfully or not).
    Done,
    /// The agent proposed a session title.
    SessionTitleUpdate {
        /// New title.
        title: String,
    },
    /// A session started or stopped streaming.
    StreamingStatus {
        /// Current status.
        status: StreamingStatus,
    },
    /// A message arrived while the session was busy and will run next.
    MessageQueued {
        /// Queued message text.
        content: String,
    },
    /// A session was created from a viewer's first message.
    SessionCreated {
        /// Initial title.
        title: String,
    },
}

/// Who receives an event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    /// Every connected viewer.
    Broadcast,
    /// Only the viewer attached to the session's active stream.
    Subscriber,
}

impl EventKind {
    /// Routing class for events produced by a turn or a lifecycle change.
    ///
    /// `streaming_status` sent as a subscription acknowledgement bypasses
    /// this and goes straight to the subscribing viewer.
    pub fn delivery(&self) -> Delivery {
        match self {
            Self::SessionTitleUpdate { .. }
            | Self::StreamingStatus { .. }
            | Self::MessageQueued { .. }
            | Self::SessionCreated { .. } => Delivery::Broadcast,
            _ => Delivery::Subscriber,
        }
    }

    /// Wire name of this event kind.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Chunk { .. } => "chunk",
            Self::Thinking { .. } => "thinking",
            Self::ToolStart { .. } => "tool_start",
            Self::ToolInput { .. } => "tool_input",
            Self::ToolResult { .. } => "tool_result",
            Self::Error { .. } => "error",
            Self::Done => "done",
            Self::SessionTitleUpdate { .. } => "session_title_update",
            Self::StreamingStatus { .. } => "streaming_status",
            Self::MessageQueued { .. } => "message_queued",
            Self::SessionCreated { .. } => "session_created",
        }
    }
}

/// An outbound event bound to a session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HubEvent {
    /// Session the event belongs to.
    pub session_id: SessionId,
    /// RFC 3339 creation time.
    pub timestamp: String,
    /// Event payload.
    #[serde(flatten)]
    pub kind: EventKind,
}

impl HubEvent {
    /// Stamp an event with the current UTC time.
    pub fn now(session_id: SessionId, kind: EventKind) -> Self {
        Self {
            session_id,
            timestamp: chrono::Utc::now().to_rfc3339(),
            kind,
        }
    }

    /// `streaming_status` event for a session.
    pub fn status(session_id: SessionId, status: StreamingStatus) -> Self {
        Self::now(session_id, EventKind::StreamingStatus { status })
    }

    /// Serialize to the JSON text sent on the wire.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Inbound
// ─────────────────────────────────────────────────────────────────────────────

/// A message sent by a viewer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Attach to a session's in-flight turn.
    Subscribe {
        /// Session to watch.
        session_id: SessionId,
    },
    /// Cancel a session's in-flight turn. Defaults to the subscribed session.
    Stop {
        /// Session to stop.
        #[serde(default)]
        session_id: Option<SessionId>,
    },
    /// Restart the agent conversation from a recap of recent messages.
    /// Defaults to the subscribed session.
    Compress {
        /// Session to compress.
        #[serde(default)]
        session_id: Option<SessionId>,
    },
    /// Submit a message. Creates a session when `session_id` is absent.
    Chat {
        /// Target session.
        #[serde(default)]
        session_id: Option<SessionId>,
        /// Message text.
        content: String,
        /// Working directory for a newly created session.
        #[serde(default)]
        work_dir: Option<String>,
    },
    /// Application-level keepalive.
    Ping,
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
