//! Conversation records shared between the demultiplexer and storage.

use serde::{Deserialize, Serialize};

/// Author of a persisted message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Submitted by a viewer.
    User,
    /// Produced by the agent.
    Assistant,
}

/// One completed tool call observed during a turn.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    /// Tool call id.
    pub id: String,
    /// Tool name.
    pub name: String,
    /// Accumulated JSON arguments, truncated.
    pub input: String,
}

/// Metadata stored alongside an assistant message.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnMetadata {
    /// Tool calls in completion order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<StepRecord>,
    /// Capped summary of the reasoning text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
}

impl TurnMetadata {
    /// True when there is nothing worth persisting.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty() && self.thinking.is_none()
    }
}
