//! Worker error types.

/// Errors raised while launching or driving the agent CLI.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// The process could not be started.
    #[error("Failed to spawn agent: {0}")]
    Spawn(String),

    /// No worker pool is configured.
    #[error("Worker pool unavailable")]
    Unavailable,

    /// The worker is already running a turn.
    #[error("Worker is busy")]
    Busy,

    /// The worker died before the turn started.
    #[error("Worker is dead")]
    Dead,

    /// The process exited (or its output closed) mid-turn.
    #[error("Agent process exited unexpectedly: {detail}")]
    ProcessExited {
        /// Exit status and stderr tail.
        detail: String,
    },

    /// The agent reported a protocol-level execution error.
    #[error("Agent error: {0}")]
    Agent(String),

    /// The turn was cancelled.
    #[error("Turn cancelled")]
    Cancelled,

    /// A one-shot invocation failed.
    #[error("One-shot invocation failed: {0}")]
    OneShot(String),

    /// The query could not be encoded.
    #[error("Failed to encode input: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Coarse failure classes driving recovery decisions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureKind {
    /// The agent answered with an execution error; its session may be poisoned.
    Protocol,
    /// The process is gone.
    ProcessDeath,
    /// No worker could be obtained.
    Launch,
    /// Cancelled by the caller.
    Cancelled,
    /// Anything else.
    Other,
}

impl WorkerError {
    /// Classify the error for recovery.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::Agent(_) => FailureKind::Protocol,
            Self::ProcessExited { .. } | Self::Dead => FailureKind::ProcessDeath,
            Self::Spawn(_) | Self::Unavailable => FailureKind::Launch,
            Self::Cancelled => FailureKind::Cancelled,
            Self::Busy | Self::OneShot(_) | Self::Encode(_) => FailureKind::Other,
        }
    }

    /// Whether the error is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Error category string for logs and metrics labels.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Spawn(_) => "spawn",
            Self::Unavailable => "unavailable",
            Self::Busy => "busy",
            Self::Dead => "dead",
            Self::ProcessExited { .. } => "process_exited",
            Self::Agent(_) => "agent",
            Self::Cancelled => "cancelled",
            Self::OneShot(_) => "one_shot",
            Self::Encode(_) => "encode",
        }
    }
}
