//! Runtime error types.

use conduit_core::SessionId;
use conduit_worker::WorkerError;

use crate::store::StoreError;

/// Errors surfaced by the turn scheduler.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// The session does not exist in storage.
    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),

    /// The session has a turn in flight.
    #[error("Session is streaming: {0}")]
    SessionStreaming(SessionId),

    /// Storage collaborator failure.
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    /// Agent process failure.
    #[error(transparent)]
    Worker(#[from] WorkerError),
}

impl RuntimeError {
    /// Error category string for logs and client errors.
    pub fn category(&self) -> &'static str {
        match self {
            Self::SessionNotFound(_) => "session_not_found",
            Self::SessionStreaming(_) => "session_streaming",
            Self::Store(_) => "store",
            Self::Worker(e) => e.category(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories() {
        assert_eq!(
            RuntimeError::SessionNotFound(SessionId::new(3)).category(),
            "session_not_found"
        );
        assert_eq!(
            RuntimeError::SessionStreaming(SessionId::new(3)).category(),
            "session_streaming"
        );
        assert_eq!(RuntimeError::from(WorkerError::Busy).category(), "busy");
        assert_eq!(
            RuntimeError::from(StoreError::Backend("disk".into())).to_string(),
            "Storage error: Storage backend error: disk"
        );
    }

    #[test]
    fn worker_errors_display_transparently() {
        let err = RuntimeError::from(WorkerError::Unavailable);
        assert_eq!(err.to_string(), "Worker pool unavailable");
    }
}
