//! Per-session usage captured outside the agent's own stream.
//!
//! An upstream metering proxy sees the real API traffic of a session and may
//! report it here while a turn runs. When the ledger captured nothing for a
//! turn, the scheduler falls back to the demultiplexer's totals.

use dashmap::DashMap;

use conduit_core::{SessionId, TokenUsage};

/// Running usage totals keyed by session.
#[derive(Default)]
pub struct UsageLedger {
    totals: DashMap<SessionId, TokenUsage>,
}

impl UsageLedger {
    /// Empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Zero the session's totals at turn start.
    pub fn reset(&self, session_id: SessionId) {
        let _ = self.totals.insert(session_id, TokenUsage::default());
    }

    /// Add a sample to the session's totals.
    ///
    /// Entry point for the metering collaborator: nothing inside this
    /// workspace calls it. A proxy that forwards the agent's API traffic
    /// reaches the ledger through [`TurnScheduler::ledger`] and reports each
    /// response's usage here. Samples that arrive before the turn starts are
    /// cleared by [`reset`](Self::reset).
    ///
    /// [`TurnScheduler::ledger`]: crate::TurnScheduler::ledger
    pub fn accumulate(&self, session_id: SessionId, sample: &TokenUsage) {
        self.totals.entry(session_id).or_default().add(sample);
    }

    /// Current totals without clearing.
    pub fn peek(&self, session_id: SessionId) -> Option<TokenUsage> {
        self.totals.get(&session_id).map(|u| *u)
    }

    /// Take and clear the session's totals. `None` when nothing was captured.
    pub fn consume(&self, session_id: SessionId) -> Option<TokenUsage> {
        self.totals
            .remove(&session_id)
            .map(|(_, usage)| usage)
            .filter(|usage| !usage.is_empty())
    }
}
