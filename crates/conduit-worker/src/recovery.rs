//! Retry/resume state machine for one turn.
//!
//! ```text
//! Initial ──protocol error──▶ Fresh
//!    │
//!    └──process death──▶ Resume ──any failure──▶ Fresh ──failure──▶ give up
//! ```
//!
//! Launch failures on `Initial` or `Fresh` degrade that attempt to a one-shot
//! invocation whose result is final. Cancellation stops immediately.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use conduit_core::AgentSessionId;
use conduit_core::metric_names::{ONE_SHOT_FALLBACKS_TOTAL, TURN_RECOVERIES_TOTAL};

use crate::backend::{AgentBackend, LineSink};
use crate::command::TurnParams;
use crate::errors::{FailureKind, WorkerError};

/// Stage of the recovery state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Attempt {
    /// First try, honouring the caller's resume hint.
    Initial,
    /// Same token, `--resume`.
    Resume,
    /// New token, no resume.
    Fresh,
}

impl Attempt {
    /// Label for logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::Resume => "resume",
            Self::Fresh => "fresh",
        }
    }
}

/// What happened to a turn.
#[derive(Debug)]
pub struct TurnOutcome {
    /// Result of the last attempt.
    pub result: Result<(), WorkerError>,
    /// Token in effect at the end; differs from the input after a fresh retry.
    pub agent_session_id: AgentSessionId,
    /// Stages tried, in order.
    pub attempts: Vec<Attempt>,
    /// Whether the last attempt ran as a one-shot invocation.
    pub one_shot: bool,
}

impl TurnOutcome {
    /// Number of recovery attempts after the initial one.
    pub fn recoveries(&self) -> usize {
        self.attempts.len().saturating_sub(1)
    }
}

fn next_stage(current: Attempt, kind: FailureKind) -> Option<Attempt> {
    match (current, kind) {
        (_, FailureKind::Cancelled) | (Attempt::Fresh, _) => None,
        (Attempt::Initial, FailureKind::Protocol) => Some(Attempt::Fresh),
        (Attempt::Initial, FailureKind::ProcessDeath) => Some(Attempt::Resume),
        (Attempt::Initial, FailureKind::Launch | FailureKind::Other) => None,
        (Attempt::Resume, _) => Some(Attempt::Fresh),
    }
}

/// Drives one turn through the recovery stages.
pub struct RecoveryOrchestrator {
    backend: Arc<dyn AgentBackend>,
}

impl RecoveryOrchestrator {
    /// Orchestrator over `backend`.
    pub fn new(backend: Arc<dyn AgentBackend>) -> Self {
        Self { backend }
    }

    /// Run `query`, retrying per the state machine. Lines from every attempt
    /// go to `on_line`.
    #[instrument(skip_all, fields(session_id = %params.session_id))]
    pub async fn run(
        &self,
        params: TurnParams,
        query: &str,
        cancel: &CancellationToken,
        on_line: &mut LineSink<'_>,
    ) -> TurnOutcome {
        let mut params = params;
        let mut stage = Attempt::Initial;
        let mut attempts = Vec::new();

        loop {
            attempts.push(stage);
            match stage {
                Attempt::Initial => {}
                Attempt::Resume => {
                    self.backend.discard(params.session_id);
                    params.resume = true;
                }
                Attempt::Fresh => {
                    self.backend.discard(params.session_id);
                    params.agent_session_id = AgentSessionId::generate();
                    params.resume = false;
                }
            }

            let result = match self.backend.acquire(&params) {
                Ok(worker) => worker.send(query, cancel, on_line).await,
                Err(error) if stage == Attempt::Resume => Err(error),
                Err(error) => {
                    warn!(attempt = stage.as_str(), %error, "no worker, falling back to one-shot");
                    metrics::counter!(ONE_SHOT_FALLBACKS_TOTAL).increment(1);
                    let result = self.backend.one_shot(&params, query, cancel, on_line).await;
                    return TurnOutcome {
                        result,
                        agent_session_id: params.agent_session_id,
                        attempts,
                        one_shot: true,
                    };
                }
            };

            let error = match result {
                Ok(()) => {
                    return TurnOutcome {
                        result: Ok(()),
                        agent_session_id: params.agent_session_id,
                        attempts,
                        one_shot: false,
                    };
                }
                Err(error) => error,
            };

            let Some(next) = next_stage(stage, error.failure_kind()) else {
                if !error.is_cancelled() {
                    warn!(attempt = stage.as_str(), %error, "turn failed, giving up");
                }
                return TurnOutcome {
                    result: Err(error),
                    agent_session_id: params.agent_session_id,
                    attempts,
                    one_shot: false,
                };
            };

            info!(
                from = stage.as_str(),
                to = next.as_str(),
                category = error.category(),
                %error,
                "recovering turn"
            );
            metrics::counter!(TURN_RECOVERIES_TOTAL, "stage" => next.as_str()).increment(1);
            stage = next;
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
