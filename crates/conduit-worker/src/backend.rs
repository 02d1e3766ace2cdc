//! Seams between the recovery orchestrator and real processes.
//!
//! The orchestrator only sees [`AgentBackend`] and [`AgentWorker`], so its
//! state machine can be driven by fault-injecting fakes in tests.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use conduit_core::SessionId;

use crate::command::{LaunchConfig, TurnParams};
use crate::errors::WorkerError;
use crate::oneshot::run_one_shot;
use crate::pool::WorkerPool;
use crate::worker::Worker;

/// Callback receiving each raw output line of a turn.
pub type LineSink<'a> = dyn FnMut(&str) + Send + 'a;

/// Something that can run one turn.
#[async_trait]
pub trait AgentWorker: Send + Sync {
    /// Write the query and forward output lines until the turn ends.
    async fn send(
        &self,
        query: &str,
        cancel: &CancellationToken,
        on_line: &mut LineSink<'_>,
    ) -> Result<(), WorkerError>;
}

/// Source of workers plus the one-shot fallback.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    /// Obtain the session's worker, creating it if needed.
    fn acquire(&self, params: &TurnParams) -> Result<Arc<dyn AgentWorker>, WorkerError>;

    /// Kill and forget the session's worker.
    fn discard(&self, session_id: SessionId);

    /// Run the turn as a single invocation.
    async fn one_shot(
        &self,
        params: &TurnParams,
        query: &str,
        cancel: &CancellationToken,
        on_line: &mut LineSink<'_>,
    ) -> Result<(), WorkerError>;
}

#[async_trait]
impl AgentWorker for Worker {
    async fn send(
        &self,
        query: &str,
        cancel: &CancellationToken,
        on_line: &mut LineSink<'_>,
    ) -> Result<(), WorkerError> {
        Worker::send(self, query, cancel, on_line).await
    }
}

/// Backend over real agent processes.
///
/// Without a pool every acquire reports [`WorkerError::Unavailable`], which
/// sends the orchestrator straight to one-shot invocations.
pub struct ProcessBackend {
    pool: Option<Arc<WorkerPool>>,
    launch: LaunchConfig,
}

impl ProcessBackend {
    /// Backend using persistent workers from `pool`.
    pub fn pooled(pool: Arc<WorkerPool>) -> Self {
        let launch = pool.launch_config().clone();
        Self {
            pool: Some(pool),
            launch,
        }
    }

    /// Backend that only ever runs one-shot invocations.
    pub fn one_shot_only(launch: LaunchConfig) -> Self {
        Self { pool: None, launch }
    }

    /// The pool, when configured.
    pub fn pool(&self) -> Option<&Arc<WorkerPool>> {
        self.pool.as_ref()
    }
}

#[async_trait]
impl AgentBackend for ProcessBackend {
    fn acquire(&self, params: &TurnParams) -> Result<Arc<dyn AgentWorker>, WorkerError> {
        let pool = self.pool.as_ref().ok_or(WorkerError::Unavailable)?;
        let worker: Arc<dyn AgentWorker> = pool.get_or_create(params)?;
        Ok(worker)
    }

    fn discard(&self, session_id: SessionId) {
        if let Some(pool) = &self.pool {
            let _ = pool.kill(session_id);
        }
    }

    async fn one_shot(
        &self,
        params: &TurnParams,
        query: &str,
        cancel: &CancellationToken,
        on_line: &mut LineSink<'_>,
    ) -> Result<(), WorkerError> {
        run_one_shot(&self.launch, params, query, cancel, on_line).await
    }
}
