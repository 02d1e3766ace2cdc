//! # conduit-worker
//!
//! Runs the agent CLI on behalf of sessions.
//!
//! - [`Worker`]: one persistent process per session, fed turn by turn over stdin
//! - [`WorkerPool`]: keyed registry with idle reaping
//! - [`run_one_shot`]: single invocation used when no worker can be had
//! - [`RecoveryOrchestrator`]: resume/fresh retry state machine around a turn
//! - [`AgentBackend`] / [`AgentWorker`]: the seams the orchestrator drives

#![deny(unsafe_code)]

pub mod backend;
pub mod command;
pub mod errors;
pub mod oneshot;
pub mod pool;
pub mod recovery;
pub mod worker;

#[cfg(test)]
mod testing;

pub use backend::{AgentBackend, AgentWorker, LineSink, ProcessBackend};
pub use command::{AgentCommand, LaunchConfig, SESSION_ID_VAR, TurnParams};
pub use errors::{FailureKind, WorkerError};
pub use oneshot::run_one_shot;
pub use pool::{PoolConfig, WorkerPool};
pub use recovery::{Attempt, RecoveryOrchestrator, TurnOutcome};
pub use worker::{Worker, WorkerInfo, WorkerState};
